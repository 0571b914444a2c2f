//! Readiness detection by polling a process's captured output.
//!
//! A stage is ready once its output matches a [`ReadyMatcher`]. The poll
//! loop fails fast when the process exits first and gives up after a fixed
//! number of attempts.

use std::fmt::Debug;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::ProcessHandle;
use crate::{AppError, Result};

/// Decides whether accumulated output signals readiness.
pub trait ReadyMatcher: Send + Sync + Debug {
    /// Whether `output` (everything captured so far) means ready.
    fn is_ready(&self, output: &str) -> bool;

    /// Short description for logs and errors.
    fn describe(&self) -> String;
}

/// Ready once the output contains a fixed string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substring(pub String);

impl ReadyMatcher for Substring {
    fn is_ready(&self, output: &str) -> bool {
        output.contains(&self.0)
    }

    fn describe(&self) -> String {
        format!("{:?}", self.0)
    }
}

/// Ready once the output matches a regular expression.
#[derive(Debug, Clone)]
pub struct Pattern(pub Regex);

impl ReadyMatcher for Pattern {
    fn is_ready(&self, output: &str) -> bool {
        self.0.is_match(output)
    }

    fn describe(&self) -> String {
        format!("/{}/", self.0.as_str())
    }
}

/// Polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessProbe {
    /// Pause between polls.
    pub interval: Duration,
    /// Polls before giving up.
    pub max_attempts: u32,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

impl ReadinessProbe {
    /// Wall-clock window the probe covers.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Poll `handle`'s output until `matcher` accepts it.
///
/// Returns the attempt on which readiness was seen.
///
/// # Errors
///
/// - `AppError::ProcessExitedEarly` if the process exited before matching.
/// - `AppError::ReadinessTimeout` if no match after `probe.max_attempts` polls.
/// - `AppError::Cancelled` if `cancel` fired while polling.
pub async fn wait_for_text(
    handle: &ProcessHandle,
    matcher: &dyn ReadyMatcher,
    probe: ReadinessProbe,
    cancel: &CancellationToken,
) -> Result<u32> {
    let label = handle.label();

    for attempt in 1..=probe.max_attempts {
        if let Some(exit) = handle.exit_info() {
            if matcher.is_ready(&handle.output().text()) {
                return Ok(attempt);
            }
            return Err(exited_early(label, matcher, exit));
        }

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!(
                    "{label}: readiness wait abandoned"
                )));
            }
            exit = handle.wait() => {
                // The pattern may have been printed just before exiting.
                if matcher.is_ready(&handle.output().text()) {
                    return Ok(attempt);
                }
                return Err(exited_early(label, matcher, exit));
            }
            () = tokio::time::sleep(probe.interval) => {}
        }

        if matcher.is_ready(&handle.output().text()) {
            debug!(label, attempt, "readiness pattern observed");
            return Ok(attempt);
        }
        debug!(label, attempt, "not ready yet");
    }

    Err(AppError::ReadinessTimeout(format!(
        "{label} did not print {} within {} attempts ({:?})",
        matcher.describe(),
        probe.max_attempts,
        probe.window()
    )))
}

fn exited_early(
    label: &str,
    matcher: &dyn ReadyMatcher,
    exit: crate::process::ExitInfo,
) -> AppError {
    AppError::ProcessExitedEarly(format!(
        "{label} exited with {exit} before printing {}",
        matcher.describe()
    ))
}
