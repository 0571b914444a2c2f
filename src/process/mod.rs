//! Process handles and the single spawn interception point.
//!
//! Every external command a session runs is created through
//! [`ProcessFactory`], which tags it for correlation, wires its output
//! through a tee, binds it to the teardown kill broadcasts, and publishes a
//! [`SpawnEvent`] to the registered observers.

pub mod factory;
pub mod output;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};

use crate::orchestrator::correlation::{CorrelationToken, CORRELATION_ENV_VAR};

pub use factory::{KillBroadcast, ProcessFactory, SpawnObserver};
pub use output::{Echo, OutputBuffer};

/// Signals the session sends to the processes it spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// `SIGINT`.
    Interrupt,
    /// `SIGTERM`; the graceful teardown broadcast.
    Terminate,
    /// `SIGKILL`; the forceful teardown broadcast.
    Kill,
}

impl Display for KillSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// How a finished process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Terminating signal number, absent unless killed by a signal.
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Whether the process exited with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub(crate) fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Where a spawned process reads its standard input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinMode {
    /// `/dev/null`.
    #[default]
    Null,
    /// The operator's terminal.
    Inherit,
}

/// Where a spawned process writes stdout and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Straight to the operator's terminal, nothing captured.
    Inherit,
    /// Tee into the handle's [`OutputBuffer`], echoing to the terminal when
    /// `echo` is set.
    Capture {
        /// Mirror captured bytes to the operator.
        echo: bool,
    },
    /// Discarded.
    Null,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self::Capture { echo: true }
    }
}

/// Everything needed to start one external command.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Human-readable name used in logs.
    pub label: String,
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment merged over the inherited one.
    pub env: BTreeMap<String, String>,
    /// Working directory; inherited when absent.
    pub cwd: Option<PathBuf>,
    /// Standard input routing.
    pub stdin: StdinMode,
    /// Standard output and error routing.
    pub output: OutputMode,
}

impl SpawnRequest {
    /// Start a request for `program`, labelled `label` in logs.
    #[must_use]
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge an environment fragment.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Route stdout and stderr.
    #[must_use]
    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Route stdin.
    #[must_use]
    pub fn stdin(mut self, stdin: StdinMode) -> Self {
        self.stdin = stdin;
        self
    }

    /// Correlation token carried in this request's environment, if tagged.
    #[must_use]
    pub fn token(&self) -> Option<CorrelationToken> {
        self.env
            .get(CORRELATION_ENV_VAR)
            .map(|raw| CorrelationToken::from_raw(raw.clone()))
    }

    /// Shell-like rendering of the command line for progress output.
    #[must_use]
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("{part:?}")
                } else {
                    part.to_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Published once for every process the factory creates.
#[derive(Debug, Clone)]
pub struct SpawnEvent {
    /// Handle to the new process.
    pub handle: ProcessHandle,
    /// The request it was spawned from.
    pub request: Arc<SpawnRequest>,
}

impl SpawnEvent {
    /// Correlation token of the spawned process, if tagged.
    #[must_use]
    pub fn token(&self) -> Option<CorrelationToken> {
        self.request.token()
    }
}

#[derive(Debug)]
struct HandleInner {
    pid: u32,
    label: String,
    token: Option<CorrelationToken>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    output: OutputBuffer,
}

/// Shared reference to one spawned OS process.
///
/// The process is owned by the waiter task the factory starts for it; the
/// handle stays valid for as long as any clone is held.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: u32,
        label: String,
        token: Option<CorrelationToken>,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
        kill_tx: mpsc::UnboundedSender<KillSignal>,
        output: OutputBuffer,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                label,
                token,
                exit_rx,
                kill_tx,
                output,
            }),
        }
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Label the process was spawned under.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Correlation token the process was tagged with.
    #[must_use]
    pub fn token(&self) -> Option<&CorrelationToken> {
        self.inner.token.as_ref()
    }

    /// Exit status, absent while the process runs.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit_rx.borrow()
    }

    /// Whether the process has finished.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Exit code, absent while running or when killed by a signal.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_info().and_then(|info| info.code)
    }

    /// Terminating signal, absent unless killed by a signal.
    #[must_use]
    pub fn exit_signal(&self) -> Option<i32> {
        self.exit_info().and_then(|info| info.signal)
    }

    /// Captured output of the process.
    #[must_use]
    pub fn output(&self) -> &OutputBuffer {
        &self.inner.output
    }

    /// Send `signal` to the process. A no-op once it has exited.
    pub fn kill(&self, signal: KillSignal) {
        if self.has_exited() {
            return;
        }
        // The waiter task owns the child; a closed channel means it is gone.
        let _ = self.inner.kill_tx.send(signal);
    }

    /// Resolve once the process has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.inner.exit_rx.clone();
        // The borrowed `Ref` must be released before `rx` goes out of scope.
        let seen = rx
            .wait_for(Option::is_some)
            .await
            .map(|info| *info)
            .ok()
            .flatten();
        seen.unwrap_or_else(ExitInfo::unknown)
    }

    /// Non-owning reference for lookup tables.
    #[must_use]
    pub fn downgrade(&self) -> WeakProcessHandle {
        WeakProcessHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same spawned process.
    #[must_use]
    pub fn same_process(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning counterpart of [`ProcessHandle`].
#[derive(Debug, Clone)]
pub struct WeakProcessHandle {
    inner: Weak<HandleInner>,
}

impl WeakProcessHandle {
    /// Upgrade to a live handle if anything still holds the process.
    #[must_use]
    pub fn upgrade(&self) -> Option<ProcessHandle> {
        self.inner.upgrade().map(|inner| ProcessHandle { inner })
    }

    /// Whether this reference points at `handle`.
    #[must_use]
    pub fn points_to(&self, handle: &ProcessHandle) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&handle.inner))
    }
}
