//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::{AppError, FaultKind};

/// Lifecycle status for a session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Stages are being brought up one by one.
    Starting,
    /// Every stage is ready; waiting for a long-running process to exit.
    Steady,
    /// The cleanup stack is unwinding.
    TearingDown,
    /// Teardown finished.
    Terminated,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (
                SessionStatus::Starting,
                SessionStatus::Steady | SessionStatus::TearingDown
            ) | (SessionStatus::Steady, SessionStatus::TearingDown)
                | (SessionStatus::TearingDown, SessionStatus::Terminated)
        )
    }
}

/// Outcome of one session run.
#[derive(Debug)]
pub struct SessionReport {
    /// Session name.
    pub name: String,
    /// Fault that ended the session; `None` for a clean stop.
    pub fault: Option<AppError>,
    /// Exit code handed to the exit hook.
    pub exit_code: i32,
    /// When startup began.
    pub started_at: DateTime<Utc>,
    /// When teardown finished.
    pub ended_at: DateTime<Utc>,
}

impl SessionReport {
    /// Kind of the fault that ended the session.
    #[must_use]
    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.fault.as_ref().map(AppError::kind)
    }

    /// Whether the session stopped without a fault.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fault.is_none()
    }
}
