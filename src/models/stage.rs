//! Stage lifecycle model.

use serde::{Deserialize, Serialize};

/// Lifecycle status for one stage.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not started yet.
    Pending,
    /// Start action running or readiness being awaited.
    Starting,
    /// Usable; its teardown is registered.
    Ready,
    /// Start action faulted, readiness failed, or the process died first.
    Failed,
}

impl StageStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Starting)
                | (StageStatus::Starting, StageStatus::Ready | StageStatus::Failed)
        )
    }
}

/// How a stage's process is expected to behave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Runs for the whole session; its exit ends the steady state.
    #[default]
    Service,
    /// Runs to completion during startup and must exit zero.
    Task,
}

/// Snapshot of one stage for observers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StageState {
    /// Stage name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Current status.
    pub status: StageStatus,
}
