//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Exit code for a clean stop.
pub const EXIT_CLEAN: i32 = 0;
/// Exit code for any fault that is not signal-initiated.
pub const EXIT_FAULT: i32 = 1;
/// Exit code after `SIGINT` (128 + 2).
pub const EXIT_INTERRUPT: i32 = 130;
/// Exit code after `SIGTERM` (128 + 15).
pub const EXIT_TERMINATE: i32 = 143;

/// Application error enumeration covering all session failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Session file could not be read or parsed.
    Config(String),
    /// Session definition is inconsistent; caught before any process spawns.
    Validation(String),
    /// Pre-flight capability check failed.
    RequiredToolMissing(String),
    /// The OS refused to start a process.
    Spawn(String),
    /// A stage process exited before its readiness pattern was observed.
    ProcessExitedEarly(String),
    /// A stage never reported readiness within its polling window.
    ReadinessTimeout(String),
    /// A tagged spawn was never observed within the grace window.
    CorrelationNotFound(String),
    /// A one-shot stage exited non-zero.
    TaskFailed(String),
    /// A long-running process exited while the session was steady.
    UnexpectedSteadyStateExit(String),
    /// A single teardown step faulted.
    CleanupActionFailed(String),
    /// Any otherwise-unhandled fault anywhere in the process.
    UncaughtFault(String),
    /// Work was abandoned because teardown started.
    Cancelled(String),
    /// File-system or I/O operation failure.
    Io(String),
}

/// Stable discriminant of an [`AppError`], used for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// See [`AppError::Config`].
    Config,
    /// See [`AppError::Validation`].
    Validation,
    /// See [`AppError::RequiredToolMissing`].
    RequiredToolMissing,
    /// See [`AppError::Spawn`].
    Spawn,
    /// See [`AppError::ProcessExitedEarly`].
    ProcessExitedEarly,
    /// See [`AppError::ReadinessTimeout`].
    ReadinessTimeout,
    /// See [`AppError::CorrelationNotFound`].
    CorrelationNotFound,
    /// See [`AppError::TaskFailed`].
    TaskFailed,
    /// See [`AppError::UnexpectedSteadyStateExit`].
    UnexpectedSteadyStateExit,
    /// See [`AppError::CleanupActionFailed`].
    CleanupActionFailed,
    /// See [`AppError::UncaughtFault`].
    UncaughtFault,
    /// See [`AppError::Cancelled`].
    Cancelled,
    /// See [`AppError::Io`].
    Io,
}

impl AppError {
    /// Discriminant of this error.
    #[must_use]
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Config(_) => FaultKind::Config,
            Self::Validation(_) => FaultKind::Validation,
            Self::RequiredToolMissing(_) => FaultKind::RequiredToolMissing,
            Self::Spawn(_) => FaultKind::Spawn,
            Self::ProcessExitedEarly(_) => FaultKind::ProcessExitedEarly,
            Self::ReadinessTimeout(_) => FaultKind::ReadinessTimeout,
            Self::CorrelationNotFound(_) => FaultKind::CorrelationNotFound,
            Self::TaskFailed(_) => FaultKind::TaskFailed,
            Self::UnexpectedSteadyStateExit(_) => FaultKind::UnexpectedSteadyStateExit,
            Self::CleanupActionFailed(_) => FaultKind::CleanupActionFailed,
            Self::UncaughtFault(_) => FaultKind::UncaughtFault,
            Self::Cancelled(_) => FaultKind::Cancelled,
            Self::Io(_) => FaultKind::Io,
        }
    }

    /// Whether this fault aborts the session.
    ///
    /// Only a failed cleanup step is swallowed; it is logged and the rest of
    /// the stack keeps unwinding.
    #[must_use]
    pub fn aborts_session(&self) -> bool {
        !matches!(self, Self::CleanupActionFailed(_))
    }

    /// Process exit code communicating this fault's outcome class.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        EXIT_FAULT
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::RequiredToolMissing(msg) => write!(f, "required tool missing: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::ProcessExitedEarly(msg) => write!(f, "process exited early: {msg}"),
            Self::ReadinessTimeout(msg) => write!(f, "readiness timeout: {msg}"),
            Self::CorrelationNotFound(msg) => write!(f, "correlation not found: {msg}"),
            Self::TaskFailed(msg) => write!(f, "task failed: {msg}"),
            Self::UnexpectedSteadyStateExit(msg) => {
                write!(f, "unexpected steady state exit: {msg}")
            }
            Self::CleanupActionFailed(msg) => write!(f, "cleanup action failed: {msg}"),
            Self::UncaughtFault(msg) => write!(f, "uncaught fault: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid session file: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        Self::Validation(format!("invalid regex: {err}"))
    }
}
