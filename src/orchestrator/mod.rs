//! Session orchestration modules.
//!
//! Covers correlation of spawned processes, the LIFO cleanup stack and its
//! signal bindings, readiness detection, stage definitions, and the session
//! lifecycle that ties them together.

pub mod cleanup;
pub mod context;
pub mod correlation;
pub mod plan;
pub mod readiness;
pub mod session_manager;
pub mod signals;
pub mod stage;

pub use cleanup::{CleanupHandle, CleanupStack, EntryState, ExitHook, ProcessExit, RecordExit};
pub use context::{ContextOptions, SessionContext};
pub use correlation::{CorrelationRegistry, CorrelationToken};
pub use readiness::{ReadinessProbe, ReadyMatcher};
pub use session_manager::SessionOrchestrator;
pub use stage::{Launched, Stage, StageLaunch, TeardownContext};
