#![forbid(unsafe_code)]

//! Ordered process stages with a teardown that always runs exactly once.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod template;

pub use config::SessionConfig;
pub use errors::{AppError, FaultKind, Result};
