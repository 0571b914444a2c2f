//! Shared helpers for process-spawning integration tests.
//!
//! Every test builds its own `SessionContext` with a recording exit hook, so
//! `run_all` returns instead of exiting the test binary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tunnel_session::orchestrator::stage::terminate_and_await;
use tunnel_session::orchestrator::{
    ContextOptions, Launched, RecordExit, SessionContext, Stage, StageLaunch,
};
use tunnel_session::process::SpawnRequest;
use tunnel_session::AppError;

/// Short grace so teardown-heavy tests stay fast.
pub const TEST_GRACE: Duration = Duration::from_millis(20);

/// Fresh context plus the hook recording its exit code.
pub fn test_context() -> (SessionContext, Arc<RecordExit>) {
    let exit = Arc::new(RecordExit::default());
    let ctx = SessionContext::new(ContextOptions {
        cleanup_grace: TEST_GRACE,
        correlation_timeout: Duration::from_millis(500),
        exit: exit.clone(),
    });
    (ctx, exit)
}

/// `sh -c script`, labelled `label`.
pub fn sh(label: &str, script: &str) -> SpawnRequest {
    SpawnRequest::new(label, "sh").args(["-c", script])
}

/// Order in which teardowns ran.
#[derive(Debug, Clone, Default)]
pub struct TeardownLog(Arc<Mutex<Vec<String>>>);

impl TeardownLog {
    pub fn record(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_owned());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Service stage running `script` whose teardown is recorded in `log`
/// before the default terminate-and-await.
pub fn shell_service(name: &'static str, script: &'static str, log: &TeardownLog) -> Stage {
    let log = log.clone();
    Stage::service(name, move |launch: StageLaunch| async move {
        let handle = launch.spawn(sh(name, script))?;
        Ok::<_, AppError>(Launched::Handle(handle))
    })
    .teardown(move |tc| async move {
        log.record(name);
        terminate_and_await(tc).await
    })
}
