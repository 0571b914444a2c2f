//! Session orchestrator: ordered startup, steady-state wait, teardown.
//!
//! Stages start strictly one after another. A stage becomes `Ready` once its
//! process is resolved, its readiness pattern has been seen (services) or it
//! exited zero (tasks); only then is its teardown pushed on the cleanup
//! stack, so the stack's LIFO order reverses the actual startup order. Once
//! every stage is ready the session is `Steady` until any service exits,
//! which is always a fault.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{select_all, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::errors::EXIT_CLEAN;
use crate::models::session::{SessionReport, SessionStatus};
use crate::models::stage::{StageKind, StageState, StageStatus};
use crate::orchestrator::context::SessionContext;
use crate::orchestrator::readiness::wait_for_text;
use crate::orchestrator::stage::{Launched, Stage, StageLaunch, TeardownContext};
use crate::process::{ExitInfo, ProcessHandle};
use crate::{AppError, Result};

/// How long a finished task's output streams may take to drain.
const TASK_OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Drives one session from first stage to final teardown.
pub struct SessionOrchestrator {
    ctx: SessionContext,
    name: String,
    stages: Vec<Stage>,
    status: watch::Sender<SessionStatus>,
    stage_states: watch::Sender<Vec<StageState>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Session `name` running `stages` in order within `ctx`.
    #[must_use]
    pub fn new(ctx: SessionContext, name: impl Into<String>, stages: Vec<Stage>) -> Self {
        let states = stages
            .iter()
            .map(|stage| StageState {
                name: stage.name.clone(),
                kind: stage.kind,
                status: StageStatus::Pending,
            })
            .collect();
        let (status, _) = watch::channel(SessionStatus::Starting);
        let (stage_states, _) = watch::channel(states);

        Self {
            ctx,
            name: name.into(),
            stages,
            status,
            stage_states,
            stop: CancellationToken::new(),
        }
    }

    /// Session status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Per-stage status updates.
    #[must_use]
    pub fn subscribe_stages(&self) -> watch::Receiver<Vec<StageState>> {
        self.stage_states.subscribe()
    }

    /// Cancelling this token ends the steady state cleanly (exit code 0).
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Bring every stage up, wait out the steady state, then tear down.
    ///
    /// With the production exit hook this never returns; the report is for
    /// hooks that let `run_all` return.
    pub async fn run(mut self) -> SessionReport {
        let started_at = Utc::now();
        let span = info_span!("session", name = %self.name);

        // A panicking start action or ready hook still unwinds the stack.
        let outcome = match AssertUnwindSafe(self.drive().instrument(span.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(AppError::UncaughtFault(panic_message(panic.as_ref()))),
        };

        self.set_status(SessionStatus::TearingDown);
        let exit_code = match &outcome {
            Ok(()) => {
                info!(parent: &span, "session stopped");
                EXIT_CLEAN
            }
            Err(err) => {
                error!(parent: &span, kind = ?err.kind(), %err, "session aborted");
                err.exit_code()
            }
        };

        let exit_code = self
            .ctx
            .cleanup()
            .run_all(exit_code)
            .instrument(span)
            .await;
        self.set_status(SessionStatus::Terminated);

        SessionReport {
            name: self.name,
            fault: outcome.err(),
            exit_code,
            started_at,
            ended_at: Utc::now(),
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let stages = std::mem::take(&mut self.stages);
        let total = stages.len();
        let mut services: Vec<(String, ProcessHandle)> = Vec::new();

        for (index, stage) in stages.into_iter().enumerate() {
            let name = stage.name.clone();
            let kind = stage.kind;
            self.set_stage(index, StageStatus::Starting);
            info!(stage = name, step = index + 1, total, "starting stage");

            let started = start_stage(&self.ctx, stage)
                .instrument(info_span!("stage", name = %name))
                .await;
            match started {
                Ok(handle) => {
                    self.set_stage(index, StageStatus::Ready);
                    info!(stage = name, pid = handle.pid(), "stage ready");
                    if kind == StageKind::Service {
                        services.push((name, handle));
                    }
                }
                Err(err) => {
                    self.set_stage(index, StageStatus::Failed);
                    warn!(stage = name, %err, "stage failed");
                    return Err(err);
                }
            }
        }

        self.set_status(SessionStatus::Steady);
        info!(services = services.len(), "ready");
        wait_steady(&self.ctx, &self.stop, services).await
    }

    fn set_status(&self, next: SessionStatus) {
        let mut changed = false;
        self.status.send_if_modified(|status| {
            if status.can_transition_to(next) {
                *status = next;
                changed = true;
            }
            changed
        });
        if changed {
            info!(session = self.name, status = ?next, "session status");
        }
    }

    fn set_stage(&self, index: usize, next: StageStatus) {
        self.stage_states.send_if_modified(|states| {
            match states.get_mut(index) {
                Some(state) if state.status.can_transition_to(next) => {
                    state.status = next;
                    true
                }
                _ => false,
            }
        });
    }
}

fn teardown_started() -> AppError {
    AppError::Cancelled("teardown started while steady".into())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("stage panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("stage panicked: {msg}")
    } else {
        "stage panicked".to_owned()
    }
}

/// Start one stage and, once it is ready, register its teardown.
///
/// Must not borrow the orchestrator: stages hold `FnOnce` boxes that are not
/// `Sync`, and the session future has to stay `Send`.
async fn start_stage(ctx: &SessionContext, stage: Stage) -> Result<ProcessHandle> {
    let Stage {
        name,
        kind,
        start,
        readiness,
        on_ready,
        teardown,
    } = stage;

    let launch = StageLaunch::new(name.clone(), ctx.clone());
    let token = launch.token().clone();
    let handle = match start(launch).await? {
        Launched::Handle(handle) => handle,
        Launched::Correlated => {
            ctx.registry()
                .await_first(&token, ctx.correlation_timeout())
                .await?
        }
    };
    info!(stage = name, pid = handle.pid(), "stage process started");

    match kind {
        StageKind::Service => {
            if let Some(readiness) = &readiness {
                let attempts = wait_for_text(
                    &handle,
                    readiness.matcher.as_ref(),
                    readiness.probe,
                    ctx.kill().graceful_token(),
                )
                .await?;
                info!(stage = name, attempts, "readiness confirmed");
            }
        }
        StageKind::Task => {
            let exit = tokio::select! {
                exit = handle.wait() => exit,
                () = ctx.kill().graceful_token().cancelled() => {
                    return Err(AppError::Cancelled(format!("{name}: task abandoned")));
                }
            };
            handle.output().wait_closed(TASK_OUTPUT_DRAIN).await;
            if !exit.success() {
                return Err(AppError::TaskFailed(format!("{name} exited with {exit}")));
            }
        }
    }

    if let Some(hook) = on_ready {
        hook(&handle)?;
    }

    if let Some(teardown) = teardown {
        let tc = TeardownContext {
            stage: name.clone(),
            handle: handle.clone(),
            ctx: ctx.clone(),
        };
        ctx.cleanup()
            .push(format!("teardown {name}"), move || teardown(tc));
    }

    Ok(handle)
}

/// Race every service's exit against a stop request and teardown.
async fn wait_steady(
    ctx: &SessionContext,
    stop: &CancellationToken,
    services: Vec<(String, ProcessHandle)>,
) -> Result<()> {
    let teardown = ctx.kill().graceful_token();
    if services.is_empty() {
        return tokio::select! {
            () = stop.cancelled() => Ok(()),
            () = teardown.cancelled() => Err(teardown_started()),
        };
    }

    let exits: Vec<BoxFuture<'_, (String, ExitInfo)>> = services
        .iter()
        .map(|(name, handle)| {
            async move { (name.clone(), handle.wait().await) }.boxed()
        })
        .collect();

    tokio::select! {
        biased;
        () = teardown.cancelled() => Err(teardown_started()),
        ((name, exit), _, _) = select_all(exits) => {
            Err(AppError::UnexpectedSteadyStateExit(format!(
                "{name} exited with {exit}"
            )))
        }
        () = stop.cancelled() => Ok(()),
    }
}
