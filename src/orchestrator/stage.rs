//! Stage definitions: start action, readiness check, teardown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::info;

use crate::models::stage::StageKind;
use crate::orchestrator::context::SessionContext;
use crate::orchestrator::correlation::CorrelationToken;
use crate::orchestrator::readiness::{ReadinessProbe, ReadyMatcher, Substring};
use crate::process::{KillSignal, ProcessHandle, SpawnRequest};
use crate::Result;

/// What a start action hands back to the orchestrator.
#[derive(Debug)]
pub enum Launched {
    /// The action holds the handle of the process it started.
    Handle(ProcessHandle),
    /// The action spawned asynchronously under the launch token; the
    /// orchestrator resolves the handle through the correlation registry.
    Correlated,
}

/// Everything a start action needs to launch its process.
#[derive(Debug, Clone)]
pub struct StageLaunch {
    stage: String,
    token: CorrelationToken,
    env: HashMap<String, String>,
    ctx: SessionContext,
}

impl StageLaunch {
    pub(crate) fn new(stage: String, ctx: SessionContext) -> Self {
        let (token, env) = ctx.registry().register();
        Self {
            stage,
            token,
            env,
            ctx,
        }
    }

    /// Name of the stage being started.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Token the stage's process must be tagged with.
    #[must_use]
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Environment fragment carrying the token.
    #[must_use]
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// The session context.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Tag `request` with this launch's token and spawn it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be started.
    pub fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle> {
        let request = request.envs(self.env.clone());
        self.ctx.factory().spawn(request)
    }
}

/// Starts a stage's process.
pub type StartAction = Box<dyn FnOnce(StageLaunch) -> BoxFuture<'static, Result<Launched>> + Send>;

/// Runs once the stage is ready, before its teardown is registered.
pub type ReadyHook = Box<dyn FnOnce(&ProcessHandle) -> Result<()> + Send>;

/// Inputs of a teardown action.
#[derive(Debug, Clone)]
pub struct TeardownContext {
    /// Stage name.
    pub stage: String,
    /// Process the stage brought up.
    pub handle: ProcessHandle,
    /// The session context.
    pub ctx: SessionContext,
}

/// Releases whatever a ready stage acquired.
pub type TeardownAction =
    Box<dyn FnOnce(TeardownContext) -> BoxFuture<'static, Result<()>> + Send>;

/// Readiness declaration of a stage.
#[derive(Debug, Clone)]
pub struct Readiness {
    /// Predicate over the accumulated output.
    pub matcher: Arc<dyn ReadyMatcher>,
    /// Polling schedule.
    pub probe: ReadinessProbe,
}

/// One ordered step of a session.
pub struct Stage {
    pub(crate) name: String,
    pub(crate) kind: StageKind,
    pub(crate) start: StartAction,
    pub(crate) readiness: Option<Readiness>,
    pub(crate) on_ready: Option<ReadyHook>,
    pub(crate) teardown: Option<TeardownAction>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("readiness", &self.readiness)
            .field("teardown", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}

impl Stage {
    fn with_kind<F, Fut>(name: impl Into<String>, kind: StageKind, start: F) -> Self
    where
        F: FnOnce(StageLaunch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Launched>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind,
            start: Box::new(move |launch| start(launch).boxed()),
            readiness: None,
            on_ready: None,
            teardown: None,
        }
    }

    /// Long-running stage; terminated and awaited at teardown unless another
    /// teardown is set.
    pub fn service<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: FnOnce(StageLaunch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Launched>> + Send + 'static,
    {
        Self::with_kind(name, StageKind::Service, start).teardown(terminate_and_await)
    }

    /// One-shot stage that must exit zero; no teardown unless one is set.
    pub fn task<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: FnOnce(StageLaunch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Launched>> + Send + 'static,
    {
        Self::with_kind(name, StageKind::Task, start)
    }

    /// Ready once the output contains `pattern`.
    #[must_use]
    pub fn ready_when_contains(self, pattern: impl Into<String>, probe: ReadinessProbe) -> Self {
        self.ready_when(Arc::new(Substring(pattern.into())), probe)
    }

    /// Ready once `matcher` accepts the output.
    #[must_use]
    pub fn ready_when(mut self, matcher: Arc<dyn ReadyMatcher>, probe: ReadinessProbe) -> Self {
        self.readiness = Some(Readiness { matcher, probe });
        self
    }

    /// Run `hook` once ready, before the teardown is registered.
    #[must_use]
    pub fn on_ready<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&ProcessHandle) -> Result<()> + Send + 'static,
    {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Replace the teardown action.
    #[must_use]
    pub fn teardown<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce(TeardownContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.teardown = Some(Box::new(move |tc| action(tc).boxed()));
        self
    }

    /// Drop the teardown action.
    #[must_use]
    pub fn without_teardown(mut self) -> Self {
        self.teardown = None;
        self
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.kind
    }
}

/// Default service teardown: `SIGTERM`, then keep the cleanup stack waiting
/// until the process has actually exited.
///
/// # Errors
///
/// Never fails; the signature matches [`TeardownAction`].
pub async fn terminate_and_await(tc: TeardownContext) -> Result<()> {
    info!(stage = tc.stage, pid = tc.handle.pid(), "killing stage process");
    tc.handle.kill(KillSignal::Terminate);
    let handle = tc.handle.clone();
    tc.ctx.cleanup().push_in_flight(
        format!("await exit of {}", tc.stage),
        async move {
            let exit = handle.wait().await;
            info!(label = handle.label(), status = %exit, "stage process exited");
            Ok(())
        },
    );
    Ok(())
}
