//! Process-wide session context.
//!
//! Bundles the correlation registry, the cleanup stack, the kill
//! broadcasts, and the process factory that ties them together. Built once
//! in the composition root; tests build a fresh one each.

use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::cleanup::{
    CleanupStack, ExitHook, ProcessExit, DEFAULT_CLEANUP_GRACE,
};
use crate::orchestrator::correlation::{CorrelationRegistry, DEFAULT_CORRELATION_TIMEOUT};
use crate::process::{KillBroadcast, ProcessFactory, SpawnObserver};

/// Tunables for a [`SessionContext`].
#[derive(Clone)]
pub struct ContextOptions {
    /// Pause before and after draining the cleanup stack.
    pub cleanup_grace: Duration,
    /// How long a stage waits to observe its own spawn.
    pub correlation_timeout: Duration,
    /// What happens once teardown is complete.
    pub exit: Arc<dyn ExitHook>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            correlation_timeout: DEFAULT_CORRELATION_TIMEOUT,
            exit: Arc::new(ProcessExit),
        }
    }
}

impl std::fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextOptions")
            .field("cleanup_grace", &self.cleanup_grace)
            .field("correlation_timeout", &self.correlation_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ContextInner {
    registry: Arc<CorrelationRegistry>,
    cleanup: CleanupStack,
    factory: ProcessFactory,
    kill: KillBroadcast,
    correlation_timeout: Duration,
}

/// Shared handle to the session's registry, cleanup stack and factory.
#[derive(Debug, Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

impl SessionContext {
    /// Wire up a fresh context.
    #[must_use]
    pub fn new(options: ContextOptions) -> Self {
        let kill = KillBroadcast::new();
        let registry = Arc::new(CorrelationRegistry::new());
        let observer: Arc<dyn SpawnObserver> = registry.clone();
        let factory = ProcessFactory::new(kill.clone(), vec![observer]);
        let cleanup = CleanupStack::new(kill.clone(), options.cleanup_grace, options.exit);

        Self {
            inner: Arc::new(ContextInner {
                registry,
                cleanup,
                factory,
                kill,
                correlation_timeout: options.correlation_timeout,
            }),
        }
    }

    /// Correlation registry observing every spawn.
    #[must_use]
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    /// The session's cleanup stack.
    #[must_use]
    pub fn cleanup(&self) -> &CleanupStack {
        &self.inner.cleanup
    }

    /// The only way this session creates processes.
    #[must_use]
    pub fn factory(&self) -> &ProcessFactory {
        &self.inner.factory
    }

    /// Teardown broadcasts.
    #[must_use]
    pub fn kill(&self) -> &KillBroadcast {
        &self.inner.kill
    }

    /// Grace window for correlation lookups.
    #[must_use]
    pub fn correlation_timeout(&self) -> Duration {
        self.inner.correlation_timeout
    }
}
