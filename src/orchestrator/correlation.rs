//! Correlation registry: find the process you just asked to be spawned.
//!
//! A caller mints a token with [`CorrelationRegistry::register`], merges the
//! returned environment fragment into its spawn request, and later resolves
//! the token to the running [`ProcessHandle`] with
//! [`await_first`](CorrelationRegistry::await_first). The registry observes
//! every spawn through [`SpawnObserver`] and keeps only weak references,
//! dropping each entry when its process completes.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::process::{ProcessHandle, SpawnEvent, SpawnObserver, WeakProcessHandle};
use crate::{AppError, Result};

/// Environment variable carrying the correlation token into the child.
pub const CORRELATION_ENV_VAR: &str = "TUNNEL_SESSION_TRACKER";

/// Default grace window for [`CorrelationRegistry::await_first`].
pub const DEFAULT_CORRELATION_TIMEOUT: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

/// Opaque, single-use identifier minted before a spawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    /// Token text as embedded in the environment.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    minted: HashSet<CorrelationToken>,
    live: HashMap<CorrelationToken, WeakProcessHandle>,
}

/// Token-keyed table of running, tagged processes.
#[derive(Debug)]
pub struct CorrelationRegistry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<SpawnEvent>,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mint a fresh token and the environment fragment that carries it.
    ///
    /// Tokens are random UUIDs; uniqueness against every token this registry
    /// has minted is still checked before one is handed out.
    pub fn register(&self) -> (CorrelationToken, HashMap<String, String>) {
        let mut state = self.state();
        let token = loop {
            let candidate = CorrelationToken(Uuid::new_v4().simple().to_string());
            if state.minted.insert(candidate.clone()) {
                break candidate;
            }
            warn!(token = %candidate, "correlation token collision; minting another");
        };
        drop(state);

        let env = HashMap::from([(CORRELATION_ENV_VAR.to_owned(), token.0.clone())]);
        (token, env)
    }

    /// Handle currently recorded for `token`, if its process is running.
    #[must_use]
    pub fn lookup(&self, token: &CorrelationToken) -> Option<ProcessHandle> {
        self.state().live.get(token).and_then(WeakProcessHandle::upgrade)
    }

    /// Number of tagged processes currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.state().live.len()
    }

    /// Resolve `token` to the first process spawned under it.
    ///
    /// Returns immediately when the process was already observed; otherwise
    /// waits up to `timeout` for its spawn event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorrelationNotFound` if no process tagged with
    /// `token` shows up within `timeout`.
    pub async fn await_first(
        &self,
        token: &CorrelationToken,
        timeout: Duration,
    ) -> Result<ProcessHandle> {
        // Subscribe before the lookup so a spawn in between is not missed.
        let mut events = self.events.subscribe();
        if let Some(handle) = self.lookup(token) {
            return Ok(handle);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.token().as_ref() == Some(token) => {
                        return Some(event.handle);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "spawn events lagged; rechecking table");
                        if let Some(handle) = self.lookup(token) {
                            return Some(handle);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) | Err(_) => self.lookup(token).ok_or_else(|| {
                AppError::CorrelationNotFound(format!(
                    "no process spawned with token {token} within {timeout:?}"
                ))
            }),
        }
    }
}

impl SpawnObserver for CorrelationRegistry {
    fn spawned(&self, event: &SpawnEvent) {
        if let Some(token) = event.token() {
            let mut state = self.state();
            let existing = state.live.get(&token).and_then(WeakProcessHandle::upgrade);
            if let Some(existing) = existing {
                warn!(
                    token = %token,
                    first_pid = existing.pid(),
                    second_pid = event.handle.pid(),
                    "second process spawned under one correlation token; only the first is resolvable"
                );
            } else {
                state.live.insert(token, event.handle.downgrade());
            }
        }
        // No subscribers is the normal case.
        let _ = self.events.send(event.clone());
    }

    fn completed(&self, handle: &ProcessHandle) {
        let Some(token) = handle.token() else {
            return;
        };
        let mut state = self.state();
        if state
            .live
            .get(token)
            .is_some_and(|weak| weak.points_to(handle))
        {
            state.live.remove(token);
            debug!(token = %token, pid = handle.pid(), "correlated process completed");
        }
    }
}
