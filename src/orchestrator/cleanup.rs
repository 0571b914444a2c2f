//! Process-wide LIFO stack of teardown actions.
//!
//! Entries are either callables (run once when popped, or earlier through
//! [`CleanupHandle::run`]) or in-flight operations that remove themselves
//! when they finish. [`CleanupStack::run_all`] drains the stack exactly once
//! per process, bracketed by the graceful and forceful kill broadcasts, and
//! finally hands the exit code to the configured [`ExitHook`].
//!
//! Entry lifecycle: `Pending → Running → Completed` or `Pending → Removed`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use crate::process::KillBroadcast;
use crate::{AppError, Result};

/// Default pause around the drain, giving signalled commands time to react.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_millis(100);

/// Terminates the host process once teardown is complete.
pub trait ExitHook: Send + Sync {
    /// Called exactly once, with the session's exit code.
    fn exit(&self, code: i32);
}

/// Production hook: `std::process::exit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl ExitHook for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Hook that only records the code; `run_all` then returns to its caller.
#[derive(Debug, Default)]
pub struct RecordExit {
    code: Mutex<Option<i32>>,
}

impl RecordExit {
    /// Code passed to the hook, if teardown finished.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        *self.code.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExitHook for RecordExit {
    fn exit(&self, code: i32) {
        *self.code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }
}

/// Lifecycle of one cleanup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting on the stack.
    Pending,
    /// Executing.
    Running,
    /// Finished, successfully or not.
    Completed,
    /// Taken off the stack without running.
    Removed,
}

type Callable = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
/// `None` while in flight; `Some(Err(msg))` when the operation failed.
type Completion = Option<std::result::Result<(), String>>;

enum Action {
    Callable(Callable),
    InFlight(watch::Receiver<Completion>),
}

struct Entry {
    id: u64,
    label: String,
    action: Action,
    state: Arc<Mutex<EntryState>>,
}

struct StackInner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    running: AtomicBool,
    bound: AtomicBool,
    grace: Duration,
    kill: KillBroadcast,
    exit: Arc<dyn ExitHook>,
    finished: watch::Sender<Option<i32>>,
}

impl StackInner {
    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: u64) -> Option<Entry> {
        let mut entries = self.entries();
        let index = entries.iter().position(|entry| entry.id == id)?;
        Some(entries.remove(index))
    }
}

fn set_state(state: &Mutex<EntryState>, next: EntryState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Shared, cloneable reference to the session's cleanup stack.
#[derive(Clone)]
pub struct CleanupStack {
    inner: Arc<StackInner>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("labels", &self.labels())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CleanupStack {
    /// Empty stack that broadcasts through `kill` and exits through `exit`.
    #[must_use]
    pub fn new(kill: KillBroadcast, grace: Duration, exit: Arc<dyn ExitHook>) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(StackInner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                bound: AtomicBool::new(false),
                grace,
                kill,
                exit,
                finished,
            }),
        }
    }

    fn insert(&self, label: String, action: Action) -> CleanupHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(EntryState::Pending));
        debug!(id, label, "cleanup registered");
        self.inner.entries().push(Entry {
            id,
            label: label.clone(),
            action,
            state: Arc::clone(&state),
        });
        CleanupHandle {
            id,
            label,
            state,
            stack: Arc::downgrade(&self.inner),
        }
    }

    /// Register a teardown callable.
    pub fn push<F, Fut>(&self, label: impl Into<String>, action: F) -> CleanupHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callable: Callable = Box::new(move || action().boxed());
        self.insert(label.into(), Action::Callable(callable))
    }

    /// Register an operation that is already under way.
    ///
    /// The operation removes itself from the stack when it finishes. If the
    /// stack is drained first, the drain waits for it.
    pub fn push_in_flight<Fut>(&self, label: impl Into<String>, operation: Fut) -> CleanupHandle
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(None);
        let handle = self.insert(label.into(), Action::InFlight(done_rx));
        let weak = Arc::downgrade(&self.inner);
        let id = handle.id;
        let state = Arc::clone(&handle.state);

        tokio::spawn(async move {
            let outcome = operation.await.map_err(|err| err.to_string());
            if let Some(inner) = weak.upgrade() {
                if inner.take(id).is_some() {
                    set_state(&state, EntryState::Completed);
                }
            }
            done_tx.send_replace(Some(outcome));
        });

        handle
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// Whether no entries are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of pending entries, bottom of the stack first.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.inner
            .entries()
            .iter()
            .map(|entry| entry.label.clone())
            .collect()
    }

    /// Whether teardown has started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Exit code once teardown has finished.
    #[must_use]
    pub fn finished(&self) -> watch::Receiver<Option<i32>> {
        self.inner.finished.subscribe()
    }

    /// Mark signal handlers as installed; `true` only for the first caller.
    pub(crate) fn mark_bound(&self) -> bool {
        !self.inner.bound.swap(true, Ordering::SeqCst)
    }

    /// Unwind the whole stack and exit with `exit_code`.
    ///
    /// Only the first call does anything; later calls never return. The
    /// first call returns `exit_code` only when the exit hook itself returns.
    pub async fn run_all(&self, exit_code: i32) -> i32 {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(exit_code, "cleanup already running; parking caller");
            return std::future::pending().await;
        }

        info!(exit_code, "tearing down session");
        self.inner.kill.graceful();
        tokio::time::sleep(self.inner.grace).await;

        info!(pending = self.len(), "running cleanup callbacks");
        let mut failures = 0usize;
        // Re-read the tail each time: entries may push more entries.
        loop {
            let entry = self.inner.entries().pop();
            let Some(entry) = entry else { break };
            if let Err(err) = execute(entry).await {
                failures += 1;
                error!(%err, "cleanup step failed; continuing");
            }
        }

        tokio::time::sleep(self.inner.grace).await;
        self.inner.kill.forceful();

        info!(exit_code, failures, "cleanup complete");
        // Observers of `finished` must see the hook's effect.
        self.inner.exit.exit(exit_code);
        self.inner.finished.send_replace(Some(exit_code));
        exit_code
    }
}

async fn execute(entry: Entry) -> Result<()> {
    let Entry {
        id,
        label,
        action,
        state,
    } = entry;
    set_state(&state, EntryState::Running);
    debug!(id, label, "cleanup running");

    let outcome = match action {
        Action::Callable(callable) => {
            let span = tracing::info_span!("cleanup", label = %label);
            // A panicking step must not stop the rest of the drain.
            match AssertUnwindSafe(async move { callable().await })
                .catch_unwind()
                .instrument(span)
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::UncaughtFault("cleanup step panicked".into())),
            }
        }
        Action::InFlight(mut done) => {
            let completion = done
                .wait_for(Option::is_some)
                .await
                .map(|completion| completion.clone());
            match completion {
                Ok(Some(Err(msg))) => Err(AppError::CleanupActionFailed(msg)),
                Ok(_) => Ok(()),
                Err(_) => Err(AppError::CleanupActionFailed(
                    "in-flight operation vanished".into(),
                )),
            }
        }
    };

    set_state(&state, EntryState::Completed);
    outcome.map_err(|err| match err {
        AppError::CleanupActionFailed(_) => err,
        other => AppError::CleanupActionFailed(format!("{label}: {other}")),
    })
}

/// Caller-side reference to one cleanup entry.
#[derive(Debug)]
pub struct CleanupHandle {
    id: u64,
    label: String,
    state: Arc<Mutex<EntryState>>,
    stack: Weak<StackInner>,
}

impl CleanupHandle {
    /// Label the entry was registered under.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EntryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the entry off the stack without running it.
    ///
    /// No effect if it already ran or was already removed.
    pub fn remove(&self) {
        let Some(inner) = self.stack.upgrade() else {
            return;
        };
        if inner.take(self.id).is_some() {
            set_state(&self.state, EntryState::Removed);
            debug!(id = self.id, label = self.label, "cleanup removed");
        }
    }

    /// Run the entry now instead of at teardown.
    ///
    /// No effect if it already ran or was already removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CleanupActionFailed` if the step fails.
    pub async fn run(&self) -> Result<()> {
        let Some(inner) = self.stack.upgrade() else {
            return Ok(());
        };
        let entry = inner.take(self.id);
        drop(inner);
        match entry {
            Some(entry) => execute(entry).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StackInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackInner").finish_non_exhaustive()
    }
}
