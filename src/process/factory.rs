//! Process factory: the one place processes are created.
//!
//! Spawns commands with `kill_on_drop(true)`, tees captured output, and
//! starts a waiter task per process. The waiter owns the child, relays kill
//! requests, delivers the teardown broadcasts, and publishes the exit
//! status. Observers hear about every spawn and every completion.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::output::{Echo, OutputBuffer};
use super::{
    ExitInfo, KillSignal, OutputMode, ProcessHandle, SpawnEvent, SpawnRequest, StdinMode,
};
use crate::{AppError, Result};

/// Receives spawn and completion notifications from the factory.
pub trait SpawnObserver: Send + Sync {
    /// Called once, right after a process was created.
    fn spawned(&self, event: &SpawnEvent);

    /// Called once, after the process exited.
    fn completed(&self, handle: &ProcessHandle);
}

/// The two teardown broadcasts sent to spawned commands.
///
/// `graceful` reaches every command spawned before teardown began;
/// `forceful` reaches every command still running once the cleanup stack
/// has drained.
#[derive(Debug, Clone, Default)]
pub struct KillBroadcast {
    graceful: CancellationToken,
    forceful: CancellationToken,
}

impl KillBroadcast {
    /// Fresh, untriggered broadcast pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask in-flight commands to stop (`SIGTERM`).
    pub fn graceful(&self) {
        self.graceful.cancel();
    }

    /// Kill stragglers (`SIGKILL`).
    pub fn forceful(&self) {
        self.forceful.cancel();
    }

    /// Token cancelled by the graceful broadcast.
    #[must_use]
    pub fn graceful_token(&self) -> &CancellationToken {
        &self.graceful
    }

    /// Token cancelled by the forceful broadcast.
    #[must_use]
    pub fn forceful_token(&self) -> &CancellationToken {
        &self.forceful
    }
}

/// Creates every process of a session.
#[derive(Clone)]
pub struct ProcessFactory {
    kill: KillBroadcast,
    observers: Arc<Vec<Arc<dyn SpawnObserver>>>,
}

impl std::fmt::Debug for ProcessFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessFactory")
            .field("kill", &self.kill)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ProcessFactory {
    /// Build a factory bound to `kill` that notifies `observers`.
    #[must_use]
    pub fn new(kill: KillBroadcast, observers: Vec<Arc<dyn SpawnObserver>>) -> Self {
        Self {
            kill,
            observers: Arc::new(observers),
        }
    }

    /// Spawn `request` and return its handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the OS refuses to start the program or
    /// reports no process id.
    pub fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .kill_on_drop(true);

        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(match request.stdin {
            StdinMode::Null => Stdio::null(),
            StdinMode::Inherit => Stdio::inherit(),
        });

        let echo = match request.output {
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
                None
            }
            OutputMode::Capture { echo } => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                Some(echo)
            }
            OutputMode::Null => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
        };

        info!(label = request.label, command = %request.display_command(), "$");

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to spawn {}: {err}", request.program))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Spawn(format!("no pid for {}", request.program)))?;

        let output = OutputBuffer::new();
        if let Some(echo) = echo {
            if let Some(stdout) = child.stdout.take() {
                let target = if echo { Echo::Stdout } else { Echo::Silent };
                output.tee(request.label.clone(), stdout, target);
            }
            if let Some(stderr) = child.stderr.take() {
                let target = if echo { Echo::Stderr } else { Echo::Silent };
                output.tee(request.label.clone(), stderr, target);
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let handle = ProcessHandle::new(
            pid,
            request.label.clone(),
            request.token(),
            exit_rx,
            kill_tx,
            output,
        );

        debug!(label = request.label, pid, "process spawned");

        let event = SpawnEvent {
            handle: handle.clone(),
            request: Arc::new(request),
        };
        for observer in self.observers.iter() {
            observer.spawned(&event);
        }

        // Decided here, not in the waiter: the waiter may first run after
        // teardown has already begun.
        let graceful_pending = !self.kill.graceful.is_cancelled();
        tokio::spawn(supervise(
            child,
            handle.clone(),
            Supervision {
                exit_tx,
                kill_rx,
                kill: self.kill.clone(),
                graceful_pending,
                observers: Arc::clone(&self.observers),
            },
        ));

        Ok(handle)
    }
}

/// Channels and broadcast state handed to a waiter task.
struct Supervision {
    exit_tx: watch::Sender<Option<ExitInfo>>,
    kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    kill: KillBroadcast,
    /// False for commands spawned during teardown; they only answer to the
    /// forceful broadcast.
    graceful_pending: bool,
    observers: Arc<Vec<Arc<dyn SpawnObserver>>>,
}

/// Owns `child` until it exits.
///
/// Holds a strong handle so correlation lookups stay resolvable exactly as
/// long as the process runs.
async fn supervise(mut child: Child, handle: ProcessHandle, supervision: Supervision) {
    let Supervision {
        exit_tx,
        mut kill_rx,
        kill,
        mut graceful_pending,
        observers,
    } = supervision;
    let pid = handle.pid();
    let label = handle.label().to_owned();
    let mut forceful_pending = true;

    let info = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(err) => {
                        warn!(label, pid, %err, "failed to wait for process");
                        ExitInfo::unknown()
                    }
                };
            }
            Some(signal) = kill_rx.recv() => {
                deliver(&mut child, pid, &label, signal);
            }
            () = kill.graceful.cancelled(), if graceful_pending => {
                graceful_pending = false;
                deliver(&mut child, pid, &label, KillSignal::Terminate);
            }
            () = kill.forceful.cancelled(), if forceful_pending => {
                forceful_pending = false;
                deliver(&mut child, pid, &label, KillSignal::Kill);
            }
        }
    };

    debug!(label, pid, status = %info, "process exited");
    exit_tx.send_replace(Some(info));
    for observer in observers.iter() {
        observer.completed(&handle);
    }
}

#[cfg(unix)]
fn deliver(child: &mut Child, pid: u32, label: &str, signal: KillSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        KillSignal::Interrupt => Signal::SIGINT,
        KillSignal::Terminate => Signal::SIGTERM,
        KillSignal::Kill => Signal::SIGKILL,
    };

    let Ok(raw) = i32::try_from(pid) else {
        warn!(label, pid, "pid out of range; falling back to start_kill");
        let _ = child.start_kill();
        return;
    };

    debug!(label, pid, %signal, "signalling process");
    if let Err(err) = kill(Pid::from_raw(raw), sig) {
        debug!(label, pid, %err, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, pid: u32, label: &str, signal: KillSignal) {
    debug!(label, pid, %signal, "terminating process");
    if let Err(err) = child.start_kill() {
        debug!(label, pid, %err, "terminate failed");
    }
}
