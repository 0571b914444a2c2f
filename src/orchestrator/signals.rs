//! Signal and fault integration for the cleanup stack.
//!
//! `SIGINT` unwinds with exit code 130, `SIGTERM` with 143, and any panic
//! on any thread or task is logged and unwinds with exit code 1.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::{AppError, EXIT_FAULT, EXIT_INTERRUPT, EXIT_TERMINATE};
use crate::orchestrator::cleanup::CleanupStack;
use crate::Result;

/// Install signal and fault handlers that drive `stack`.
///
/// Handlers are installed at most once per stack; returns `false` when they
/// were already in place. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `AppError::Io` if an OS signal handler cannot be registered.
pub fn bind(stack: &CleanupStack) -> Result<bool> {
    if !stack.mark_bound() {
        return Ok(false);
    }

    #[cfg(unix)]
    let (mut interrupt, mut terminate) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::interrupt())
                .map_err(|err| AppError::Io(format!("cannot handle SIGINT: {err}")))?,
            signal(SignalKind::terminate())
                .map_err(|err| AppError::Io(format!("cannot handle SIGTERM: {err}")))?,
        )
    };

    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<String>();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        previous(panic);
        let _ = fault_tx.send(panic.to_string());
    }));

    let stack = stack.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let code = tokio::select! {
                _ = interrupt.recv() => {
                    info!("interrupt received");
                    EXIT_INTERRUPT
                }
                _ = terminate.recv() => {
                    info!("terminate received");
                    EXIT_TERMINATE
                }
                Some(fault) = fault_rx.recv() => {
                    error!(fault = %AppError::UncaughtFault(fault), "unhandled fault");
                    EXIT_FAULT
                }
            };

            #[cfg(not(unix))]
            let code = tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(%err, "ctrl-c handler failed");
                    }
                    info!("interrupt received");
                    EXIT_INTERRUPT
                }
                Some(fault) = fault_rx.recv() => {
                    error!(fault = %AppError::UncaughtFault(fault), "unhandled fault");
                    EXIT_FAULT
                }
            };

            if stack.is_running() {
                warn!(code, "teardown already in progress");
            }
            let stack = stack.clone();
            tokio::spawn(async move {
                stack.run_all(code).await;
            });
        }
    });

    Ok(true)
}
