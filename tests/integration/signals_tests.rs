//! Signal and fault bindings driving the cleanup stack.

#![cfg(unix)]

use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use serial_test::serial;
use tunnel_session::errors::{EXIT_FAULT, EXIT_INTERRUPT, EXIT_TERMINATE};
use tunnel_session::orchestrator::signals;

use super::test_helpers::test_context;

/// Bind a fresh context, deliver `signal` to this process and return the
/// exit code teardown finished with, plus the code seen by the exit hook.
async fn unwind_on(signal: Signal) -> (Option<i32>, Option<i32>) {
    let (ctx, exit) = test_context();
    assert!(signals::bind(ctx.cleanup()).expect("bound"));
    let mut finished = ctx.cleanup().finished();

    raise(signal).expect("signal raised");

    let code = tokio::time::timeout(Duration::from_secs(5), finished.wait_for(Option::is_some))
        .await
        .expect("teardown ran")
        .map(|code| *code)
        .expect("channel open");
    (code, exit.code())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn interrupt_unwinds_with_130() {
    assert_eq!(
        unwind_on(Signal::SIGINT).await,
        (Some(EXIT_INTERRUPT), Some(EXIT_INTERRUPT))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn terminate_unwinds_with_143() {
    assert_eq!(
        unwind_on(Signal::SIGTERM).await,
        (Some(EXIT_TERMINATE), Some(EXIT_TERMINATE))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn panic_in_a_task_unwinds_the_stack_once() {
    let (ctx, exit) = test_context();
    assert!(signals::bind(ctx.cleanup()).expect("bound"));
    assert!(!signals::bind(ctx.cleanup()).expect("second bind"));

    let ran = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = ran.clone();
    ctx.cleanup().push("count", move || async move {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    });

    let mut finished = ctx.cleanup().finished();
    let _ = tokio::spawn(async { panic!("fault inside a stage task") }).await;

    let code = tokio::time::timeout(Duration::from_secs(5), finished.wait_for(Option::is_some))
        .await
        .expect("teardown ran")
        .map(|code| *code)
        .expect("channel open");

    assert_eq!(code, Some(EXIT_FAULT));
    assert_eq!(exit.code(), Some(EXIT_FAULT));
    assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
}
