//! Readiness polling against live output.

#![cfg(unix)]

use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use tunnel_session::orchestrator::readiness::{wait_for_text, Pattern, Substring};
use tunnel_session::orchestrator::ReadinessProbe;
use tunnel_session::process::KillSignal;
use tunnel_session::FaultKind;

use super::test_helpers::{sh, test_context};

fn probe(interval_ms: u64, max_attempts: u32) -> ReadinessProbe {
    ReadinessProbe {
        interval: Duration::from_millis(interval_ms),
        max_attempts,
    }
}

#[tokio::test]
async fn pattern_seen_on_the_second_poll() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("frps", "sleep 0.3; echo frps started successfully; exec sleep 30"))
        .expect("spawn");

    let attempt = wait_for_text(
        &handle,
        &Substring("started successfully".into()),
        probe(200, 5),
        &CancellationToken::new(),
    )
    .await
    .expect("ready");

    assert_eq!(attempt, 2);
    handle.kill(KillSignal::Kill);
}

#[tokio::test]
async fn regex_matcher_on_stderr() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("nbd", "echo 'NBD device is: nbd7' >&2; exec sleep 30"))
        .expect("spawn");

    let matcher = Pattern(Regex::new(r"nbd\d+").unwrap());
    let attempt = wait_for_text(&handle, &matcher, probe(100, 10), &CancellationToken::new())
        .await
        .expect("ready");

    assert!(attempt >= 1);
    handle.kill(KillSignal::Kill);
}

#[tokio::test]
async fn never_printing_times_out_after_max_attempts() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("mute", "exec sleep 30"))
        .expect("spawn");

    let started = std::time::Instant::now();
    let err = wait_for_text(
        &handle,
        &Substring("ready".into()),
        probe(50, 3),
        &CancellationToken::new(),
    )
    .await
    .expect_err("times out");

    assert_eq!(err.kind(), FaultKind::ReadinessTimeout);
    assert!(started.elapsed() >= Duration::from_millis(150));
    handle.kill(KillSignal::Kill);
}

#[tokio::test]
async fn exit_before_pattern_is_reported_without_waiting_out_the_window() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("crash", "echo booting; exit 2"))
        .expect("spawn");

    let started = std::time::Instant::now();
    let err = wait_for_text(
        &handle,
        &Substring("ready".into()),
        probe(1_000, 30),
        &CancellationToken::new(),
    )
    .await
    .expect_err("exited early");

    assert_eq!(err.kind(), FaultKind::ProcessExitedEarly);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn pattern_printed_right_before_exit_still_counts() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("oneshot", "echo ready; exit 0"))
        .expect("spawn");
    handle.output().wait_closed(Duration::from_secs(2)).await;

    let attempt = wait_for_text(
        &handle,
        &Substring("ready".into()),
        probe(50, 3),
        &CancellationToken::new(),
    )
    .await
    .expect("pattern was printed before the exit");

    assert_eq!(attempt, 1);
}

#[tokio::test]
async fn cancellation_stops_polling() {
    let (ctx, _exit) = test_context();
    let handle = ctx
        .factory()
        .spawn(sh("slow", "exec sleep 30"))
        .expect("spawn");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = wait_for_text(&handle, &Substring("ready".into()), probe(1_000, 30), &cancel)
        .await
        .expect_err("cancelled");

    assert_eq!(err.kind(), FaultKind::Cancelled);
    handle.kill(KillSignal::Kill);
}
