//! `AppError` display format, kinds and exit codes.

use tunnel_session::errors::{EXIT_CLEAN, EXIT_FAULT, EXIT_INTERRUPT, EXIT_TERMINATE};
use tunnel_session::{AppError, FaultKind};

#[test]
fn display_prefixes_the_kind() {
    let cases = [
        (AppError::Validation("bad".into()), "validation: bad"),
        (
            AppError::RequiredToolMissing("ssh, frpc".into()),
            "required tool missing: ssh, frpc",
        ),
        (
            AppError::ProcessExitedEarly("frps".into()),
            "process exited early: frps",
        ),
        (AppError::ReadinessTimeout("frpc".into()), "readiness timeout: frpc"),
        (
            AppError::CorrelationNotFound("abc".into()),
            "correlation not found: abc",
        ),
        (
            AppError::UnexpectedSteadyStateExit("c exited".into()),
            "unexpected steady state exit: c exited",
        ),
        (
            AppError::CleanupActionFailed("umount".into()),
            "cleanup action failed: umount",
        ),
        (AppError::UncaughtFault("boom".into()), "uncaught fault: boom"),
        (AppError::TaskFailed("attach".into()), "task failed: attach"),
        (AppError::Io("disk".into()), "io: disk"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn message_has_no_trailing_period() {
    let err = AppError::Spawn("failed to spawn ssh: not found".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn kind_matches_variant() {
    assert_eq!(
        AppError::ReadinessTimeout(String::new()).kind(),
        FaultKind::ReadinessTimeout
    );
    assert_eq!(
        AppError::CorrelationNotFound(String::new()).kind(),
        FaultKind::CorrelationNotFound
    );
    assert_eq!(AppError::Cancelled(String::new()).kind(), FaultKind::Cancelled);
}

#[test]
fn only_cleanup_failures_are_swallowed() {
    assert!(!AppError::CleanupActionFailed("x".into()).aborts_session());
    assert!(AppError::ReadinessTimeout("x".into()).aborts_session());
    assert!(AppError::UncaughtFault("x".into()).aborts_session());
    assert!(AppError::Validation("x".into()).aborts_session());
}

#[test]
fn faults_exit_with_generic_code() {
    assert_eq!(AppError::ProcessExitedEarly("x".into()).exit_code(), EXIT_FAULT);
    assert_eq!(EXIT_CLEAN, 0);
    assert_eq!(EXIT_INTERRUPT, 130);
    assert_eq!(EXIT_TERMINATE, 143);
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AppError = io.into();
    assert_eq!(err.kind(), FaultKind::Io);
    assert!(err.to_string().contains("gone"));
}

#[test]
fn regex_errors_are_validation_errors() {
    let err: AppError = regex::Regex::new("(unclosed").unwrap_err().into();
    assert_eq!(err.kind(), FaultKind::Validation);
}

#[test]
fn toml_errors_are_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= nope").unwrap_err().into();
    assert_eq!(err.kind(), FaultKind::Config);
    assert!(err.to_string().starts_with("config: invalid session file"));
}
