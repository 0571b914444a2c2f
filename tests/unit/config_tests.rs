use tunnel_session::config::SessionConfig;
use tunnel_session::models::stage::StageKind;
use tunnel_session::{AppError, FaultKind};

fn sample_toml() -> &'static str {
    r#"
name = "rpi-9p"
ssh_target = "pi@raspberrypi.local:2222"
required_tools = ["ssh", "frps", "diod"]

[timing]
cleanup_grace_ms = 250

[generate]
ports = ["diod", "frps", "forward"]
tokens = ["frp"]

[[stages]]
name = "diod"
command = "diod"
args = ["--foreground", "--listen", "127.0.0.1:${port.diod}"]

[stages.readiness]
regex = 'diod.*listening'
interval_ms = 500
max_attempts = 10

[[stages]]
name = "frps"
command = "frps"
args = ["-c", "${temp_dir}/frps.toml"]

[[stages.files]]
path = "frps.toml"
contents = """
bindPort = ${port.frps}
auth.token = "${token.frp}"
"""

[stages.readiness]
pattern = "frps started successfully"

[[stages]]
name = "mount"
kind = "task"
command = "ssh"
args = ["${target}", "sudo mount -t 9p 127.0.0.1 /mnt -o port=${port.forward}"]

[stages.capture]
name = "mountpoint"
regex = 'mounted on (\S+)'

[stages.teardown]
command = "ssh"
args = ["${target}", "sudo umount ${capture.mountpoint}"]
"#
}

fn minimal_toml() -> &'static str {
    r#"
name = "minimal"

[[stages]]
name = "only"
command = "sleep"
args = ["30"]
"#
}

fn validation_error(raw: &str) -> String {
    match SessionConfig::from_toml_str(raw) {
        Err(AppError::Validation(msg)) => msg,
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn parses_valid_session() {
    let config = SessionConfig::from_toml_str(sample_toml()).expect("session parses");

    assert_eq!(config.name, "rpi-9p");
    assert_eq!(config.required_tools, vec!["ssh", "frps", "diod"]);
    assert_eq!(config.timing.cleanup_grace_ms, 250);
    assert_eq!(config.timing.correlation_timeout_ms, 100);
    assert_eq!(config.stages.len(), 3);
    assert_eq!(config.stages[0].kind, StageKind::Service);
    assert_eq!(config.stages[2].kind, StageKind::Task);

    let readiness = config.stages[1].readiness.as_ref().expect("readiness");
    assert_eq!(readiness.interval_ms, 1000);
    assert_eq!(readiness.max_attempts, 30);

    let target = config.ssh_target().expect("valid").expect("present");
    assert_eq!(target.user(), Some("pi"));
    assert_eq!(target.host(), "raspberrypi.local");
    assert_eq!(target.port(), Some(2222));
}

#[test]
fn minimal_session_uses_defaults() {
    let config = SessionConfig::from_toml_str(minimal_toml()).expect("session parses");

    assert!(config.ssh_target.is_none());
    assert!(config.required_tools.is_empty());
    assert_eq!(config.timing.cleanup_grace().as_millis(), 100);
    assert_eq!(config.timing.correlation_timeout().as_millis(), 100);
    assert!(config.generate.ports.is_empty());
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("session.toml");
    std::fs::write(&path, minimal_toml()).expect("write");

    let config = SessionConfig::load_from_path(&path).expect("loads");
    assert_eq!(config.name, "minimal");
}

#[test]
fn missing_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = SessionConfig::load_from_path(temp.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Config);
}

#[test]
fn unknown_field_is_a_config_error() {
    let err = SessionConfig::from_toml_str(&format!("{}\nunexpected = 1\n", minimal_toml()))
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Config);
}

#[test]
fn rejects_empty_stage_list() {
    let msg = validation_error("name = \"empty\"\nstages = []\n");
    assert!(msg.contains("at least one stage"));
}

#[test]
fn rejects_duplicate_stage_names() {
    let raw = format!("{}\n[[stages]]\nname = \"only\"\ncommand = \"true\"\n", minimal_toml());
    assert!(validation_error(&raw).contains("duplicate stage name only"));
}

#[test]
fn rejects_malformed_ssh_target() {
    let raw = minimal_toml().replace("name = \"minimal\"", "name = \"m\"\nssh_target = \"pi@@host\"");
    assert!(validation_error(&raw).contains("invalid ssh target"));
}

#[test]
fn rejects_undeclared_port() {
    let raw = minimal_toml().replace("args = [\"30\"]", "args = [\"${port.nope}\"]");
    assert!(validation_error(&raw).contains("${port.nope}"));
}

#[test]
fn rejects_target_reference_without_target() {
    let raw = minimal_toml().replace("args = [\"30\"]", "args = [\"${target.host}\"]");
    assert!(validation_error(&raw).contains("${target.host}"));
}

#[test]
fn rejects_target_user_when_target_has_none() {
    let raw = minimal_toml()
        .replace("name = \"minimal\"", "name = \"m\"\nssh_target = \"host\"")
        .replace("args = [\"30\"]", "args = [\"${target.user}\"]");
    assert!(validation_error(&raw).contains("${target.user}"));
}

#[test]
fn rejects_capture_used_before_it_is_defined() {
    let raw = r#"
name = "early"

[[stages]]
name = "first"
command = "echo"
args = ["${capture.device}"]

[[stages]]
name = "second"
kind = "task"
command = "attach"

[stages.capture]
name = "device"
regex = 'dev (\S+)'
"#;
    assert!(validation_error(raw).contains("${capture.device}"));
}

#[test]
fn capture_may_be_used_by_its_own_teardown() {
    let raw = r#"
name = "own"

[[stages]]
name = "attach"
kind = "task"
command = "attach"

[stages.capture]
name = "device"
regex = 'dev (\S+)'

[stages.teardown]
command = "detach"
args = ["${capture.device}"]
"#;
    SessionConfig::from_toml_str(raw).expect("valid");
}

#[test]
fn rejects_capture_without_exactly_one_group() {
    let raw = r#"
name = "groups"

[[stages]]
name = "attach"
kind = "task"
command = "attach"

[stages.capture]
name = "device"
regex = '(a)(b)'
"#;
    assert!(validation_error(raw).contains("exactly one group"));
}

#[test]
fn rejects_readiness_on_task() {
    let raw = r#"
name = "task"

[[stages]]
name = "mount"
kind = "task"
command = "mount"

[stages.readiness]
pattern = "ok"
"#;
    assert!(validation_error(raw).contains("drop [readiness]"));
}

#[test]
fn rejects_teardown_on_service() {
    let raw = r#"
name = "svc"

[[stages]]
name = "server"
command = "frps"

[stages.teardown]
command = "pkill"
"#;
    assert!(validation_error(raw).contains("drop [teardown]"));
}

#[test]
fn rejects_readiness_with_both_pattern_and_regex() {
    let raw = r#"
name = "both"

[[stages]]
name = "server"
command = "frps"

[stages.readiness]
pattern = "ok"
regex = "ok"
"#;
    assert!(validation_error(raw).contains("exactly one of pattern or regex"));
}

#[test]
fn rejects_invalid_readiness_regex() {
    let raw = r#"
name = "regex"

[[stages]]
name = "server"
command = "frps"

[stages.readiness]
regex = "(unclosed"
"#;
    assert!(validation_error(raw).contains("invalid regex"));
}

#[test]
fn rejects_zero_attempts() {
    let raw = r#"
name = "zero"

[[stages]]
name = "server"
command = "frps"

[stages.readiness]
pattern = "ok"
max_attempts = 0
"#;
    assert!(validation_error(raw).contains("max_attempts"));
}

#[test]
fn rejects_file_escaping_temp_dir() {
    let raw = r#"
name = "escape"

[[stages]]
name = "server"
command = "frps"

[[stages.files]]
path = "../outside.toml"
contents = ""
"#;
    assert!(validation_error(raw).contains("inside the session temp dir"));
}

#[test]
fn rejects_duplicate_generated_names() {
    let raw = minimal_toml().replace(
        "[[stages]]",
        "[generate]\nports = [\"a\", \"a\"]\n\n[[stages]]",
    );
    assert!(validation_error(&raw).contains("duplicate port name a"));
}

#[test]
fn rejects_more_ports_than_the_range_holds() {
    let names: Vec<String> = (0..20_000).map(|i| format!("\"p{i}\"")).collect();
    let raw = minimal_toml().replace(
        "[[stages]]",
        &format!("[generate]\nports = [{}]\n\n[[stages]]", names.join(", ")),
    );
    assert!(validation_error(&raw).contains("ports requested"));
}
