//! Pre-flight tool resolution.

use std::ffi::OsString;

use serial_test::serial;
use tunnel_session::preflight::{check_required_tools, find_in, find_on_path};
use tunnel_session::AppError;

#[cfg(unix)]
fn make_tool(dir: &std::path::Path, name: &str, executable: bool) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write tool");
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).expect("chmod");
}

#[cfg(unix)]
#[test]
fn finds_executable_in_search_list() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    make_tool(second.path(), "frpc", true);

    let search = std::env::join_paths([first.path(), second.path()]).expect("join");
    let found = find_in("frpc", &search).expect("found");

    assert_eq!(found, second.path().join("frpc"));
}

#[cfg(unix)]
#[test]
fn skips_non_executable_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    make_tool(dir.path(), "nbdkit", false);

    let search = OsString::from(dir.path());
    assert!(find_in("nbdkit", &search).is_none());
}

#[cfg(unix)]
#[test]
fn paths_with_separator_are_checked_directly() {
    let dir = tempfile::tempdir().expect("tempdir");
    make_tool(dir.path(), "diod", true);
    let direct = dir.path().join("diod");

    let found = find_in(direct.to_str().expect("utf8"), &OsString::new());
    assert_eq!(found, Some(direct));
}

#[cfg(unix)]
#[test]
#[serial]
fn sh_is_on_the_real_path() {
    assert!(find_on_path("sh").is_some());
    check_required_tools(&["sh".to_owned()]).expect("sh present");
}

#[cfg(unix)]
#[test]
#[serial]
fn reports_every_missing_tool() {
    let dir = tempfile::tempdir().expect("tempdir");
    make_tool(dir.path(), "present", true);
    let saved = std::env::var_os("PATH");
    std::env::set_var("PATH", dir.path());

    let result = check_required_tools(&[
        "present".to_owned(),
        "absent-one".to_owned(),
        "absent-two".to_owned(),
    ]);

    match saved {
        Some(path) => std::env::set_var("PATH", path),
        None => std::env::remove_var("PATH"),
    }

    match result {
        Err(AppError::RequiredToolMissing(msg)) => assert_eq!(msg, "absent-one, absent-two"),
        other => panic!("expected RequiredToolMissing, got {other:?}"),
    }
}

#[test]
fn empty_requirement_list_passes() {
    check_required_tools(&[]).expect("nothing required");
}
