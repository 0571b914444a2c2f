//! Template references, rendering and SSH target parsing.

use tunnel_session::template::{
    references, Reference, SshTarget, Vars, PORT_RANGE_END, PORT_RANGE_START,
};
use tunnel_session::FaultKind;

#[test]
fn parses_every_reference_kind() {
    let refs = references(
        "${port.a} ${token.b} ${target} ${target.host} ${target.user} ${temp_dir} ${capture.c} ${env.D}",
    )
    .expect("valid");

    assert_eq!(
        refs,
        vec![
            Reference::Port("a".into()),
            Reference::Token("b".into()),
            Reference::Target,
            Reference::TargetHost,
            Reference::TargetUser,
            Reference::TempDir,
            Reference::Capture("c".into()),
            Reference::Env("D".into()),
        ]
    );
}

#[test]
fn unknown_namespace_is_rejected() {
    let err = references("${secret.a}").unwrap_err();
    assert_eq!(err.kind(), FaultKind::Validation);
    assert!(err.to_string().contains("${secret.a}"));
}

#[test]
fn renders_generated_values() {
    let vars = Vars::default()
        .with_port("frps", 9000)
        .with_token("auth", "s3cret")
        .with_target(Some(SshTarget::parse("pi@10.0.0.2").expect("target")))
        .with_temp_dir("/tmp/session-x");

    let rendered = vars
        .render("ssh ${target} -R ${port.frps}:localhost:${port.frps} token=${token.auth} user=${target.user} host=${target.host} dir=${temp_dir}")
        .expect("renders");

    assert_eq!(
        rendered,
        "ssh pi@10.0.0.2 -R 9000:localhost:9000 token=s3cret user=pi host=10.0.0.2 dir=/tmp/session-x"
    );
}

#[test]
fn capture_is_shared_between_clones() {
    let vars = Vars::default();
    let later = vars.clone();

    assert!(later.render("${capture.dev}").is_err());
    vars.set_capture("dev", "/dev/nbd3");

    assert_eq!(later.render("mount ${capture.dev}").expect("renders"), "mount /dev/nbd3");
    assert_eq!(later.capture("dev").as_deref(), Some("/dev/nbd3"));
}

#[test]
fn missing_value_is_a_validation_error() {
    let err = Vars::default().render("${port.none}").unwrap_err();
    assert_eq!(err.kind(), FaultKind::Validation);
    assert!(err.to_string().contains("no value for ${port.none}"));
}

#[test]
fn render_all_renders_in_order() {
    let vars = Vars::default().with_port("p", 8200);
    let args = vec!["-p".to_owned(), "${port.p}".to_owned()];
    assert_eq!(vars.render_all(&args).expect("renders"), vec!["-p", "8200"]);
}

#[test]
fn generated_ports_are_distinct_and_in_range() {
    let names: Vec<String> = (0..64).map(|i| format!("p{i}")).collect();
    let vars = Vars::generate(&names, &[]).expect("ports fit the range");

    let mut ports: Vec<u16> = names.iter().map(|n| vars.port(n).expect("bound")).collect();
    assert!(ports
        .iter()
        .all(|p| (PORT_RANGE_START..PORT_RANGE_END).contains(p)));
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), names.len());
}

#[test]
fn generated_tokens_are_alphanumeric() {
    let vars = Vars::generate(&[], &["a".to_owned(), "b".to_owned()]).expect("generated");
    let a = vars.token("a").expect("bound");
    let b = vars.token("b").expect("bound");

    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(a, b);
}

#[test]
fn ssh_target_forms() {
    let plain = SshTarget::parse("raspberrypi").expect("host only");
    assert_eq!(plain.user(), None);
    assert_eq!(plain.port(), None);

    let full = SshTarget::parse("pi@192.168.1.20:22").expect("full");
    assert_eq!(full.user(), Some("pi"));
    assert_eq!(full.host(), "192.168.1.20");
    assert_eq!(full.port(), Some(22));

    let v6 = SshTarget::parse("root@[fe80::1]:2222").expect("ipv6");
    assert_eq!(v6.host(), "[fe80::1]");
    assert_eq!(v6.port(), Some(2222));
    assert_eq!(v6.to_string(), "root@[fe80::1]:2222");
}

#[test]
fn ssh_target_rejects_garbage() {
    for bad in ["", "pi@", "host:99999", "a b", "user@host:port"] {
        assert!(SshTarget::parse(bad).is_err(), "{bad:?} should be rejected");
    }
}

#[test]
fn more_ports_than_the_range_holds_is_rejected() {
    let available = usize::from(PORT_RANGE_END - PORT_RANGE_START);
    let names: Vec<String> = (0..=available).map(|i| format!("p{i}")).collect();

    let err = Vars::generate(&names, &[]).unwrap_err();

    assert_eq!(err.kind(), FaultKind::Validation);
    assert!(err.to_string().contains("ports requested"));
}
