use predicates::prelude::*;

mod common;

#[test]
fn test_servers_default_strategy() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .arg("servers")
        .arg(&inspect)
        .args(["--fallback-host", "10.0.0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""ref": "web""#))
        .stdout(predicate::str::contains(r#""url": "http://10.0.0.5:32768""#))
        .stdout(predicate::str::contains(r#""ref": "server-22-tcp""#));
}

#[test]
fn test_servers_docker_local_uses_container_ip() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .arg("servers")
        .arg(&inspect)
        .args(["--strategy", "docker-local"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""internal_address": "172.17.0.2:8080""#))
        .stdout(predicate::str::contains(r#""address": "172.17.0.1:32768""#));
}

#[test]
fn test_servers_from_stdin_with_overrides() {
    let mut ctx = common::berth();
    let overrides = ctx.write("servers.json", r#"{"22": {"ref": "ssh", "protocol": "ssh"}}"#);

    ctx.cmd
        .args(["servers", "-", "--overrides"])
        .arg(&overrides)
        .write_stdin(common::INSPECT_JSON)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""ref": "ssh""#))
        .stdout(predicate::str::contains("ssh://localhost:32769"));
}

#[test]
fn test_servers_custom_strategy_requires_template() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .arg("servers")
        .arg(&inspect)
        .args(["--strategy", "custom"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("template"));
}

#[test]
fn test_servers_rejects_unknown_strategy() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .arg("servers")
        .arg(&inspect)
        .args(["--strategy", "magic"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown server evaluation strategy"));
}
