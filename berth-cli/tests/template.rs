use predicates::prelude::*;

mod common;

#[test]
fn test_template_render_for_port() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .args([
            "template",
            "<serverName>-<workspaceIdWithoutPrefix>.<wildcardNipDomain>",
            "--port",
            "8080/tcp",
            "--external-ip",
            "192.168.0.10",
            "--inspect",
        ])
        .arg(&inspect)
        .assert()
        .success()
        .stdout("8080/tcp\tweb-123.192.168.0.10.nip.io\n");
}

#[test]
fn test_template_renders_every_exposed_port() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .args([
            "template",
            "<if(isDevMachine)>dev<else>other<endif>-<serverName>",
            "--inspect",
        ])
        .arg(&inspect)
        .assert()
        .success()
        .stdout(predicate::str::contains("22/tcp\tdev-server-22-tcp"))
        .stdout(predicate::str::contains("8080/tcp\tdev-web"));
}

#[test]
fn test_template_rejects_unbalanced_if() {
    let mut ctx = common::berth();
    let inspect = ctx.inspect_file();

    ctx.cmd
        .args(["template", "<if(isDevMachine)>dev", "--inspect"])
        .arg(&inspect)
        .assert()
        .failure();
}
