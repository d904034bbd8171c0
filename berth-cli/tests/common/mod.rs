#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Environment variables that change the options the CLI loads.
const OPTION_ENVS: &[&str] = &[
    "BERTH_CONFIG",
    "RUST_LOG",
    "CHE_DOCKER_IP",
    "CHE_DOCKER_IP_EXTERNAL",
    "CHE_DOCKER_SERVER_EVALUATION_STRATEGY",
    "CHE_DOCKER_SERVER_EVALUATION_STRATEGY_CUSTOM_TEMPLATE",
    "CHE_DOCKER_SERVER_EVALUATION_STRATEGY_CUSTOM_EXTERNAL_PROTOCOL",
    "CHE_PORT",
    "CHE_DOCKER_ALWAYS_PULL_IMAGE",
    "CHE_DOCKER_PRIVILEGED",
    "CHE_DOCKER_REGISTRY_FOR_SNAPSHOTS",
    "CHE_DOCKER_REGISTRY",
];

/// `docker inspect` output of a running dev machine.
pub const INSPECT_JSON: &str = r#"[{
    "Id": "c0ffee",
    "Name": "/workspace123_machine1_serverid-1_user_dev",
    "Config": {
        "Image": "eclipse-che/ws1_dev",
        "Env": ["CHE_WORKSPACE_ID=workspace123", "CHE_MACHINE_NAME=dev", "CHE_IS_DEV_MACHINE=true"],
        "Labels": {
            "che:server:8080/tcp:ref": "web",
            "che:server:8080/tcp:protocol": "http"
        },
        "ExposedPorts": {"8080/tcp": {}, "22/tcp": {}}
    },
    "NetworkSettings": {
        "IPAddress": "172.17.0.2",
        "Gateway": "172.17.0.1",
        "Ports": {
            "8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}],
            "22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32769"}]
        }
    },
    "State": {"Status": "running", "Running": true}
}]"#;

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_berth");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(30));
        for key in OPTION_ENVS {
            cmd.env_remove(key);
        }
        cmd
    }

    /// Write `content` into the context directory and return its path.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write test file");
        path
    }

    pub fn inspect_file(&self) -> PathBuf {
        self.write("inspect.json", INSPECT_JSON)
    }
}

pub fn berth() -> TestContext {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let bin_path = env!("CARGO_BIN_EXE_berth");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    for key in OPTION_ENVS {
        cmd.env_remove(key);
    }
    TestContext { cmd, dir }
}
