//! Integration tests for machine provisioning and teardown.

use berth::BerthError;
use berth::agents::{AgentLauncher, AgentSpec};
use berth::engine::{ContainerEngine, ContainerState, EngineError, ImageConfig};
use berth::network::{NetworkLifecycle, WORKSPACE_LABEL};
use berth::options::{ProvisionerOptions, SystemResources, SystemTier};
use berth::process::ProcessCommand;
use berth::provision::{
    CONTAINER_EXITED_ERROR, FILE_NOT_FOUND_MARKER, MachineProvisioner, MachineSpec,
    RuntimeIdentity, WorkspaceMachine,
};
use berth::servers::ServerConf;
use berth_test_utils::{EngineCall, MockEngine, Op, bound_ports, container_event};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const NETWORK: &str = "ws1_abcdefghijklmnop";

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Provisioner over a scripted engine.
struct TestContext {
    engine: Arc<MockEngine>,
    provisioner: MachineProvisioner,
}

impl TestContext {
    fn new() -> Self {
        Self::with_options(ProvisionerOptions {
            always_pull_image: false,
            ..Default::default()
        })
    }

    fn with_options(options: ProvisionerOptions) -> Self {
        let engine = Arc::new(MockEngine::new());
        let provisioner =
            MachineProvisioner::new(engine.clone() as Arc<dyn ContainerEngine>, options)
                .expect("valid options")
                .with_fallback_host("10.0.0.5");
        Self {
            engine,
            provisioner,
        }
    }

    async fn start(&self, spec: &MachineSpec, is_dev: bool) -> Result<WorkspaceMachine, BerthError> {
        self.provisioner
            .start_service(NETWORK, "dev", spec, &RuntimeIdentity::new("ws1"), is_dev)
            .await
    }

    /// Engine call names, without the log streaming task's calls.
    fn call_names(&self) -> Vec<&'static str> {
        self.engine
            .call_names()
            .into_iter()
            .filter(|n| *n != "container_logs")
            .collect()
    }
}

fn ubuntu() -> MachineSpec {
    MachineSpec::from_image("ws1_dev", "codenvy/ubuntu_jdk8")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// START
// ============================================================================

#[tokio::test]
async fn start_service_runs_machine_container() {
    let ctx = TestContext::new();

    let machine = ctx.start(&ubuntu(), false).await.unwrap();

    assert_eq!(
        ctx.call_names(),
        vec![
            "list_images",
            "pull",
            "tag",
            "inspect_image",
            "create_container",
            "start_container",
            "inspect_container",
        ]
    );
    assert_eq!(machine.image(), "eclipse-che/ws1_dev");
    assert_eq!(machine.machine_id(), "dev");
    assert_eq!(machine.workspace_id(), "ws1");
    assert!(ctx.engine.has_container(machine.container_id()));
    assert!(ctx.provisioner.detector().is_tracked(machine.container_id()));
    assert_eq!(ctx.provisioner.metrics().machines_started_total(), 1);

    let created = &ctx.engine.created_containers()[0];
    assert_eq!(created.name.as_deref(), Some("ws1_dev"));
    assert_eq!(created.config.image, "eclipse-che/ws1_dev");
}

#[tokio::test]
async fn machine_id_comes_from_spec_when_set() {
    let ctx = TestContext::new();
    let spec = MachineSpec {
        id: "machine123".to_string(),
        ..ubuntu()
    };

    let machine = ctx.start(&spec, false).await.unwrap();

    assert_eq!(machine.machine_id(), "machine123");
    assert_eq!(machine.machine_name(), "dev");
}

#[tokio::test]
async fn no_source_fails_without_engine_calls() {
    let ctx = TestContext::new();
    let spec = MachineSpec {
        container_name: "ws1_dev".to_string(),
        ..Default::default()
    };

    let err = ctx.start(&spec, true).await.unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(_)));
    assert!(ctx.engine.calls().is_empty());
    assert_eq!(ctx.provisioner.metrics().machines_failed_total(), 1);
}

#[tokio::test]
async fn exited_container_is_removed_and_reported() {
    let ctx = TestContext::new();
    ctx.engine.set_started_state(ContainerState {
        status: "exited".to_string(),
        exit_code: 0,
        ..Default::default()
    });

    let err = ctx.start(&ubuntu(), false).await.unwrap_err();

    match err {
        BerthError::Provisioning(message) => assert_eq!(message, CONTAINER_EXITED_ERROR),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ctx.engine.count("remove_container"), 1);
    assert!(!ctx.engine.has_container("container-1"));
    assert_eq!(ctx.provisioner.detector().tracked_count(), 0);
}

#[tokio::test]
async fn start_failure_removes_container_and_keeps_original_error() {
    let ctx = TestContext::new();
    ctx.engine
        .fail(Op::StartContainer, EngineError::api(500, "port already allocated"));

    let err = ctx.start(&ubuntu(), false).await.unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(msg) if msg.contains("port already allocated")));
    assert_eq!(ctx.engine.count("remove_container"), 1);

    let calls = ctx.engine.calls();
    let removal = calls
        .iter()
        .find_map(|c| match c {
            EngineCall::RemoveContainer(params) => Some(params.clone()),
            _ => None,
        })
        .unwrap();
    assert!(removal.force);
    assert!(removal.remove_volumes);
}

#[tokio::test]
async fn create_failure_is_provisioning_error() {
    let ctx = TestContext::new();
    ctx.engine
        .fail(Op::CreateContainer, EngineError::Conflict("name in use".to_string()));

    let err = ctx.start(&ubuntu(), false).await.unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(_)));
    assert_eq!(ctx.engine.count("remove_container"), 0);
}

// ============================================================================
// COMMAND REPLACEMENT
// ============================================================================

#[tokio::test]
async fn exiting_image_command_is_replaced() {
    let ctx = TestContext::new();
    ctx.engine.set_image_config(
        "eclipse-che/ws1_dev",
        ImageConfig {
            cmd: Some(strings(&["/bin/sh"])),
            ..Default::default()
        },
    );

    ctx.start(&ubuntu(), false).await.unwrap();

    let config = &ctx.engine.created_containers()[0].config;
    assert_eq!(config.cmd, Some(strings(&["tail", "-f", "/dev/null"])));
    assert_eq!(config.entrypoint, None);
}

#[tokio::test]
async fn long_running_command_is_kept() {
    let ctx = TestContext::new();
    ctx.engine.set_image_config(
        "eclipse-che/ws1_dev",
        ImageConfig {
            cmd: Some(strings(&["/my-app"])),
            ..Default::default()
        },
    );

    ctx.start(&ubuntu(), false).await.unwrap();

    let config = &ctx.engine.created_containers()[0].config;
    assert_eq!(config.cmd, None);
    assert_eq!(config.entrypoint, None);
}

#[tokio::test]
async fn real_entrypoint_keeps_shell_command() {
    let ctx = TestContext::new();
    ctx.engine.set_image_config(
        "eclipse-che/ws1_dev",
        ImageConfig {
            cmd: Some(strings(&["/bin/sh"])),
            entrypoint: Some(strings(&["/docker-entrypoint.sh"])),
            ..Default::default()
        },
    );

    ctx.start(&ubuntu(), false).await.unwrap();

    assert_eq!(ctx.engine.created_containers()[0].config.cmd, None);
}

#[tokio::test]
async fn machine_command_overrides_image_command() {
    let ctx = TestContext::new();
    ctx.engine.set_image_config(
        "eclipse-che/ws1_dev",
        ImageConfig {
            cmd: Some(strings(&["/bin/bash"])),
            ..Default::default()
        },
    );
    let spec = MachineSpec {
        command: Some(strings(&["sleep", "infinity"])),
        ..ubuntu()
    };

    ctx.start(&spec, false).await.unwrap();

    assert_eq!(
        ctx.engine.created_containers()[0].config.cmd,
        Some(strings(&["sleep", "infinity"]))
    );
}

// ============================================================================
// CONTAINER CONFIG
// ============================================================================

fn system_options() -> ProvisionerOptions {
    ProvisionerOptions {
        always_pull_image: false,
        memory_swap_multiplier: 0.0,
        system: SystemResources {
            common: SystemTier {
                ports: strings(&["4401/tcp"]),
                volumes: strings(&["/var/lib/che/lib:/mnt/che/lib:ro"]),
                env: BTreeMap::from([("CHE_API".to_string(), "http://che:8080/api".to_string())]),
            },
            dev: SystemTier {
                ports: strings(&["4403/tcp"]),
                volumes: strings(&["/projects"]),
                env: BTreeMap::from([("JAVA_OPTS".to_string(), "-Xmx256m".to_string())]),
            },
        },
        additional_networks: strings(&["shared"]),
        ..Default::default()
    }
}

fn server_spec() -> MachineSpec {
    MachineSpec {
        mem_limit: 1024 * 1024 * 1024,
        servers: HashMap::from([(
            "8080".to_string(),
            ServerConf {
                reference: Some("tomcat".to_string()),
                protocol: Some("http".to_string()),
                path: None,
            },
        )]),
        ..ubuntu()
    }
}

#[tokio::test]
async fn dev_machine_gets_both_system_tiers() {
    let ctx = TestContext::with_options(system_options());

    ctx.start(&server_spec(), true).await.unwrap();

    let config = &ctx.engine.created_containers()[0].config;
    for port in ["4401/tcp", "4403/tcp", "8080/tcp"] {
        assert!(config.exposed_ports.contains_key(port), "missing {port}");
    }
    for env in [
        "CHE_API=http://che:8080/api",
        "JAVA_OPTS=-Xmx256m",
        "CHE_MACHINE_NAME=dev",
        "CHE_WORKSPACE_ID=ws1",
        "CHE_IS_DEV_MACHINE=true",
    ] {
        assert!(config.env.iter().any(|e| e == env), "missing {env}");
    }
    assert!(config.volumes.contains_key("/projects"));

    let host = config.host_config.as_ref().unwrap();
    assert_eq!(host.binds, strings(&["/var/lib/che/lib:/mnt/che/lib:ro"]));
    assert_eq!(host.memory, 1024 * 1024 * 1024);
    assert_eq!(host.memory_swap, 1024 * 1024 * 1024);
    assert_eq!(host.network_mode.as_deref(), Some(NETWORK));
    assert!(host.publish_all_ports);

    let endpoint = &config.networking_config.as_ref().unwrap().endpoints_config[NETWORK];
    assert_eq!(endpoint.aliases, strings(&["dev"]));
}

#[tokio::test]
async fn non_dev_machine_gets_common_tier_only() {
    let ctx = TestContext::with_options(system_options());

    ctx.start(&server_spec(), false).await.unwrap();

    let config = &ctx.engine.created_containers()[0].config;
    assert!(config.exposed_ports.contains_key("4401/tcp"));
    assert!(!config.exposed_ports.contains_key("4403/tcp"));
    assert!(config.env.iter().any(|e| e == "CHE_MACHINE_NAME=dev"));
    assert!(!config.env.iter().any(|e| e.starts_with("CHE_WORKSPACE_ID=")));
    assert!(!config.env.iter().any(|e| e.starts_with("JAVA_OPTS=")));
}

#[tokio::test]
async fn additional_networks_are_connected_before_start() {
    let ctx = TestContext::with_options(system_options());
    let spec = MachineSpec {
        networks: strings(&[NETWORK]),
        ..ubuntu()
    };

    let machine = ctx.start(&spec, false).await.unwrap();

    let connects: Vec<_> = ctx
        .engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            EngineCall::ConnectNetwork(params) => Some(params),
            _ => None,
        })
        .collect();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].network, "shared");
    assert_eq!(connects[0].container, machine.container_id());
    assert_eq!(connects[0].aliases, strings(&["dev"]));

    let names = ctx.call_names();
    let connect = names.iter().position(|n| *n == "connect_container_to_network");
    let start = names.iter().position(|n| *n == "start_container");
    assert!(connect < start);
}

// ============================================================================
// RUNNING MACHINE
// ============================================================================

#[tokio::test]
async fn servers_are_evaluated_from_fresh_inspect() {
    let ctx = TestContext::new();
    ctx.engine.set_network_settings(bound_ports(
        "172.17.0.2",
        "172.17.0.1",
        &[("8080/tcp", "32768"), ("22/tcp", "32769")],
    ));

    let machine = ctx.start(&server_spec(), false).await.unwrap();
    let servers = machine.servers().await.unwrap();

    assert_eq!(servers.len(), 2);
    let tomcat = &servers["8080/tcp"];
    assert_eq!(tomcat.reference, "tomcat");
    assert_eq!(tomcat.address, "10.0.0.5:32768");
    assert_eq!(tomcat.url.as_deref(), Some("http://10.0.0.5:32768"));
    assert_eq!(servers["22/tcp"].reference, "server-22-tcp");
}

#[tokio::test]
async fn read_file_prints_line_range() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();
    ctx.engine.push_exec_output(&["127.0.0.1 localhost\n", "::1 localhost\n"]);

    let content = machine.read_file("/etc/hosts", 2, 2).await.unwrap();

    assert_eq!(content, "127.0.0.1 localhost\n::1 localhost\n");
    let command = &ctx.engine.exec_commands()[0];
    assert_eq!(command[..2].to_vec(), strings(&["/bin/sh", "-c"]));
    assert!(command[2].starts_with("[ -r '/etc/hosts' ] || "), "{}", command[2]);
    assert!(command[2].ends_with("sed -n '2,3p' '/etc/hosts'"), "{}", command[2]);
}

#[tokio::test]
async fn read_file_reports_missing_file_and_bad_range() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();
    ctx.engine
        .push_exec_output(&[format!("{FILE_NOT_FOUND_MARKER}\n").as_str()]);

    let missing = machine.read_file("/nope", 1, 10).await.unwrap_err();
    assert!(matches!(missing, BerthError::NotFound(_)));

    let bad_range = machine.read_file("/etc/hosts", 0, 10).await.unwrap_err();
    assert!(matches!(bad_range, BerthError::InvalidArgument(_)));
}

#[tokio::test]
async fn processes_get_sequential_pids_and_clear_on_stop() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();

    let first = machine.create_process(ProcessCommand::new("build", "mvn install"), None);
    let second = machine.create_process(ProcessCommand::new("run", "java -jar app.jar"), None);
    assert_eq!(second.pid(), first.pid() + 1);
    assert_eq!(machine.get_process(first.pid()).unwrap().command().name, "build");
    assert!(matches!(machine.get_process(999), Err(BerthError::NotFound(_))));

    ctx.provisioner
        .detector()
        .handle_event(&container_event(machine.container_id(), "die", 1_700_000_000, 0));

    assert!(machine.processes().is_empty());
}

#[tokio::test]
async fn destroy_removes_container_and_image() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();
    ctx.engine.fail(Op::RemoveImage, EngineError::Conflict("image in use".to_string()));

    machine.destroy().await.unwrap();

    assert!(!ctx.engine.has_container(machine.container_id()));
    assert!(!ctx.provisioner.detector().is_tracked(machine.container_id()));
    let calls = ctx.engine.calls();
    let removed_image = calls.iter().any(|c| {
        matches!(c, EngineCall::RemoveImage(params) if params.image == "eclipse-che/ws1_dev" && !params.force)
    });
    assert!(removed_image);
}

#[tokio::test]
async fn destroy_fails_when_container_cannot_be_removed() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();
    ctx.engine
        .fail(Op::RemoveContainer, EngineError::api(500, "device busy"));

    let err = machine.destroy().await.unwrap_err();

    assert!(matches!(err, BerthError::Engine(_)));
}

#[tokio::test]
async fn snapshot_of_running_machine() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();

    let snapshot = machine.save_to_snapshot().await.unwrap();

    assert!(snapshot.repository.starts_with("machine_snapshot_"));
    assert_eq!(ctx.provisioner.metrics().snapshots_saved_total(), 1);
}

#[tokio::test]
async fn read_file_keeps_error_like_lines_as_content() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), false).await.unwrap();
    ctx.engine.push_exec_output(&["line mentioning sed: /x: No such file or directory\n"]);

    let content = machine.read_file("/var/log/app.log", 1, 1).await.unwrap();

    assert_eq!(content, "line mentioning sed: /x: No such file or directory\n");
}

// ============================================================================
// AGENTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn agents_launch_in_dependency_order() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), true).await.unwrap();
    let agents = vec![
        AgentSpec::new("ws-agent")
            .depends_on("exec")
            .with_script("java -jar ws-agent.jar"),
        AgentSpec::new("exec").with_script("./exec-agent"),
        AgentSpec::new("ssh"),
    ];

    let launched = AgentLauncher::new()
        .with_startup_grace(Duration::from_millis(100))
        .apply(&machine, &agents)
        .await
        .unwrap();

    let names: Vec<&str> = launched.iter().map(|p| p.command().name.as_str()).collect();
    assert_eq!(names, vec!["exec", "ws-agent"]);
    assert!(launched.iter().all(|p| p.command().kind.as_deref() == Some("agent")));

    let commands = ctx.engine.exec_commands();
    assert!(commands[0][2].ends_with("./exec-agent"));
    assert!(commands[1][2].ends_with("java -jar ws-agent.jar"));
    assert_eq!(machine.processes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failing_agent_aborts_launch() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), true).await.unwrap();
    ctx.engine
        .fail(Op::CreateExec, EngineError::ContainerNotFound("gone".to_string()));
    let agents = vec![
        AgentSpec::new("exec").with_script("./exec-agent"),
        AgentSpec::new("ws-agent")
            .depends_on("exec")
            .with_script("java -jar ws-agent.jar"),
    ];

    let err = AgentLauncher::new().apply(&machine, &agents).await.unwrap_err();

    assert!(matches!(err, BerthError::Exec { .. }));
    assert_eq!(ctx.engine.count("create_exec"), 1);
}

#[tokio::test]
async fn circular_agents_are_rejected() {
    let ctx = TestContext::new();
    let machine = ctx.start(&ubuntu(), true).await.unwrap();
    let agents = vec![
        AgentSpec::new("a").depends_on("b").with_script("a"),
        AgentSpec::new("b").depends_on("a").with_script("b"),
    ];

    let err = AgentLauncher::new().apply(&machine, &agents).await.unwrap_err();

    assert!(matches!(err, BerthError::CircularDependency(_)));
    assert!(ctx.engine.exec_commands().is_empty());
}

// ============================================================================
// NETWORKS
// ============================================================================

#[tokio::test]
async fn network_is_created_with_workspace_label() {
    let engine = Arc::new(MockEngine::new());
    let networks = NetworkLifecycle::new(engine.clone() as Arc<dyn ContainerEngine>);

    let id = networks.create(NETWORK, "ws1").await.unwrap();

    assert_eq!(id, "network-1");
    let calls = engine.calls();
    let EngineCall::CreateNetwork(params) = &calls[0] else {
        panic!("expected network creation, got {:?}", calls[0]);
    };
    assert_eq!(params.name, NETWORK);
    assert_eq!(params.driver.as_deref(), Some("bridge"));
    assert!(params.check_duplicate);
    assert_eq!(params.labels[WORKSPACE_LABEL], "ws1");
}

#[tokio::test]
async fn network_failures() {
    let engine = Arc::new(MockEngine::new());
    let networks = NetworkLifecycle::new(engine.clone() as Arc<dyn ContainerEngine>);

    engine.fail(Op::CreateNetwork, EngineError::Conflict("exists".to_string()));
    assert!(matches!(
        networks.create(NETWORK, "ws1").await,
        Err(BerthError::Provisioning(_))
    ));

    engine.fail(Op::RemoveNetwork, EngineError::NotFound(NETWORK.to_string()));
    networks.destroy(NETWORK).await;
    engine.fail(Op::RemoveNetwork, EngineError::api(500, "has active endpoints"));
    networks.destroy(NETWORK).await;

    assert_eq!(engine.count("remove_network"), 2);
}
