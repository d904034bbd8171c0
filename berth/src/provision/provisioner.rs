//! Machine provisioning: image → container config → running, monitored container.

use super::machine::{MachineParts, WorkspaceMachine};
use super::spec::{MachineSpec, RuntimeIdentity};
use crate::engine::{
    ConnectContainerParams, ContainerConfig, ContainerEngine, ContainerInfo,
    CreateContainerParams, EmptyObject, EndpointConfig, HostConfig, NetworkingConfig,
    RemoveContainerParams,
};
use crate::images::{ImagePreparer, SnapshotPipeline};
use crate::lifecycle::{LifecycleDetector, MachineStopListener};
use crate::logs::{LogStreamer, MachineLogLine};
use crate::metrics::{ProvisionerMetrics, ProvisionerMetricsStorage};
use crate::options::ProvisionerOptions;
use crate::process::{PidSequence, ProcessTable};
use crate::servers::{AddressStrategy, create_strategy, normalize_port};
use berth_shared::constants::machine_env;
use berth_shared::errors::{BerthError, BerthResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reported when a container is already exited right after start.
pub const CONTAINER_EXITED_ERROR: &str = "We detected that a machine exited unexpectedly. \
    This may be caused by a container in interactive mode or a container that requires \
    additional arguments to start. Please check the container recipe.";

/// Host used for addresses when nothing better is known.
pub const DEFAULT_FALLBACK_HOST: &str = "localhost";

/// Commands that make a container exit right after start.
const BAD_CMDS: &[&[&str]] = &[
    &["/bin/bash"],
    &["/bin/sh"],
    &["bash"],
    &["sh"],
    &["/bin/sh", "-c", "/bin/sh"],
    &["/bin/sh", "-c", "/bin/bash"],
    &["/bin/sh", "-c", "bash"],
    &["/bin/sh", "-c", "sh"],
];

/// Entrypoints that exit right after start. Every bad command is one too.
const BAD_ENTRYPOINTS: &[&[&str]] = &[
    &["/bin/sh", "-c"],
    &["/bin/bash", "-c"],
    &["sh", "-c"],
    &["bash", "-c"],
];

/// Long-lived no-op command used instead of an immediately exiting one.
pub const NON_EXITING_CMD: &[&str] = &["tail", "-f", "/dev/null"];

fn matches_any(value: &[String], catalogue: &[&[&str]]) -> bool {
    catalogue
        .iter()
        .any(|bad| bad.len() == value.len() && bad.iter().zip(value).all(|(b, v)| *b == v))
}

fn is_bad_cmd(cmd: Option<&[String]>) -> bool {
    cmd.is_none_or(|c| matches_any(c, BAD_CMDS))
}

fn is_bad_entrypoint(entrypoint: Option<&[String]>) -> bool {
    entrypoint.is_none_or(|e| matches_any(e, BAD_ENTRYPOINTS) || matches_any(e, BAD_CMDS))
}

/// Swap limit for a memory limit. A negative multiplier means unlimited (-1).
pub fn memory_swap(mem_limit: i64, multiplier: f64) -> i64 {
    if multiplier < 0.0 {
        -1
    } else {
        (mem_limit as f64 * (multiplier + 1.0)) as i64
    }
}

// ============================================================================
// Provisioner
// ============================================================================

/// Provisions workspace machines as containers.
///
/// Owns the pid sequence, the lifecycle detector and the metrics shared by
/// every machine it starts. Different machines may be provisioned in
/// parallel; provisioning and destroying the same machine concurrently is
/// the caller's problem.
pub struct MachineProvisioner {
    engine: Arc<dyn ContainerEngine>,
    options: Arc<ProvisionerOptions>,
    pids: Arc<PidSequence>,
    detector: Arc<LifecycleDetector>,
    preparer: ImagePreparer,
    snapshots: Arc<SnapshotPipeline>,
    strategy: Arc<dyn AddressStrategy>,
    metrics: ProvisionerMetricsStorage,
    fallback_host: String,
    log_output: Option<mpsc::UnboundedSender<MachineLogLine>>,
}

impl MachineProvisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>, options: ProvisionerOptions) -> BerthResult<Self> {
        options.validate()?;
        let strategy = create_strategy(&options.address)?;
        let metrics = ProvisionerMetricsStorage::new();
        let options = Arc::new(options);

        let detector = Arc::new(LifecycleDetector::new(Arc::clone(&engine), metrics.clone()));
        let preparer = ImagePreparer::new(Arc::clone(&engine), Arc::clone(&options));
        let snapshots = Arc::new(SnapshotPipeline::new(
            Arc::clone(&engine),
            options.snapshots.clone(),
            options.registry_auth.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            engine,
            options,
            pids: Arc::new(PidSequence::new()),
            detector,
            preparer,
            snapshots,
            strategy,
            metrics,
            fallback_host: DEFAULT_FALLBACK_HOST.to_string(),
            log_output: None,
        })
    }

    /// Host used by address strategies when no IP is configured or known.
    pub fn with_fallback_host(mut self, host: impl Into<String>) -> Self {
        self.fallback_host = host.into();
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AddressStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_snapshot_pipeline(mut self, snapshots: SnapshotPipeline) -> Self {
        self.snapshots = Arc::new(snapshots);
        self
    }

    /// Also deliver machine output lines to `output`.
    pub fn with_log_output(mut self, output: mpsc::UnboundedSender<MachineLogLine>) -> Self {
        self.log_output = Some(output);
        self
    }

    pub fn options(&self) -> &ProvisionerOptions {
        &self.options
    }

    pub fn detector(&self) -> &Arc<LifecycleDetector> {
        &self.detector
    }

    pub fn metrics(&self) -> ProvisionerMetrics {
        ProvisionerMetrics::new(self.metrics.clone())
    }

    /// Spawn the lifecycle detection loop. Runs until `cancel` fires.
    pub fn start_monitoring(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.detector.spawn(cancel)
    }

    /// Provision one machine and return it running and monitored.
    ///
    /// A container created along the way is removed again if a later step
    /// fails; the original error is returned.
    pub async fn start_service(
        &self,
        network: &str,
        machine_name: &str,
        spec: &MachineSpec,
        identity: &RuntimeIdentity,
        is_dev: bool,
    ) -> BerthResult<WorkspaceMachine> {
        let result = self
            .start_service_inner(network, machine_name, spec, identity, is_dev)
            .await;

        match &result {
            Ok(machine) => {
                ProvisionerMetricsStorage::inc(&self.metrics.machines_started);
                tracing::info!(
                    machine = machine_name,
                    container_id = %machine.container_id(),
                    workspace_id = %identity.workspace_id,
                    "Machine started"
                );
            }
            Err(e) => {
                ProvisionerMetricsStorage::inc(&self.metrics.machines_failed);
                tracing::error!(machine = machine_name, error = %e, "Machine failed to start");
            }
        }
        result
    }

    async fn start_service_inner(
        &self,
        network: &str,
        machine_name: &str,
        spec: &MachineSpec,
        identity: &RuntimeIdentity,
        is_dev: bool,
    ) -> BerthResult<WorkspaceMachine> {
        if spec.has_no_source() {
            return Err(BerthError::Provisioning(format!(
                "Neither a build source nor an image is defined for machine '{}'",
                machine_name
            )));
        }

        let mut spec = spec.clone();
        let image = self.preparer.prepare(machine_name, &spec).await?;

        self.add_system_settings(&mut spec, machine_name, identity, is_dev);
        let config = self
            .container_config(network, machine_name, &image, &spec)
            .await?;

        let created = self
            .engine
            .create_container(CreateContainerParams {
                config,
                name: Some(spec.container_name.clone()),
            })
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!(
                    "Failed to create container for machine '{}': {}",
                    machine_name, e
                ))
            })?;
        let container_id = created.id;
        for warning in &created.warnings {
            tracing::warn!(container_id = %container_id, warning = %warning, "Engine warning on create");
        }

        let info = match self
            .run_container(network, machine_name, &container_id, &spec)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.cleanup_container(&container_id).await;
                return Err(e);
            }
        };

        let mut streamer = LogStreamer::new(
            Arc::clone(&self.engine),
            &container_id,
            machine_name,
            self.metrics.clone(),
        );
        if let Some(output) = &self.log_output {
            streamer = streamer.with_output(output.clone());
        }
        let log_task = streamer.spawn();

        let processes = ProcessTable::new();
        let machine_id = if spec.id.is_empty() {
            machine_name.to_string()
        } else {
            spec.id.clone()
        };
        let listener: Arc<dyn MachineStopListener> = Arc::new(processes.clone());
        self.detector.start_detection(
            &container_id,
            &machine_id,
            &identity.workspace_id,
            Some(listener),
        );

        Ok(WorkspaceMachine::new(MachineParts {
            engine: Arc::clone(&self.engine),
            container_id,
            machine_id,
            machine_name: machine_name.to_string(),
            workspace_id: identity.workspace_id.clone(),
            image,
            info,
            server_overrides: spec.servers,
            processes,
            pids: Arc::clone(&self.pids),
            detector: Arc::clone(&self.detector),
            strategy: Arc::clone(&self.strategy),
            snapshots: Arc::clone(&self.snapshots),
            fallback_host: self.fallback_host.clone(),
            log_task,
        }))
    }

    /// Connect, start and check a freshly created container.
    async fn run_container(
        &self,
        network: &str,
        machine_name: &str,
        container_id: &str,
        spec: &MachineSpec,
    ) -> BerthResult<ContainerInfo> {
        for extra in spec.networks.iter().filter(|n| n.as_str() != network) {
            self.engine
                .connect_container_to_network(ConnectContainerParams {
                    network: extra.clone(),
                    container: container_id.to_string(),
                    aliases: vec![machine_name.to_string()],
                })
                .await
                .map_err(|e| {
                    BerthError::Provisioning(format!(
                        "Failed to connect machine '{}' to network '{}': {}",
                        machine_name, extra, e
                    ))
                })?;
        }

        self.engine
            .start_container(container_id)
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!(
                    "Failed to start machine '{}': {}",
                    machine_name, e
                ))
            })?;

        let info = self
            .engine
            .inspect_container(container_id)
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!(
                    "Failed to inspect machine '{}': {}",
                    machine_name, e
                ))
            })?;
        if info.state.is_exited() {
            return Err(BerthError::Provisioning(CONTAINER_EXITED_ERROR.to_string()));
        }
        Ok(info)
    }

    async fn cleanup_container(&self, container_id: &str) {
        if let Err(e) = self
            .engine
            .remove_container(RemoveContainerParams::forced(container_id))
            .await
        {
            tracing::error!(
                container_id,
                error = %e,
                "Failed to remove container after failed start"
            );
        } else {
            tracing::debug!(container_id, "Removed container after failed start");
        }
    }

    /// Add system ports, volumes, env and networks to a machine's own.
    fn add_system_settings(
        &self,
        spec: &mut MachineSpec,
        machine_name: &str,
        identity: &RuntimeIdentity,
        is_dev: bool,
    ) {
        let system = &self.options.system;
        let tiers = if is_dev {
            vec![&system.common, &system.dev]
        } else {
            vec![&system.common]
        };

        for tier in tiers {
            spec.expose.extend(tier.ports.iter().cloned());
            spec.volumes.extend(tier.volumes.iter().cloned());
            spec.environment
                .extend(tier.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let server_ports: Vec<String> = spec.servers.keys().map(|p| normalize_port(p)).collect();
        spec.expose.extend(server_ports);
        spec.environment
            .insert(machine_env::MACHINE_NAME.to_string(), machine_name.to_string());
        if is_dev {
            spec.environment.insert(
                machine_env::WORKSPACE_ID.to_string(),
                identity.workspace_id.clone(),
            );
            spec.environment
                .insert(machine_env::IS_DEV_MACHINE.to_string(), "true".to_string());
        }
        spec.networks
            .extend(self.options.additional_networks.iter().cloned());
    }

    /// Engine container config for a prepared machine.
    async fn container_config(
        &self,
        network: &str,
        machine_name: &str,
        image: &str,
        spec: &MachineSpec,
    ) -> BerthResult<ContainerConfig> {
        let options = &self.options;

        let mut binds = Vec::new();
        let mut volumes = BTreeMap::new();
        for volume in &spec.volumes {
            if volume.contains(':') {
                binds.push(volume.clone());
            } else {
                volumes.insert(volume.clone(), EmptyObject {});
            }
        }

        let host_config = HostConfig {
            memory: spec.mem_limit,
            memory_swap: memory_swap(spec.mem_limit, options.memory_swap_multiplier),
            network_mode: Some(network.to_string()),
            links: spec.links.clone(),
            port_bindings: spec.ports.iter().map(|p| (p.clone(), Vec::new())).collect(),
            volumes_from: spec.volumes_from.clone(),
            binds,
            pids_limit: options.pids_limit,
            extra_hosts: options.extra_hosts.clone(),
            privileged: options.privileged,
            publish_all_ports: options.publish_all_ports,
            dns: options.dns_resolvers.clone(),
            cpuset_cpus: options.cpuset_cpus.clone(),
            cpu_period: options.cpu_period,
            cpu_quota: options.cpu_quota,
            cgroup_parent: options.cgroup_parent.clone(),
        };

        let networking_config = NetworkingConfig {
            endpoints_config: BTreeMap::from([(
                network.to_string(),
                EndpointConfig {
                    aliases: vec![machine_name.to_string()],
                    links: spec.links.clone(),
                },
            )]),
        };

        let mut config = ContainerConfig {
            image: image.to_string(),
            env: spec
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels: spec.labels.clone(),
            exposed_ports: spec
                .expose
                .iter()
                .map(|p| (p.clone(), EmptyObject {}))
                .collect(),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            volumes,
            host_config: Some(host_config),
            networking_config: Some(networking_config),
        };

        self.set_non_exiting_command_if_needed(&mut config).await?;
        Ok(config)
    }

    /// Replace a command that would exit immediately with [`NON_EXITING_CMD`].
    ///
    /// The machine's own cmd and entrypoint take precedence over the image's.
    async fn set_non_exiting_command_if_needed(
        &self,
        config: &mut ContainerConfig,
    ) -> BerthResult<()> {
        let image = self
            .engine
            .inspect_image(&config.image)
            .await
            .map_err(|e| {
                BerthError::Provisioning(format!(
                    "Failed to inspect image '{}': {}",
                    config.image, e
                ))
            })?;

        let cmd = config.cmd.as_deref().or(image.config.cmd.as_deref());
        let entrypoint = config
            .entrypoint
            .as_deref()
            .or(image.config.entrypoint.as_deref());

        if is_bad_entrypoint(entrypoint) && is_bad_cmd(cmd) {
            tracing::debug!(image = %config.image, "Replacing immediately exiting command");
            config.cmd = Some(NON_EXITING_CMD.iter().map(|s| s.to_string()).collect());
            config.entrypoint = None;
        }
        Ok(())
    }
}
