//! Configuration for berth.

use crate::engine::AuthConfigs;
use crate::servers::StrategyKind;
use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Environment variables read by [`ProvisionerOptions::from_env`].
pub mod envs {
    pub const DOCKER_IP: &str = "CHE_DOCKER_IP";
    pub const DOCKER_IP_EXTERNAL: &str = "CHE_DOCKER_IP_EXTERNAL";
    pub const EVALUATION_STRATEGY: &str = "CHE_DOCKER_SERVER_EVALUATION_STRATEGY";
    pub const CUSTOM_TEMPLATE: &str = "CHE_DOCKER_SERVER_EVALUATION_STRATEGY_CUSTOM_TEMPLATE";
    pub const CUSTOM_EXTERNAL_PROTOCOL: &str =
        "CHE_DOCKER_SERVER_EVALUATION_STRATEGY_CUSTOM_EXTERNAL_PROTOCOL";
    pub const CHE_PORT: &str = "CHE_PORT";
    pub const ALWAYS_PULL_IMAGE: &str = "CHE_DOCKER_ALWAYS_PULL_IMAGE";
    pub const PRIVILEGED: &str = "CHE_DOCKER_PRIVILEGED";
    pub const REGISTRY_FOR_SNAPSHOTS: &str = "CHE_DOCKER_REGISTRY_FOR_SNAPSHOTS";
    pub const REGISTRY: &str = "CHE_DOCKER_REGISTRY";
}

// ============================================================================
// Address Options
// ============================================================================

/// Inputs of server address evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressOptions {
    /// Which evaluation strategy to use.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Address of the docker host as seen from the orchestrator (`che.docker.ip`).
    #[serde(default)]
    pub internal_ip: Option<String>,

    /// Address of the docker host as seen from clients (`che.docker.ip.external`).
    #[serde(default)]
    pub external_ip: Option<String>,

    /// Template rendered per port by the custom strategies.
    #[serde(default)]
    pub external_template: Option<String>,

    /// Protocol for external URLs. `https` turns external http URLs into https.
    #[serde(default)]
    pub external_protocol: Option<String>,

    /// Port of the orchestrator, exposed to templates as `chePort`.
    #[serde(default = "default_che_port")]
    pub che_port: u16,

    /// Fail evaluation when `externalAddress` cannot be resolved to an IP.
    #[serde(default)]
    pub throw_on_unknown_host: bool,
}

fn default_che_port() -> u16 {
    8080
}

impl Default for AddressOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            internal_ip: None,
            external_ip: None,
            external_template: None,
            external_protocol: None,
            che_port: default_che_port(),
            throw_on_unknown_host: false,
        }
    }
}

// ============================================================================
// Snapshot Options
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    /// Push snapshots to `registry` instead of keeping them local.
    #[serde(default)]
    pub use_registry: bool,

    /// Registry host, e.g. `registry.example.com:5000`.
    #[serde(default)]
    pub registry: Option<String>,
}

// ============================================================================
// System Resources
// ============================================================================

/// Ports, volumes and env added to machines on top of what they declare.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTier {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Two tiers: applied to every machine, and to dev machines only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemResources {
    #[serde(default)]
    pub common: SystemTier,
    #[serde(default)]
    pub dev: SystemTier,
}

// ============================================================================
// Provisioner Options
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerOptions {
    #[serde(default)]
    pub address: AddressOptions,

    #[serde(default)]
    pub snapshots: SnapshotOptions,

    #[serde(default)]
    pub system: SystemResources,

    /// Pull images (and base images on build) even when present locally.
    #[serde(default = "default_always_pull_image")]
    pub always_pull_image: bool,

    #[serde(default)]
    pub privileged: bool,

    /// Publish every exposed port to a random host port.
    #[serde(default = "default_publish_all_ports")]
    pub publish_all_ports: bool,

    /// Swap = memory × (multiplier + 1). `-1` means unlimited swap.
    #[serde(default = "default_memory_swap_multiplier")]
    pub memory_swap_multiplier: f64,

    /// `-1` disables the limit.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    #[serde(default)]
    pub extra_hosts: Vec<String>,

    #[serde(default)]
    pub dns_resolvers: Vec<String>,

    #[serde(default)]
    pub additional_networks: Vec<String>,

    #[serde(default)]
    pub cpuset_cpus: Option<String>,

    #[serde(default)]
    pub cpu_period: i64,

    #[serde(default)]
    pub cpu_quota: i64,

    #[serde(default)]
    pub cgroup_parent: Option<String>,

    /// Build args applied to every build. Machine-declared args win.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,

    #[serde(default)]
    pub registry_auth: AuthConfigs,
}

fn default_always_pull_image() -> bool {
    true
}

fn default_publish_all_ports() -> bool {
    true
}

fn default_memory_swap_multiplier() -> f64 {
    -1.0
}

fn default_pids_limit() -> i64 {
    -1
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            address: AddressOptions::default(),
            snapshots: SnapshotOptions::default(),
            system: SystemResources::default(),
            always_pull_image: default_always_pull_image(),
            privileged: false,
            publish_all_ports: default_publish_all_ports(),
            memory_swap_multiplier: default_memory_swap_multiplier(),
            pids_limit: default_pids_limit(),
            extra_hosts: Vec::new(),
            dns_resolvers: Vec::new(),
            additional_networks: Vec::new(),
            cpuset_cpus: None,
            cpu_period: 0,
            cpu_quota: 0,
            cgroup_parent: None,
            build_args: BTreeMap::new(),
            registry_auth: AuthConfigs::default(),
        }
    }
}

impl ProvisionerOptions {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> BerthResult<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Load a JSON options document.
    pub fn from_json_file(path: impl AsRef<Path>) -> BerthResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BerthError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: Self = serde_json::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Overlay values from `lookup` (an environment accessor). Empty values count as unset.
    pub fn with_env<F>(mut self, lookup: F) -> BerthResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(ip) = get(envs::DOCKER_IP) {
            self.address.internal_ip = Some(ip);
        }
        if let Some(ip) = get(envs::DOCKER_IP_EXTERNAL) {
            self.address.external_ip = Some(ip);
        }
        if let Some(strategy) = get(envs::EVALUATION_STRATEGY) {
            self.address.strategy = StrategyKind::from_str(&strategy)?;
        }
        if let Some(template) = get(envs::CUSTOM_TEMPLATE) {
            self.address.external_template = Some(template);
        }
        if let Some(protocol) = get(envs::CUSTOM_EXTERNAL_PROTOCOL) {
            self.address.external_protocol = Some(protocol);
        }
        if let Some(port) = get(envs::CHE_PORT) {
            self.address.che_port = port.trim().parse().map_err(|_| {
                BerthError::Config(format!("{} must be a port number, got '{}'", envs::CHE_PORT, port))
            })?;
        }
        if let Some(value) = get(envs::ALWAYS_PULL_IMAGE) {
            self.always_pull_image = parse_bool(envs::ALWAYS_PULL_IMAGE, &value)?;
        }
        if let Some(value) = get(envs::PRIVILEGED) {
            self.privileged = parse_bool(envs::PRIVILEGED, &value)?;
        }
        if let Some(value) = get(envs::REGISTRY_FOR_SNAPSHOTS) {
            self.snapshots.use_registry = parse_bool(envs::REGISTRY_FOR_SNAPSHOTS, &value)?;
        }
        if let Some(registry) = get(envs::REGISTRY) {
            self.snapshots.registry = Some(registry);
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> BerthResult<()> {
        if self.address.strategy.needs_template()
            && self
                .address
                .external_template
                .as_deref()
                .is_none_or(|t| t.trim().is_empty())
        {
            return Err(BerthError::Config(format!(
                "strategy '{}' requires an external address template",
                self.address.strategy
            )));
        }
        if self.memory_swap_multiplier < 0.0 && self.memory_swap_multiplier != -1.0 {
            return Err(BerthError::Config(format!(
                "memory swap multiplier must be -1 or non-negative, got {}",
                self.memory_swap_multiplier
            )));
        }
        if self.snapshots.use_registry && self.snapshots.registry.is_none() {
            return Err(BerthError::Config(
                "registry snapshots enabled but no registry configured".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> BerthResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(BerthError::Config(format!(
            "{} must be true or false, got '{}'",
            key, other
        ))),
    }
}
