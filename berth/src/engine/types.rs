//! Engine request/response types.
//!
//! Inspect documents keep the engine's JSON shape (PascalCase keys) so an
//! inspect dump can be loaded directly with `serde_json`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Placeholder for engine maps whose values are always `{}` (exposed ports, volumes).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

// ============================================================================
// CONTAINERS
// ============================================================================

/// Result of `inspect_container`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerInfo {
    /// Value of a `KEY=value` entry in the container environment.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_value(&self.config.env, key)
    }
}

/// Look up `key` in a `KEY=value` environment list.
pub fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

/// Container configuration. Used both in inspect output and create requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, EmptyObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking_config: Option<NetworkingConfig>,
}

/// Host-side container settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub memory_swap: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    #[serde(default)]
    pub pids_limit: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub publish_all_ports: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_parent: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    #[serde(default)]
    pub endpoints_config: BTreeMap<String, EndpointConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

/// One host-side binding of an exposed port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

/// Network state of a running container. Only trusted after a successful inspect.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    pub ip_address: String,
    #[serde(default)]
    pub gateway: String,
    /// `port/proto` → bindings. The engine reports unbound ports as `null`.
    #[serde(default)]
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

impl NetworkSettings {
    /// First host binding of each port that has one.
    pub fn bound_ports(&self) -> impl Iterator<Item = (&String, &PortBinding)> {
        self.ports.iter().filter_map(|(port, bindings)| {
            bindings
                .as_ref()
                .and_then(|b| b.first())
                .map(|binding| (port, binding))
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// `created`, `running`, `paused`, `restarting`, `exited`, `dead`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, rename = "OOMKilled")]
    pub oom_killed: bool,
    #[serde(default)]
    pub exit_code: i64,
}

impl ContainerState {
    pub fn is_exited(&self) -> bool {
        self.status == "exited"
    }
}

#[derive(Clone, Debug)]
pub struct CreateContainerParams {
    pub config: ContainerConfig,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreated {
    pub id: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RemoveContainerParams {
    pub container: String,
    pub force: bool,
    pub remove_volumes: bool,
}

impl RemoveContainerParams {
    /// Forced removal together with anonymous volumes.
    pub fn forced(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            force: true,
            remove_volumes: true,
        }
    }
}

// ============================================================================
// IMAGES
// ============================================================================

/// Result of `inspect_image`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub config: ImageConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Entry of `list_images`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

/// Registry credentials, keyed by registry host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfigs {
    #[serde(flatten)]
    pub configs: HashMap<String, AuthConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Where an image build reads its Dockerfile from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildSource {
    /// A materialized Dockerfile on the local filesystem.
    Dockerfile(PathBuf),
    /// A build context location (path or URL) with an optional Dockerfile path inside it.
    Context {
        location: String,
        dockerfile: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct BuildImageParams {
    pub source: BuildSource,
    pub repository: String,
    pub force_pull: bool,
    pub remove_intermediate_containers: bool,
    pub build_args: BTreeMap<String, String>,
    pub memory_limit: i64,
    pub memory_swap_limit: i64,
    pub cpuset_cpus: Option<String>,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub auth: AuthConfigs,
}

#[derive(Clone, Debug)]
pub struct PullParams {
    pub repository: String,
    pub tag: String,
    pub registry: Option<String>,
    pub auth: AuthConfigs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagParams {
    /// Existing image reference.
    pub image: String,
    /// New repository name (tag defaults to `latest`).
    pub repository: String,
    pub tag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PushParams {
    pub repository: String,
    pub tag: Option<String>,
    pub registry: Option<String>,
    pub auth: AuthConfigs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitParams {
    pub container: String,
    pub repository: String,
    pub tag: Option<String>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveImageParams {
    pub image: String,
    pub force: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListImagesParams {
    /// `reference` filter; `None` lists everything.
    pub reference: Option<String>,
}

/// Progress lines reported by build/pull/push.
pub type ProgressSender = mpsc::UnboundedSender<String>;

// ============================================================================
// NETWORKS
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateNetworkParams {
    pub name: String,
    pub driver: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub check_duplicate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectContainerParams {
    pub network: String,
    pub container: String,
    pub aliases: Vec<String>,
}

// ============================================================================
// EXEC
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateExecParams {
    pub container: String,
    pub cmd: Vec<String>,
    pub detach: bool,
}

impl CreateExecParams {
    /// Exec with stdout/stderr attached.
    pub fn attached(container: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            container: container.into(),
            cmd,
            detach: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCreated {
    pub id: String,
}

/// Output stream of a log or exec message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

/// One line of container or exec output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub stream: StreamKind,
    pub content: String,
}

impl LogMessage {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            content: content.into(),
        }
    }
}

pub type LogSender = mpsc::UnboundedSender<LogMessage>;

// ============================================================================
// STREAMS
// ============================================================================

/// Filter for the engine event stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventsParams {
    /// Unix seconds; events at or after this instant.
    pub since: Option<i64>,
    pub until: Option<i64>,
    /// `type` filter (e.g. `container`).
    pub types: Vec<String>,
    /// `event` filter (e.g. `die`, `oom`).
    pub statuses: Vec<String>,
}

/// One engine event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    /// Unix seconds.
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogsParams {
    pub container: String,
    pub follow: bool,
    /// Unix seconds; 0 means from the beginning.
    pub since: i64,
}
