//! Server address resolution.
//!
//! Turns the network state of an inspected container into the set of
//! servers a workspace machine exposes. The address maps come from a
//! pluggable [`AddressStrategy`]; reference names, protocols and paths come
//! from an override map or from `che:server:*` container labels.

pub mod session;
pub mod strategy;
pub mod template;

pub use session::{HostResolver, RenderSession, SystemResolver};
pub use strategy::{
    AddressMap, AddressStrategy, AlwaysExternalCustomStrategy, CustomStrategy, DefaultStrategy,
    LocalDockerCustomStrategy, LocalDockerSinglePortStrategy, LocalDockerStrategy,
};
pub use template::{Template, TemplateProperties};

use crate::engine::ContainerInfo;
use crate::options::AddressOptions;
use berth_shared::constants::labels;
use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// Strategy selection
// ============================================================================

/// Address evaluation strategy names, as used in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Default,
    DockerLocal,
    Custom,
    DockerLocalCustom,
    DockerLocalSinglePort,
    AlwaysExternalCustom,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Default,
        StrategyKind::DockerLocal,
        StrategyKind::Custom,
        StrategyKind::DockerLocalCustom,
        StrategyKind::DockerLocalSinglePort,
        StrategyKind::AlwaysExternalCustom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Default => "default",
            StrategyKind::DockerLocal => "docker-local",
            StrategyKind::Custom => "custom",
            StrategyKind::DockerLocalCustom => "docker-local-custom",
            StrategyKind::DockerLocalSinglePort => "docker-local-single-port",
            StrategyKind::AlwaysExternalCustom => "always-external-custom",
        }
    }

    /// Whether the strategy renders a user-supplied template.
    pub fn needs_template(&self) -> bool {
        matches!(
            self,
            StrategyKind::Custom
                | StrategyKind::DockerLocalCustom
                | StrategyKind::AlwaysExternalCustom
        )
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| {
                BerthError::Config(format!(
                    "unknown server evaluation strategy '{}' (expected one of: {})",
                    s,
                    Self::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}

/// Build the configured strategy with the system host resolver.
pub fn create_strategy(options: &AddressOptions) -> BerthResult<Arc<dyn AddressStrategy>> {
    create_strategy_with_resolver(options, Arc::new(SystemResolver))
}

pub fn create_strategy_with_resolver(
    options: &AddressOptions,
    resolver: Arc<dyn HostResolver>,
) -> BerthResult<Arc<dyn AddressStrategy>> {
    let template = || -> BerthResult<Template> {
        match options.external_template.as_deref() {
            Some(t) if !t.trim().is_empty() => Template::parse(t),
            _ => Err(BerthError::Config(format!(
                "strategy '{}' requires an external address template",
                options.strategy
            ))),
        }
    };

    let strategy: Arc<dyn AddressStrategy> = match options.strategy {
        StrategyKind::Default => Arc::new(DefaultStrategy::new(options)),
        StrategyKind::DockerLocal => Arc::new(LocalDockerStrategy::new(options)),
        StrategyKind::Custom => Arc::new(CustomStrategy::new(options, template()?, resolver)),
        StrategyKind::DockerLocalCustom => Arc::new(LocalDockerCustomStrategy::new(
            options,
            template()?,
            resolver,
        )),
        StrategyKind::DockerLocalSinglePort => {
            Arc::new(LocalDockerSinglePortStrategy::new(options, resolver)?)
        }
        StrategyKind::AlwaysExternalCustom => Arc::new(AlwaysExternalCustomStrategy::new(
            options,
            template()?,
            resolver,
        )),
    };
    Ok(strategy)
}

// ============================================================================
// Server evaluation
// ============================================================================

/// Caller-supplied server metadata. Takes precedence over container labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConf {
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// One server exposed by a machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMapping {
    #[serde(rename = "ref")]
    pub reference: String,
    /// External `host:port`.
    pub address: String,
    pub protocol: Option<String>,
    /// External URL, when a protocol is known.
    pub url: Option<String>,
    pub path: Option<String>,
    pub internal_address: String,
    pub internal_url: Option<String>,
}

/// `8080` → `8080/tcp`; keys that already carry a protocol are unchanged.
pub fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{}/tcp", port)
    }
}

/// `8080/tcp` → `server-8080-tcp`.
pub fn default_server_ref(port: &str) -> String {
    format!("server-{}", port.replace('/', "-"))
}

/// Derive the servers of `container`: exactly one entry per bound port key.
pub fn evaluate_servers(
    strategy: &dyn AddressStrategy,
    container: &ContainerInfo,
    fallback_host: &str,
    overrides: &HashMap<String, ServerConf>,
) -> BerthResult<BTreeMap<String, ServerMapping>> {
    let internal = strategy.internal_addresses(container, fallback_host)?;
    let external = strategy.external_addresses(container, fallback_host)?;
    let https = strategy.https_for_external();

    let mut servers = BTreeMap::new();
    for (port, _) in container.network_settings.bound_ports() {
        let (Some(internal_address), Some(external_address)) =
            (internal.get(port), external.get(port))
        else {
            return Err(BerthError::Internal(format!(
                "port {} of container {} is missing from the {} address map",
                port,
                container.id,
                if internal.contains_key(port) {
                    "external"
                } else {
                    "internal"
                }
            )));
        };

        let conf = server_conf(port, &container.config.labels, overrides);
        let reference = conf
            .reference
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| default_server_ref(port));

        let (url, internal_url) = match conf.protocol.as_deref() {
            Some(protocol) => {
                let suffix = path_suffix(conf.path.as_deref());
                let external_protocol = if https && protocol == "http" {
                    "https"
                } else {
                    protocol
                };
                (
                    Some(format!("{}://{}{}", external_protocol, external_address, suffix)),
                    Some(format!("{}://{}{}", protocol, internal_address, suffix)),
                )
            }
            None => (None, None),
        };

        servers.insert(
            port.clone(),
            ServerMapping {
                reference,
                address: external_address.clone(),
                protocol: conf.protocol,
                url,
                path: conf.path,
                internal_address: internal_address.clone(),
                internal_url,
            },
        );
    }
    Ok(servers)
}

fn path_suffix(path: Option<&str>) -> String {
    match path {
        Some(p) if !p.is_empty() && !p.starts_with('/') => format!("/{}", p),
        Some(p) => p.to_string(),
        None => String::new(),
    }
}

/// Metadata of one port: override map first, then labels. Either source may
/// key the port with or without its `/tcp` suffix.
fn server_conf(
    port: &str,
    container_labels: &BTreeMap<String, String>,
    overrides: &HashMap<String, ServerConf>,
) -> ServerConf {
    let short = port.strip_suffix("/tcp");

    if let Some(conf) = overrides
        .get(port)
        .or_else(|| short.and_then(|s| overrides.get(s)))
    {
        return conf.clone();
    }

    let label = |suffix: &str| {
        container_labels
            .get(&labels::server_label(port, suffix))
            .or_else(|| short.and_then(|s| container_labels.get(&labels::server_label(s, suffix))))
            .cloned()
    };

    ServerConf {
        reference: label(labels::REF_SUFFIX),
        protocol: label(labels::PROTOCOL_SUFFIX),
        path: label(labels::PATH_SUFFIX),
    }
}
