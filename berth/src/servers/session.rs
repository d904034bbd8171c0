//! Template property sessions.
//!
//! A [`RenderSession`] computes the global template properties once (including
//! the DNS lookup behind `externalIP`) and renders any number of ports with
//! them.

use super::template::{Template, TemplateProperties};
use super::{default_server_ref, normalize_port};
use crate::engine::{ContainerInfo, env_value};
use crate::options::AddressOptions;
use berth_shared::constants::{labels as server_labels, machine_env};
use berth_shared::errors::{BerthError, BerthResult};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, ToSocketAddrs};

/// Template property names.
pub mod props {
    pub const INTERNAL_IP: &str = "internalIp";
    pub const EXTERNAL_ADDRESS: &str = "externalAddress";
    pub const EXTERNAL_IP: &str = "externalIP";
    pub const WORKSPACE_ID: &str = "workspaceId";
    pub const WORKSPACE_ID_WITHOUT_PREFIX: &str = "workspaceIdWithoutPrefix";
    pub const MACHINE_NAME: &str = "machineName";
    pub const WILDCARD_NIP_DOMAIN: &str = "wildcardNipDomain";
    pub const WILDCARD_XIP_DOMAIN: &str = "wildcardXipDomain";
    pub const CHE_PORT: &str = "chePort";
    pub const IS_DEV_MACHINE: &str = "isDevMachine";
    pub const SERVER_NAME: &str = "serverName";
}

/// Resolves host names to IP addresses for the `externalIP` property.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// System resolver. IP literals are parsed without a lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        if host.is_empty() {
            return None;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        (host, 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
    }
}

/// Properties computed once per evaluation and reused for every port.
#[derive(Clone, Debug)]
pub struct RenderSession {
    globals: TemplateProperties,
    port_refs: HashMap<String, String>,
    external_address: String,
}

impl RenderSession {
    /// Session over an inspected container.
    ///
    /// `local_docker` selects how `externalAddress` falls back when no external
    /// IP is configured: straight to the container gateway, or through the
    /// configured internal IP first.
    pub fn online(
        container: &ContainerInfo,
        fallback_host: &str,
        options: &AddressOptions,
        local_docker: bool,
        resolver: &dyn HostResolver,
    ) -> BerthResult<Self> {
        let gateway = non_empty(&container.network_settings.gateway);
        let external_address = if local_docker {
            options
                .external_ip
                .clone()
                .or(gateway)
                .unwrap_or_else(|| fallback_host.to_string())
        } else {
            options
                .external_ip
                .clone()
                .or_else(|| options.internal_ip.clone())
                .or(gateway)
                .unwrap_or_else(|| fallback_host.to_string())
        };

        Self::build(
            &container.config.labels,
            container.config.exposed_ports.keys().cloned(),
            &container.config.env,
            external_address,
            options,
            resolver,
        )
    }

    /// Session before the container exists, from merged image and machine data.
    pub fn offline(
        labels: &BTreeMap<String, String>,
        exposed_ports: impl IntoIterator<Item = String>,
        env: &[String],
        options: &AddressOptions,
        resolver: &dyn HostResolver,
    ) -> BerthResult<Self> {
        let external_address = options
            .external_ip
            .clone()
            .or_else(|| options.internal_ip.clone())
            .unwrap_or_default();
        Self::build(labels, exposed_ports, env, external_address, options, resolver)
    }

    fn build(
        labels: &BTreeMap<String, String>,
        exposed_ports: impl IntoIterator<Item = String>,
        env: &[String],
        external_address: String,
        options: &AddressOptions,
        resolver: &dyn HostResolver,
    ) -> BerthResult<Self> {
        let port_refs = port_refs(labels, exposed_ports);

        let external_ip = match resolver.resolve(&external_address) {
            Some(ip) => ip.to_string(),
            None if options.throw_on_unknown_host => {
                return Err(BerthError::Config(format!(
                    "unable to find the IP for the address '{}'",
                    external_address
                )));
            }
            None => String::new(),
        };

        let workspace_id = env_value(env, machine_env::WORKSPACE_ID).unwrap_or_default();
        let workspace_id_without_prefix = workspace_id
            .strip_prefix(machine_env::WORKSPACE_ID_PREFIX)
            .unwrap_or(workspace_id);
        let is_dev_machine = env_value(env, machine_env::IS_DEV_MACHINE)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        let mut globals = TemplateProperties::new();
        globals
            .set_text(props::INTERNAL_IP, options.internal_ip.clone().unwrap_or_default())
            .set_text(props::EXTERNAL_ADDRESS, external_address.clone())
            .set_text(props::EXTERNAL_IP, external_ip.clone())
            .set_text(props::WORKSPACE_ID, workspace_id)
            .set_text(props::WORKSPACE_ID_WITHOUT_PREFIX, workspace_id_without_prefix)
            .set_text(
                props::MACHINE_NAME,
                env_value(env, machine_env::MACHINE_NAME).unwrap_or_default(),
            )
            .set_text(props::WILDCARD_NIP_DOMAIN, wildcard_domain(&external_ip, "nip.io"))
            .set_text(props::WILDCARD_XIP_DOMAIN, wildcard_domain(&external_ip, "xip.io"))
            .set_text(props::CHE_PORT, options.che_port.to_string())
            .set_flag(props::IS_DEV_MACHINE, is_dev_machine);

        Ok(Self {
            globals,
            port_refs,
            external_address,
        })
    }

    /// Address clients should use when no template applies.
    pub fn external_address(&self) -> &str {
        &self.external_address
    }

    /// Global properties (without `serverName`).
    pub fn properties(&self) -> &TemplateProperties {
        &self.globals
    }

    /// Server reference name for a `port/proto` key.
    pub fn server_name(&self, port: &str) -> String {
        let port = normalize_port(port);
        self.port_refs
            .get(&port)
            .cloned()
            .unwrap_or_else(|| default_server_ref(&port))
    }

    /// Render `template` for one port.
    pub fn render(&self, template: &Template, port: &str) -> String {
        let mut properties = self.globals.clone();
        properties.set_text(props::SERVER_NAME, self.server_name(port));
        template.render(&properties)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn wildcard_domain(ip: &str, suffix: &str) -> String {
    if ip.is_empty() {
        String::new()
    } else {
        format!("{}.{}", ip, suffix)
    }
}

/// `port/proto` → ref from `che:server:<port>:ref` labels, defaulted for the rest.
fn port_refs(
    labels: &BTreeMap<String, String>,
    exposed_ports: impl IntoIterator<Item = String>,
) -> HashMap<String, String> {
    let mut refs: HashMap<String, String> = labels
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(server_labels::SERVER_PREFIX)
                .and_then(|rest| rest.strip_suffix(server_labels::REF_SUFFIX))
                .map(|port| (normalize_port(port), value.clone()))
        })
        .collect();

    for port in exposed_ports {
        let port = normalize_port(&port);
        refs.entry(port.clone())
            .or_insert_with(|| default_server_ref(&port));
    }
    refs
}
