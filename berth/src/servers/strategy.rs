//! Address evaluation strategies.
//!
//! Each strategy maps every bound `port/proto` key of a container to an
//! internal and an external `host:port` (or host-only, for single-port
//! ingress) address.

use super::StrategyKind;
use super::session::{HostResolver, RenderSession};
use super::template::Template;
use crate::engine::ContainerInfo;
use crate::options::AddressOptions;
use berth_shared::errors::BerthResult;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `port/proto` → address.
pub type AddressMap = BTreeMap<String, String>;

/// Template used by the single-port strategy for external addresses.
pub const SINGLE_PORT_TEMPLATE: &str = "<serverName>-<workspaceIdWithoutPrefix>-<externalAddress>";

/// Strategy seam for server address evaluation.
pub trait AddressStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Addresses the orchestrator uses to reach the servers.
    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap>;

    /// Addresses clients use to reach the servers.
    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap>;

    /// Whether external http URLs are switched to https.
    fn https_for_external(&self) -> bool {
        false
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// `address:port` for every bound port, using either the container-side port
/// or the first published host port.
fn port_addresses(address: &str, container: &ContainerInfo, container_ports: bool) -> AddressMap {
    container
        .network_settings
        .bound_ports()
        .map(|(port, binding)| {
            let port_number = if container_ports {
                port.split('/').next().unwrap_or(port.as_str())
            } else {
                binding.host_port.as_str()
            };
            (port.clone(), format!("{}:{}", address, port_number))
        })
        .collect()
}

/// Configured internal IP, else the fallback host, on published ports.
fn configured_internal(
    internal_ip: Option<&str>,
    container: &ContainerInfo,
    fallback_host: &str,
) -> AddressMap {
    port_addresses(internal_ip.unwrap_or(fallback_host), container, false)
}

/// Container network IP on container ports, else the fallback host on published ports.
fn container_internal(container: &ContainerInfo, fallback_host: &str) -> AddressMap {
    let ip = container.network_settings.ip_address.as_str();
    if ip.is_empty() {
        port_addresses(fallback_host, container, false)
    } else {
        port_addresses(ip, container, true)
    }
}

fn wants_https(options: &AddressOptions) -> bool {
    options.external_protocol.as_deref() == Some("https")
}

/// Renders a template per bound port through a fresh [`RenderSession`].
#[derive(Clone)]
pub struct TemplatedAddresses {
    options: AddressOptions,
    template: Template,
    resolver: Arc<dyn HostResolver>,
}

impl TemplatedAddresses {
    pub fn new(
        options: AddressOptions,
        template: Template,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            options,
            template,
            resolver,
        }
    }

    fn addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
        local_docker: bool,
    ) -> BerthResult<AddressMap> {
        let session = RenderSession::online(
            container,
            fallback_host,
            &self.options,
            local_docker,
            self.resolver.as_ref(),
        )?;
        Ok(container
            .network_settings
            .bound_ports()
            .map(|(port, _)| (port.clone(), session.render(&self.template, port)))
            .collect())
    }
}

// ============================================================================
// Default
// ============================================================================

/// Configured IPs on published host ports.
#[derive(Clone, Debug, Default)]
pub struct DefaultStrategy {
    internal_ip: Option<String>,
    external_ip: Option<String>,
}

impl DefaultStrategy {
    pub fn new(options: &AddressOptions) -> Self {
        Self {
            internal_ip: options.internal_ip.clone(),
            external_ip: options.external_ip.clone(),
        }
    }
}

impl AddressStrategy for DefaultStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Default
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        Ok(configured_internal(
            self.internal_ip.as_deref(),
            container,
            fallback_host,
        ))
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        let address = self
            .external_ip
            .as_deref()
            .or(self.internal_ip.as_deref())
            .unwrap_or(fallback_host);
        Ok(port_addresses(address, container, false))
    }
}

// ============================================================================
// LocalDocker
// ============================================================================

/// The orchestrator shares the container network with the machines.
#[derive(Clone, Debug, Default)]
pub struct LocalDockerStrategy {
    external_ip: Option<String>,
}

impl LocalDockerStrategy {
    pub fn new(options: &AddressOptions) -> Self {
        Self {
            external_ip: options.external_ip.clone(),
        }
    }
}

impl AddressStrategy for LocalDockerStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DockerLocal
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        Ok(container_internal(container, fallback_host))
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        let gateway = container.network_settings.gateway.as_str();
        let address = match self.external_ip.as_deref() {
            Some(ip) => ip,
            None if !gateway.is_empty() => gateway,
            None => fallback_host,
        };
        Ok(port_addresses(address, container, false))
    }
}

// ============================================================================
// Template-driven strategies
// ============================================================================

/// External addresses rendered from a template; internal as [`DefaultStrategy`].
#[derive(Clone)]
pub struct CustomStrategy {
    internal_ip: Option<String>,
    https: bool,
    external: TemplatedAddresses,
}

impl CustomStrategy {
    pub fn new(options: &AddressOptions, template: Template, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            internal_ip: options.internal_ip.clone(),
            https: wants_https(options),
            external: TemplatedAddresses::new(options.clone(), template, resolver),
        }
    }
}

impl AddressStrategy for CustomStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        Ok(configured_internal(
            self.internal_ip.as_deref(),
            container,
            fallback_host,
        ))
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        self.external.addresses(container, fallback_host, false)
    }

    fn https_for_external(&self) -> bool {
        self.https
    }
}

/// External addresses rendered from a template; internal as [`LocalDockerStrategy`].
#[derive(Clone)]
pub struct LocalDockerCustomStrategy {
    https: bool,
    external: TemplatedAddresses,
}

impl LocalDockerCustomStrategy {
    pub fn new(options: &AddressOptions, template: Template, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            https: wants_https(options),
            external: TemplatedAddresses::new(options.clone(), template, resolver),
        }
    }
}

impl AddressStrategy for LocalDockerCustomStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DockerLocalCustom
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        Ok(container_internal(container, fallback_host))
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        self.external.addresses(container, fallback_host, true)
    }

    fn https_for_external(&self) -> bool {
        self.https
    }
}

/// Every server shares one ingress port and is told apart by host name.
#[derive(Clone)]
pub struct LocalDockerSinglePortStrategy {
    https: bool,
    external: TemplatedAddresses,
}

impl LocalDockerSinglePortStrategy {
    pub fn new(options: &AddressOptions, resolver: Arc<dyn HostResolver>) -> BerthResult<Self> {
        Ok(Self {
            https: wants_https(options),
            external: TemplatedAddresses::new(
                options.clone(),
                Template::parse(SINGLE_PORT_TEMPLATE)?,
                resolver,
            ),
        })
    }
}

impl AddressStrategy for LocalDockerSinglePortStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DockerLocalSinglePort
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        Ok(container_internal(container, fallback_host))
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        self.external.addresses(container, fallback_host, true)
    }

    fn https_for_external(&self) -> bool {
        self.https
    }
}

/// Internal and external addresses both rendered from the template.
#[derive(Clone)]
pub struct AlwaysExternalCustomStrategy {
    https: bool,
    addresses: TemplatedAddresses,
}

impl AlwaysExternalCustomStrategy {
    pub fn new(options: &AddressOptions, template: Template, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            https: wants_https(options),
            addresses: TemplatedAddresses::new(options.clone(), template, resolver),
        }
    }
}

impl AddressStrategy for AlwaysExternalCustomStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AlwaysExternalCustom
    }

    fn internal_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        self.addresses.addresses(container, fallback_host, false)
    }

    fn external_addresses(
        &self,
        container: &ContainerInfo,
        fallback_host: &str,
    ) -> BerthResult<AddressMap> {
        self.addresses.addresses(container, fallback_host, false)
    }

    fn https_for_external(&self) -> bool {
        self.https
    }
}
