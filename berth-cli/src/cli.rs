use crate::commands;
use anyhow::Context;
use berth::ProvisionerOptions;
use berth::options::AddressOptions;
use berth::servers::StrategyKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "berth", version, about = "Workspace container orchestration tools")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate or parse machine container names
    Name(commands::name::NameArgs),
    /// Evaluate the servers of an inspected container
    Servers(commands::servers::ServersArgs),
    /// Render an address template against an inspected container
    Template(commands::template::TemplateArgs),
    /// Print the effective provisioner options
    Options(commands::options::OptionsArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Options document (JSON). Without it, options come from CHE_* environment variables
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter for stderr output, e.g. `debug` or `berth=trace`
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

impl GlobalFlags {
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.log_level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    /// Options from `--config` or the environment.
    pub fn load_options(&self) -> anyhow::Result<ProvisionerOptions> {
        let options = match &self.config {
            Some(path) => ProvisionerOptions::from_json_file(path)
                .with_context(|| format!("loading options from {}", path.display()))?,
            None => ProvisionerOptions::from_env().context("reading options from environment")?,
        };
        tracing::debug!(strategy = %options.address.strategy, "Loaded options");
        Ok(options)
    }
}

/// Address evaluation overrides shared by `servers` and `template`.
#[derive(Args, Debug, Default)]
pub struct AddressArgs {
    /// Evaluation strategy (default, docker-local, custom, docker-local-custom,
    /// docker-local-single-port, always-external-custom)
    #[arg(long)]
    pub strategy: Option<StrategyKind>,

    /// Docker host address as seen from the orchestrator
    #[arg(long)]
    pub internal_ip: Option<String>,

    /// Docker host address as seen from clients
    #[arg(long)]
    pub external_ip: Option<String>,

    /// External address template for the custom strategies
    #[arg(long)]
    pub external_template: Option<String>,

    /// Protocol of external URLs (`https` upgrades http servers)
    #[arg(long)]
    pub external_protocol: Option<String>,

    /// Orchestrator port, exposed to templates as `chePort`
    #[arg(long)]
    pub che_port: Option<u16>,
}

impl AddressArgs {
    /// Apply the flags on top of configured address options.
    pub fn apply(&self, mut options: AddressOptions) -> AddressOptions {
        if let Some(strategy) = self.strategy {
            options.strategy = strategy;
        }
        if let Some(ip) = &self.internal_ip {
            options.internal_ip = Some(ip.clone());
        }
        if let Some(ip) = &self.external_ip {
            options.external_ip = Some(ip.clone());
        }
        if let Some(template) = &self.external_template {
            options.external_template = Some(template.clone());
        }
        if let Some(protocol) = &self.external_protocol {
            options.external_protocol = Some(protocol.clone());
        }
        if let Some(port) = self.che_port {
            options.che_port = port;
        }
        options
    }
}
