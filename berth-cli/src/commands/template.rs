use crate::cli::{AddressArgs, GlobalFlags};
use berth::provision::DEFAULT_FALLBACK_HOST;
use berth::servers::{RenderSession, StrategyKind, SystemResolver, Template};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Template, e.g. `<serverName>.<workspaceId>.<wildcardNipDomain>`
    pub template: String,

    /// `docker inspect` output of the container (`-` for stdin)
    #[arg(long)]
    pub inspect: PathBuf,

    /// Ports to render for; defaults to every exposed port
    #[arg(long = "port")]
    pub ports: Vec<String>,

    /// Host used when no address is configured or reported
    #[arg(long, default_value = DEFAULT_FALLBACK_HOST)]
    pub fallback_host: String,

    #[command(flatten)]
    pub address: AddressArgs,
}

pub async fn execute(args: TemplateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = args.address.apply(global.load_options()?.address);
    let template = Template::parse(&args.template)?;
    let container = super::read_container(&args.inspect).await?;

    let local_docker = matches!(
        options.strategy,
        StrategyKind::DockerLocal
            | StrategyKind::DockerLocalCustom
            | StrategyKind::DockerLocalSinglePort
    );
    let session = RenderSession::online(
        &container,
        &args.fallback_host,
        &options,
        local_docker,
        &SystemResolver,
    )?;

    let ports = if args.ports.is_empty() {
        container.config.exposed_ports.keys().cloned().collect()
    } else {
        args.ports
    };
    if ports.is_empty() {
        anyhow::bail!("container exposes no ports; pass --port");
    }

    for port in ports {
        println!("{}\t{}", port, session.render(&template, &port));
    }
    Ok(())
}
