use crate::cli::{AddressArgs, GlobalFlags};
use anyhow::Context;
use berth::provision::DEFAULT_FALLBACK_HOST;
use berth::servers::{ServerConf, create_strategy, evaluate_servers};
use clap::Args;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ServersArgs {
    /// `docker inspect` output of the container (`-` for stdin)
    pub inspect: PathBuf,

    /// JSON object of per-port server settings (`{"8080": {"ref": "web", "protocol": "http"}}`)
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// Host used when no address is configured or reported
    #[arg(long, default_value = DEFAULT_FALLBACK_HOST)]
    pub fallback_host: String,

    #[command(flatten)]
    pub address: AddressArgs,
}

pub async fn execute(args: ServersArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = args.address.apply(global.load_options()?.address);
    let strategy = create_strategy(&options)?;
    let container = super::read_container(&args.inspect).await?;

    let overrides: HashMap<String, ServerConf> = match &args.overrides {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("{} is not a server settings object", path.display()))?
        }
        None => HashMap::new(),
    };

    let servers = evaluate_servers(strategy.as_ref(), &container, &args.fallback_host, &overrides)?;
    tracing::debug!(
        strategy = %strategy.kind(),
        servers = servers.len(),
        "Evaluated servers"
    );
    super::print_json(&servers)
}
