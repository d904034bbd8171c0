use crate::cli::GlobalFlags;
use berth::servers::create_strategy;
use clap::Args;

#[derive(Args, Debug)]
pub struct OptionsArgs {
    /// Also build the configured address strategy, failing if it cannot be built
    #[arg(long)]
    pub check: bool,
}

pub async fn execute(args: OptionsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options()?;
    if args.check {
        let strategy = create_strategy(&options.address)?;
        eprintln!("Address strategy '{}' is usable", strategy.kind());
    }
    super::print_json(&options)
}
