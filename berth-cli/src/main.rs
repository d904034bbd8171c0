mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.global.init_tracing();

    let result = match cli.command {
        Commands::Name(args) => commands::name::execute(args).await,
        Commands::Servers(args) => commands::servers::execute(args, &cli.global).await,
        Commands::Template(args) => commands::template::execute(args, &cli.global).await,
        Commands::Options(args) => commands::options::execute(args, &cli.global).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
