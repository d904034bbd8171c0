use berth::naming;
use clap::{Args, Subcommand};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct NameArgs {
    #[command(subcommand)]
    pub command: NameCommand,
}

#[derive(Subcommand, Debug)]
pub enum NameCommand {
    /// Build the container name of a machine
    Generate {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        machine: String,
        /// Server id; pass it with its `serverid-` prefix for the name to parse back
        #[arg(long)]
        server: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
    },
    /// Recover workspace, machine and server ids from container names
    Parse {
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },
}

#[derive(Serialize)]
struct ParsedName<'a> {
    name: &'a str,
    workspace_id: String,
    machine_id: String,
    server_id: String,
}

pub async fn execute(args: NameArgs) -> anyhow::Result<()> {
    match args.command {
        NameCommand::Generate {
            workspace,
            machine,
            server,
            user,
            name,
        } => {
            println!(
                "{}",
                naming::generate(&workspace, &machine, &server, &user, &name)
            );
            Ok(())
        }
        NameCommand::Parse { names } => {
            let mut errors = Vec::new();
            for name in &names {
                match naming::parse(name) {
                    Some(parsed) => super::print_json(&ParsedName {
                        name,
                        workspace_id: parsed.workspace_id,
                        machine_id: parsed.machine_id,
                        server_id: parsed.server_id,
                    })?,
                    None => {
                        eprintln!("Error: not a machine container name: {}", name);
                        errors.push(name.as_str());
                    }
                }
            }

            if !errors.is_empty() {
                anyhow::bail!(
                    "Failed to parse {} of {} name(s)",
                    errors.len(),
                    names.len()
                );
            }
            Ok(())
        }
    }
}
