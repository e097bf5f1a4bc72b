use clap::Parser;

use parxfer::dispatch::{Cli, Command};
use parxfer::error::Error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command_log_name = match &cli.command {
        Command::Rm { .. } => "rm",
        Command::Cp { .. } => "cp",
        Command::Mv { .. } => "mv",
        Command::Ls { .. } => "ls",
        Command::Run { .. } => "run",
    };
    let _guard = parxfer::init_logging(&format!("parxfer_{command_log_name}_{}.log", std::process::id()));

    let result = parxfer::dispatch::run(cli).await;
    match result {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<Error>() {
            Some(Error::Usage(_)) => {
                eprintln!("{err}");
                std::process::exit(255);
            }
            Some(Error::Cancelled) => std::process::exit(1),
            _ => {
                tracing::error!("{err:#}");
                std::process::exit(1);
            }
        },
    }
}
