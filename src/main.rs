use anyhow::Result;
use clap::{Parser, Subcommand};
use convene::app;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convene", about = "Live meeting-agent session orchestrator")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(CliCommand::Version) => {
            println!("Convene {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        None => {}
    }

    app::run_service().await
}
