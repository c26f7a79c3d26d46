//! dice CLI: tile-based deployment orchestrator.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dice",
    version,
    about = "Resolve tile deployments into ordered shell stages and run them"
)]
struct Cli {
    #[command(flatten)]
    global: dice::cli::GlobalArgs,

    #[command(subcommand)]
    command: dice::cli::Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dice::cli::dispatch(&cli.global, cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
