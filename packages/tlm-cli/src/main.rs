use anyhow::Result;
use clap::{Parser, Subcommand};
use tlm_scheduler::RationConfig;
use tracing_subscriber::EnvFilter;

mod sim;

#[derive(Parser)]
#[command(name = "tlm")]
#[command(about = "TLM tick scheduler host simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a scheduler with simulated host callbacks
    Run(sim::RunArgs),
    /// Print the default process queue options as JSON
    Opts,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => sim::run(args).await?,
        Commands::Opts => {
            println!("{}", serde_json::to_string_pretty(&RationConfig::default())?);
        }
    }

    Ok(())
}
