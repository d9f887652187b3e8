use app_state::{DEFAULT_SETTINGS_PATH, load_app_settings_from};
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tasks::commands::{Command, run_command};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Operator commands for the shared job pool.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file.
    #[clap(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let settings = load_app_settings_from(&cli.config)?;

    let default_filter = format!("tasks={0},common_services={0}", settings.logging.level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_command(cli.command, &settings).await?;

    Ok(())
}
