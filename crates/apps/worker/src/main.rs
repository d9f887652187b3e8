use app_state::{DEFAULT_SETTINGS_PATH, load_app_settings_from};
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::context::WorkerOptions;
use worker::worker::create_worker;

#[derive(Parser, Debug)]
#[command(version, about = "Claims jobs from the shared pool and processes them", long_about = None)]
struct Args {
    /// Settings file.
    #[clap(long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Items of one batch processed at the same time.
    #[clap(long)]
    concurrency: Option<usize>,

    /// Jobs claimed per round trip to the pool.
    #[clap(long)]
    batch_size: Option<u32>,

    /// Exit once the pool has nothing left for this worker.
    #[clap(long, default_value_t = false, action)]
    once: bool,
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Can't listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Can't listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown requested, finishing the current batch");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let settings = load_app_settings_from(&args.config)?;

    let default_filter = format!("worker={0},common_services={0}", settings.logging.level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut options = WorkerOptions::from_settings(&settings.worker);
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size.max(1);
    }
    options.stop_on_idle = args.once;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    create_worker(&settings, options, shutdown).await?;

    Ok(())
}
