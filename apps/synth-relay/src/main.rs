mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use synth_relay::{build_relay, config::Config, router, storage::build_store, telemetry};

#[tokio::main]
async fn main() {
    let mut config = Config::from_env();
    telemetry::init_tracing(&config.log_filter);

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Probe { url, id, wait }) => cli::run_probe(url, id, wait).await,
        Some(Commands::Takeover { url, id }) => cli::run_takeover(url, id).await,
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        None => serve(config).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(
        port = config.port,
        store = ?config.store_backend,
        queue_ttl = config.queue_ttl_seconds,
        idle_timeout = config.idle_timeout_seconds,
        "starting synth relay"
    );

    let metrics = match telemetry::install_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("metrics disabled: {:#}", e);
            None
        }
    };

    let store = build_store(&config)
        .await
        .context("failed to initialise queue store")?;
    let relay = build_relay(store, &config);
    let app = router(relay, &config, metrics);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("synth relay listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
