use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lorawan_bridge::orchestrator::UpstreamStatus;
use lorawan_bridge::telemetry::{self, LogFormat};
use lorawan_bridge::{
    BridgeConfig, BridgeOrchestrator, ChirpStackSubscriber, MyIoTGridPublisher, decoder,
};

/// Events buffered between the subscriber and the orchestrator
const EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Parser, Debug)]
#[command(
    name = "lorawan-bridge",
    version,
    about = "Bridge ChirpStack LoRaWAN events onto the myIoTGrid MQTT broker"
)]
struct Args {
    /// Config file (default: $LORAWAN_BRIDGE_CONFIG or ./lorawan-bridge.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = telemetry::init_tracing(args.log_format) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Bridge stopped with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = BridgeConfig::resolve(args.config.as_deref())?;
    let payload_decoder = decoder::decoder_by_name(&config.decoder)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        chirpstack = %config.chirpstack.mqtt_server,
        myiotgrid = %config.myiotgrid.mqtt_server,
        decoder = payload_decoder.name(),
        "Starting LoRaWAN bridge"
    );

    let (event_tx, event_rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);
    let subscriber = Arc::new(ChirpStackSubscriber::new(
        &config.chirpstack,
        event_tx,
        config.reconnect_delay(),
    )?);
    let publisher = Arc::new(MyIoTGridPublisher::new(&config.myiotgrid)?);
    let upstream: Arc<dyn UpstreamStatus> = subscriber.clone();
    let orchestrator = Arc::new(BridgeOrchestrator::new(
        payload_decoder,
        upstream,
        Arc::clone(&publisher),
        config.status_interval(),
    ));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => cancel.cancel(),
                Err(e) => error!("Failed to listen for shutdown signals: {:#}", e),
            }
        }
    });

    let mut tasks = JoinSet::new();
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            subscriber
                .start(cancel)
                .await
                .context("ChirpStack subscriber failed")
        }
    });
    tasks.spawn({
        let cancel = cancel.clone();
        let reconnect_delay = config.reconnect_delay();
        async move {
            publisher
                .start(reconnect_delay, cancel)
                .await
                .context("myIoTGrid publisher failed")
        }
    });
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            orchestrator.run(event_rx, cancel).await;
            anyhow::Ok(())
        }
    });

    // The first failure stops the other tasks
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("Bridge task panicked")
            .and_then(|result| result);
        if let Err(e) = outcome {
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("LoRaWAN bridge stopped");
            Ok(())
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
