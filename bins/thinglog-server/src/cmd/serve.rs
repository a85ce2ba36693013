use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use thinglog_bus::{ingest, MessageBus};
use thinglog_engine::LogRouter;

use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("thinglog-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    let host = config.host.host_paths()?;
    tracing::info!(config = %args.config, home = %host.home.display(), "loaded config");

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Bus ---
    let bus = MessageBus::new(config.bus.clone());
    tracing::info!(buffer = config.bus.buffer, overflow = ?config.bus.overflow, "message bus ready");

    // --- Recorder ---
    let router = LogRouter::new(Arc::new(bus.clone()), host).with_describer(Arc::new(bus.clone()));
    router.start(&config.logger).await?;

    // --- Ingest ---
    let ingest_handle = if config.ingest.enabled {
        match ingest::bind(&config.ingest).await {
            Ok(listener) => Some(ingest::spawn_ingest(
                listener,
                bus.clone(),
                config.ingest.max_line_length,
                token.clone(),
            )),
            Err(e) => {
                router.stop().await;
                return Err(e.into());
            }
        }
    } else {
        tracing::info!("ingest disabled");
        None
    };

    tracing::info!(
        state = %router.state(),
        folder = ?router.logs_folder().await,
        subscriptions = router.subscriptions().await.len(),
        "server ready"
    );

    // --- Wait for Ctrl+C ---
    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down...");

    // Stop recording first so nothing is half-written when ingest goes away.
    router.stop().await;
    token.cancel();

    if let Some(handle) = ingest_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            tracing::warn!("ingest did not stop within 5s");
        }
    }

    signal?;
    tracing::info!("shutdown complete");
    Ok(())
}
