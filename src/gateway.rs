//! Top-level process orchestration: connects to Redis, loads the VAD
//! detectors, binds the WebSocket server, and runs until Ctrl+C.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::bus::{AudioJobStream, RedisAudioJobStream, RedisResultBus, ResultBus};
use crate::config::Config;
use crate::dispatcher::JobDispatcher;
use crate::error::{BusError, GatewayError};
use crate::flow::ClientRegistry;
use crate::router::ResultRouter;
use crate::server::{self, ServerState};
use crate::session::store::RedisSessionStore;
use crate::vad::{CoarseDetector, DualVad, PreciseDetector};

/// Connects every collaborator, builds the axum app, and serves it until
/// the process receives Ctrl+C. Any initialization failure (store
/// unreachable, VAD model unavailable, port already bound) aborts startup
/// rather than serving traffic with a half-built pipeline.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    let config = Arc::new(config);

    info!(redis_url = %config.redis_url, "connecting to session store");
    let store = Arc::new(RedisSessionStore::connect(&config).await?);

    let redis_client = redis::Client::open(config.redis_url.clone())
        .map_err(|e| GatewayError::Bus(BusError::Unavailable(e.to_string())))?;
    let job_conn = ConnectionManager::new(redis_client.clone())
        .await
        .map_err(|e| GatewayError::Bus(BusError::Unavailable(e.to_string())))?;
    let job_stream: Arc<dyn AudioJobStream> = Arc::new(RedisAudioJobStream::new(job_conn, &config));
    let result_bus: Arc<dyn ResultBus> = Arc::new(RedisResultBus::new(redis_client, &config));

    info!("loading dual-VAD detectors");
    let coarse = CoarseDetector::new(config.webrtc_sensitivity);
    let precise = PreciseDetector::new(config.silero_sensitivity)?;
    let vad = Arc::new(DualVad::new(coarse, precise));

    let registry = ClientRegistry::new();
    let dispatcher = Arc::new(JobDispatcher::new(job_stream.clone(), config.clone()));
    let router = Arc::new(ResultRouter::new(store.clone(), registry.clone(), dispatcher.clone()));

    let state = ServerState {
        config: config.clone(),
        store,
        job_stream,
        result_bus,
        registry,
        dispatcher,
        router,
        vad,
    };
    let app = server::build_app(state);

    let addr = format!("{}:{}", config.gateway_host, config.gateway_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Config(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Config(format!("server error: {e}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}
