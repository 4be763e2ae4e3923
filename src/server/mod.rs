//! HTTP/WebSocket server: shared state and route assembly.

pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::bus::{AudioJobStream, ResultBus};
use crate::config::Config;
use crate::dispatcher::JobDispatcher;
use crate::flow::ClientRegistry;
use crate::router::ResultRouter;
use crate::session::SessionStore;
use crate::vad::DualVad;

/// Everything a connection handler needs, shared across every client on
/// this gateway instance. Cheap to clone: every field is already an `Arc`
/// or a handle type that is itself cheaply cloneable.
pub struct ServerState<S: SessionStore> {
    pub config: Arc<Config>,
    pub store: Arc<S>,
    pub job_stream: Arc<dyn AudioJobStream>,
    pub result_bus: Arc<dyn ResultBus>,
    pub registry: ClientRegistry,
    pub dispatcher: Arc<JobDispatcher>,
    pub router: Arc<ResultRouter<S>>,
    pub vad: Arc<DualVad>,
}

impl<S: SessionStore> Clone for ServerState<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            job_stream: self.job_stream.clone(),
            result_bus: self.result_bus.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            router: self.router.clone(),
            vad: self.vad.clone(),
        }
    }
}

/// Build the axum application: a single WebSocket endpoint clients stream
/// audio through, plus request tracing.
pub fn build_app<S: SessionStore + 'static>(state: ServerState<S>) -> Router {
    Router::new()
        .route("/ws", get(ws::websocket_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
