//! Signaling relay for the synth mesh: control-socket registration, handshake routing with
//! an offline queue, and the single-controller lock.

pub mod config;
pub mod handlers;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod storage;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers::{
    acquire_controller, controller_status, health_check, metrics_handler, release_controller,
    AppState,
};
use crate::relay::{Relay, SharedRelay};
use crate::storage::SharedStore;
use crate::websocket::websocket_handler;

/// Build the relay service over an already-connected store.
pub fn build_relay(store: SharedStore, config: &Config) -> SharedRelay {
    Arc::new(Relay::new(store, config))
}

pub fn router(relay: SharedRelay, config: &Config, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState {
        relay,
        idle_timeout: config.idle_timeout(),
        metrics,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/controller/active",
            get(controller_status)
                .post(acquire_controller)
                .delete(release_controller),
        )
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
