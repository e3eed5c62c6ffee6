//! Delegate task dispatch - routes work to a fleet of remote delegates

pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod routes;
pub mod store;
pub mod websocket;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::DispatchConfig;
use crate::dispatch::Dispatcher;

/// Application state shared across handlers
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: DispatchConfig) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Arc::new(Dispatcher::new(store::Store::new(pool), config)),
        })
    }
}

/// The full HTTP surface: health, delegate WebSocket and REST API
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::handler))
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
