//! Alert Engine HTTP API
//!
//! Exposes ingest, incident actions, config CRUD, and stats over JSON.
//! Bind to 127.0.0.1 by default (internal only).

mod dispatcher;
mod error;
mod handlers;
mod state;
mod types;

use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub use dispatcher::{spawn_delivery_log, ChannelDispatcher};
pub use error::ApiError;
pub use handlers::*;
pub use state::{spawn_ticker, AppState};

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/events", post(ingest))
    .route("/incidents", get(list_incidents))
    .route("/incidents/:id", get(get_incident))
    .route("/incidents/:id/acknowledge", post(acknowledge))
    .route("/incidents/:id/resolve", post(resolve))
    .route("/incidents/:id/cancel", post(cancel))
    .route("/incidents/:id/escalate", post(escalate))
    .route("/incidents/:id/dispatch-failures", post(dispatch_failure))
    .route("/stats", get(stats))
    .route("/config", get(get_config))
    .route("/config/dedup", put(put_dedup))
    .route("/config/throttle", put(put_throttle))
    .route("/config/escalation", put(put_policy))
    .route("/config/:kind/:id", axum::routing::delete(delete_config))
    .route("/config/:kind/:id/enabled", put(set_enabled))
    .layer(CorsLayer::permissive())
    .with_state(state)
}
