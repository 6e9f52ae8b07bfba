//! JSON query API over the orderflow projections.
//!
//! Exposes an axum [`Router`] backed by any
//! [`orderflow_core::projection::ProjectionStore`]. Auth and TLS are the
//! caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .merge(orderflow_api::api_router(store.clone()))
//! ```

pub mod audit;
pub mod error;
pub mod stats;

use std::sync::Arc;

use axum::{Json, Router, routing::get};
use chrono::Utc;
use orderflow_core::projection::ProjectionStore;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Build the query router for `store`.
pub fn api_router<S>(store: Arc<S>) -> Router<()>
where
  S: ProjectionStore + 'static,
{
  Router::new()
    .route("/health", get(health))
    .route("/stats/sku", get(stats::list::<S>))
    .route("/orders/{order_id}/events", get(audit::list_for_order::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(store)
}

/// `GET /health`
async fn health() -> Json<Value> {
  Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}
