//! Error type for `orderflow-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] orderflow_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("order not found: {0}")]
  OrderNotFound(String),

  #[error("order {order_id} cannot move from {from} to {to}")]
  InvalidTransition {
    order_id: String,
    from:     String,
    to:       &'static str,
  },

  #[error("unknown order status {0:?}")]
  InvalidStatus(String),

  /// The row is no longer pending, or is leased by another worker.
  #[error("lease lost on outbox record {0}")]
  LeaseLost(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
