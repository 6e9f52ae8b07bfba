//! Error type for `orderflow-bus`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
  #[error("connection failed: {0}")]
  Connection(String),

  #[error("subscribe failed: {0}")]
  Subscribe(String),

  #[error("consume failed: {0}")]
  Consume(String),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
