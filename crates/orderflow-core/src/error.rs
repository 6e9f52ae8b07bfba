//! Error types for `orderflow-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A consumed message could not be interpreted at all.
  #[error("malformed message: {0}")]
  Malformed(String),

  #[error("missing required field: {0}")]
  MissingField(&'static str),

  #[error("invalid value for {field}: {reason}")]
  InvalidField {
    field:  &'static str,
    reason: String,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
