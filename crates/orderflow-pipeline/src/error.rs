//! Error type for `orderflow-pipeline`.

use orderflow_core::bus::DeliveryError;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("bus error: {0}")]
  Bus(#[source] BoxError),

  #[error(transparent)]
  Delivery(#[from] DeliveryError),

  #[error(transparent)]
  Core(#[from] orderflow_core::Error),
}

impl Error {
  pub(crate) fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(err))
  }

  pub(crate) fn bus(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Bus(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
