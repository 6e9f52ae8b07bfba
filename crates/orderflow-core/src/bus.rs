//! The narrow publish/subscribe contract the pipeline needs from an event
//! bus.
//!
//! The bus is an ordered, partitioned, at-least-once log. Producers key every
//! message so per-key order survives partitioning; consumers belong to a
//! group and advance their offset as messages are handed out.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A message as returned to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
  pub topic:     String,
  pub key:       Option<String>,
  pub payload:   Vec<u8>,
  /// Broker ingestion time, when the bus reports one.
  pub timestamp: Option<DateTime<Utc>>,
  pub offset:    i64,
}

/// Why a publish did not get a broker acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
  #[error("delivery timed out after {0:?}")]
  Timeout(Duration),

  #[error("delivery rejected: {0}")]
  Rejected(String),
}

pub trait Producer: Send + Sync {
  /// Send one keyed message and wait up to `timeout` for the broker
  /// acknowledgement. `Ok` means the message is durably on the topic.
  fn send<'a>(
    &'a self,
    topic: &'a str,
    key: &'a str,
    payload: &'a [u8],
    timeout: Duration,
  ) -> impl Future<Output = Result<(), DeliveryError>> + Send + 'a;

  /// Wait for every outstanding send to be acknowledged.
  fn flush(
    &self,
    timeout: Duration,
  ) -> impl Future<Output = Result<(), DeliveryError>> + Send + '_;
}

/// A consumer-group member with commit-on-read semantics: once `poll`
/// returns a message its offset counts as consumed.
pub trait Consumer: Send {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
  fn poll(
    &mut self,
    timeout: Duration,
  ) -> impl Future<Output = Result<Option<BusMessage>, Self::Error>> + Send + '_;
}
