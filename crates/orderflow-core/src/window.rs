//! The aggregate record emitted when a tumbling window closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Sum of one SKU's quantities over `[window_start, window_end)`.
///
/// Produced once per key per window per aggregator run, but replays can emit
/// the same window again, so consumers must upsert rather than append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateWindow {
  #[serde(rename = "sku")]
  pub key:          String,
  pub window_start: DateTime<Utc>,
  pub window_end:   DateTime<Utc>,
  #[serde(rename = "total_qty")]
  pub sum:          i64,
}

impl AggregateWindow {
  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(self)?) }
}
