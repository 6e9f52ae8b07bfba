//! Read-model records and the [`ProjectionStore`] trait.
//!
//! Two projections are maintained: per-SKU window totals (unique per
//! `(sku, window_start)`, upserted) and an append-only audit trail of every
//! order event observed on the primary topic.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::window::AggregateWindow;

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuStat {
  pub sku:          String,
  pub window_start: DateTime<Utc>,
  pub window_end:   DateTime<Utc>,
  pub total_qty:    i64,
  /// Set on first insert, never touched again.
  pub created_at:   DateTime<Utc>,
  /// Refreshed by every upsert, including replays.
  pub updated_at:   DateTime<Utc>,
}

/// One observed order event. Not unique: replays append again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
  pub order_id:    String,
  pub event_type:  String,
  /// Timestamp as carried by the event, or synthesised from the processing
  /// clock when the event had none. Stores normalise parseable values to
  /// UTC RFC 3339 with microseconds; anything else is kept verbatim.
  pub occurred_at: String,
  pub data:        Value,
}

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`ProjectionStore::list_stats`]. Bounds apply to
/// `window_start` and are inclusive.
#[derive(Debug, Clone)]
pub struct StatsQuery {
  pub sku:   Option<String>,
  pub from:  Option<DateTime<Utc>>,
  pub to:    Option<DateTime<Utc>>,
  pub limit: usize,
}

impl Default for StatsQuery {
  fn default() -> Self { Self { sku: None, from: None, to: None, limit: 50 } }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the queryable projection store written by the
/// materializer.
pub trait ProjectionStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Insert or overwrite the stats row for `(window.key, window.start)`.
  /// Applying the same window any number of times converges to the same
  /// stored totals.
  fn upsert_stat<'a>(
    &'a self,
    window: &'a AggregateWindow,
  ) -> impl Future<Output = Result<SkuStat, Self::Error>> + Send + 'a;

  fn insert_audit<'a>(
    &'a self,
    record: &'a AuditRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Stats rows matching `query`, newest window first.
  fn list_stats<'a>(
    &'a self,
    query: &'a StatsQuery,
  ) -> impl Future<Output = Result<Vec<SkuStat>, Self::Error>> + Send + 'a;

  /// Audit trail for one order, oldest first.
  fn audit_for_order<'a>(
    &'a self,
    order_id: &'a str,
  ) -> impl Future<Output = Result<Vec<AuditRecord>, Self::Error>> + Send + 'a;
}
