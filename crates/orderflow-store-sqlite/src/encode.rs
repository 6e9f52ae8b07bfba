//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings
//! (`2024-05-01T12:00:00.000000Z`) so that string comparison in SQL agrees
//! with chronological order. UUIDs are hyphenated lowercase strings. JSON
//! payloads are stored compact.

use chrono::{DateTime, SecondsFormat, Utc};
use orderflow_core::{
  outbox::OutboxRecord,
  projection::{AuditRecord, SkuStat},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawOutboxRecord::from_row`].
pub const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, \
   payload_json, created_at, published_at, publish_attempts, last_error, \
   failed_at, claimed_by, lease_expires_at";

/// Raw values read directly from an `outbox_events` row.
pub struct RawOutboxRecord {
  pub id:               String,
  pub aggregate_type:   String,
  pub aggregate_id:     String,
  pub event_type:       String,
  pub payload_json:     String,
  pub created_at:       String,
  pub published_at:     Option<String>,
  pub publish_attempts: i64,
  pub last_error:       Option<String>,
  pub failed_at:        Option<String>,
  pub claimed_by:       Option<String>,
  pub lease_expires_at: Option<String>,
}

impl RawOutboxRecord {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:               row.get(0)?,
      aggregate_type:   row.get(1)?,
      aggregate_id:     row.get(2)?,
      event_type:       row.get(3)?,
      payload_json:     row.get(4)?,
      created_at:       row.get(5)?,
      published_at:     row.get(6)?,
      publish_attempts: row.get(7)?,
      last_error:       row.get(8)?,
      failed_at:        row.get(9)?,
      claimed_by:       row.get(10)?,
      lease_expires_at: row.get(11)?,
    })
  }

  pub fn into_record(self) -> Result<OutboxRecord> {
    Ok(OutboxRecord {
      id:               decode_uuid(&self.id)?,
      aggregate_type:   self.aggregate_type,
      aggregate_id:     self.aggregate_id,
      event_type:       self.event_type,
      payload:          serde_json::from_str(&self.payload_json)?,
      created_at:       decode_dt(&self.created_at)?,
      published_at:     decode_opt_dt(self.published_at)?,
      publish_attempts: u32::try_from(self.publish_attempts).unwrap_or(u32::MAX),
      last_error:       self.last_error,
      failed_at:        decode_opt_dt(self.failed_at)?,
      claimed_by:       self.claimed_by,
      lease_expires_at: decode_opt_dt(self.lease_expires_at)?,
    })
  }
}

/// Raw values read directly from a `sku_stats` row.
pub struct RawSkuStat {
  pub sku:          String,
  pub window_start: String,
  pub window_end:   String,
  pub total_qty:    i64,
  pub created_at:   String,
  pub updated_at:   String,
}

impl RawSkuStat {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sku:          row.get(0)?,
      window_start: row.get(1)?,
      window_end:   row.get(2)?,
      total_qty:    row.get(3)?,
      created_at:   row.get(4)?,
      updated_at:   row.get(5)?,
    })
  }

  pub fn into_stat(self) -> Result<SkuStat> {
    Ok(SkuStat {
      sku:          self.sku,
      window_start: decode_dt(&self.window_start)?,
      window_end:   decode_dt(&self.window_end)?,
      total_qty:    self.total_qty,
      created_at:   decode_dt(&self.created_at)?,
      updated_at:   decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values read directly from an `order_events` row.
pub struct RawAudit {
  pub order_id:    String,
  pub event_type:  String,
  pub occurred_at: String,
  pub data_json:   String,
}

impl RawAudit {
  pub fn into_audit(self) -> Result<AuditRecord> {
    Ok(AuditRecord {
      order_id:    self.order_id,
      event_type:  self.event_type,
      occurred_at: self.occurred_at,
      data:        serde_json::from_str(&self.data_json)?,
    })
  }
}
