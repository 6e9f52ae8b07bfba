//! Outbox records and the [`OutboxStore`] trait.
//!
//! An outbox row is written in the same transaction as the business mutation
//! that produced it. From then on only the relay touches it: it is claimed,
//! published (or retried, or dead-lettered) and never deleted by the core.

use std::{future::Future, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
  Result,
  event::{EventEnvelope, ORDER_AGGREGATE, OrderEvent},
};

// ─── Records ─────────────────────────────────────────────────────────────────

/// Input for writing a new outbox row. `id` and `created_at` are assigned by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
  pub aggregate_type: String,
  pub aggregate_id:   String,
  pub event_type:     String,
  pub payload:        Value,
}

impl NewOutboxRecord {
  pub fn new(
    aggregate_type: impl Into<String>,
    aggregate_id: impl Into<String>,
    event_type: impl Into<String>,
    payload: Value,
  ) -> Self {
    Self {
      aggregate_type: aggregate_type.into(),
      aggregate_id: aggregate_id.into(),
      event_type: event_type.into(),
      payload,
    }
  }

  /// Build the outbox row describing an order event.
  pub fn for_order(order_id: impl Into<String>, event: &OrderEvent) -> Result<Self> {
    Ok(Self::new(
      ORDER_AGGREGATE,
      order_id,
      event.event_type(),
      event.to_payload()?,
    ))
  }
}

/// Lifecycle state of an outbox row, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
  Pending,
  Published,
  Failed,
}

/// One persisted domain event awaiting (or past) delivery.
///
/// `published_at` and `failed_at` are mutually exclusive and each is set at
/// most once. A row is pending iff both are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
  pub id:               Uuid,
  pub aggregate_type:   String,
  pub aggregate_id:     String,
  pub event_type:       String,
  pub payload:          Value,
  pub created_at:       DateTime<Utc>,
  pub published_at:     Option<DateTime<Utc>>,
  pub publish_attempts: u32,
  pub last_error:       Option<String>,
  pub failed_at:        Option<DateTime<Utc>>,
  /// Worker currently holding the lease, if any.
  pub claimed_by:       Option<String>,
  pub lease_expires_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
  pub fn status(&self) -> OutboxStatus {
    match (self.published_at, self.failed_at) {
      (Some(_), _) => OutboxStatus::Published,
      (None, Some(_)) => OutboxStatus::Failed,
      (None, None) => OutboxStatus::Pending,
    }
  }

  pub fn is_pending(&self) -> bool { self.status() == OutboxStatus::Pending }

  /// The primary-topic envelope for this record.
  pub fn envelope(&self) -> EventEnvelope {
    EventEnvelope {
      event_type:   self.event_type.clone(),
      aggregate_id: self.aggregate_id.clone(),
      payload:      self.payload.clone(),
      created_at:   self.created_at,
    }
  }
}

// ─── Leasing ─────────────────────────────────────────────────────────────────

/// An exclusive, time-bounded claim on outbox rows held by one worker.
///
/// Rows claimed under a lease are skipped by every other claimer until the
/// holder records an outcome, releases them, or the lease expires. Expiry is
/// what frees the rows of a worker that crashed mid-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
  pub worker_id: String,
  pub ttl:       Duration,
}

impl Lease {
  pub fn new(worker_id: impl Into<String>, ttl: Duration) -> Self {
    Self { worker_id: worker_id.into(), ttl }
  }

  /// When a lease taken at `now` runs out.
  pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    TimeDelta::from_std(self.ttl)
      .ok()
      .and_then(|ttl| now.checked_add_signed(ttl))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }
}

/// Result of [`OutboxStore::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecorded {
  /// `publish_attempts` after the increment.
  pub attempts:  u32,
  /// The attempt bound is reached. The lease is kept so the caller can
  /// dead-letter the row without another worker picking it up.
  pub exhausted: bool,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over an outbox table.
///
/// Outcome-recording methods only touch rows that are still pending and still
/// leased by the caller; anything else is reported as an error by the
/// backend rather than silently overwritten.
pub trait OutboxStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Write a standalone outbox row in its own transaction.
  fn enqueue(
    &self,
    record: NewOutboxRecord,
  ) -> impl Future<Output = Result<OutboxRecord, Self::Error>> + Send + '_;

  /// Retrieve a row by id. Returns `None` if not found.
  fn get_record(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<OutboxRecord>, Self::Error>> + Send + '_;

  /// Lease up to `limit` pending rows in `(created_at, id)` order, skipping
  /// rows leased by someone else. Returns an empty vec when nothing is
  /// available.
  fn claim_batch<'a>(
    &'a self,
    limit: usize,
    lease: &'a Lease,
  ) -> impl Future<Output = Result<Vec<OutboxRecord>, Self::Error>> + Send + 'a;

  /// Set `published_at` and drop the lease. Only call after the broker
  /// acknowledged the message.
  fn mark_published<'a>(
    &'a self,
    id: Uuid,
    lease: &'a Lease,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Increment `publish_attempts` and store `error` as `last_error`.
  ///
  /// When the incremented count stays below `max_attempts` the lease is
  /// released so a later pass can retry.
  fn record_failure<'a>(
    &'a self,
    id: Uuid,
    lease: &'a Lease,
    error: &'a str,
    max_attempts: u32,
  ) -> impl Future<Output = Result<FailureRecorded, Self::Error>> + Send + 'a;

  /// Set `failed_at` and drop the lease. Terminal.
  fn mark_failed<'a>(
    &'a self,
    id: Uuid,
    lease: &'a Lease,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Give back leased rows without recording an outcome. Returns how many
  /// rows were actually released.
  fn release<'a>(
    &'a self,
    ids: &'a [Uuid],
    lease: &'a Lease,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  /// Clear every lease that has run out. Returns the number of rows freed.
  fn reclaim_expired_leases(
    &self,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn pending_count(
    &self,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}
