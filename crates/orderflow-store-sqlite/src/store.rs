//! [`SqliteStore`]: the SQLite implementation of [`OutboxStore`] and
//! [`ProjectionStore`].

use std::{path::Path, time::Duration};

use chrono::{SecondsFormat, SubsecRound as _, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use orderflow_core::{
  event::parse_event_time,
  outbox::{FailureRecorded, Lease, NewOutboxRecord, OutboxRecord, OutboxStore},
  projection::{AuditRecord, ProjectionStore, SkuStat, StatsQuery},
  window::AggregateWindow,
};

use crate::{
  encode::{
    OUTBOX_COLUMNS, RawAudit, RawOutboxRecord, RawSkuStat, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
  Error, Result,
};

/// How long a writer waits on another connection's write lock before giving
/// up with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PENDING: &str = "published_at IS NULL AND failed_at IS NULL";

// ─── Capture ─────────────────────────────────────────────────────────────────

/// Insert an outbox row inside the caller's transaction.
///
/// This is the capture primitive: call it from the same transaction as the
/// business mutation so that the event exists if and only if the mutation
/// commits.
pub fn append_event_in(
  tx: &rusqlite::Transaction<'_>,
  record: NewOutboxRecord,
) -> rusqlite::Result<OutboxRecord> {
  let record = OutboxRecord {
    id:               Uuid::new_v4(),
    aggregate_type:   record.aggregate_type,
    aggregate_id:     record.aggregate_id,
    event_type:       record.event_type,
    payload:          record.payload,
    // Stored at microsecond precision; match it so reads round-trip.
    created_at:       Utc::now().trunc_subsecs(6),
    published_at:     None,
    publish_attempts: 0,
    last_error:       None,
    failed_at:        None,
    claimed_by:       None,
    lease_expires_at: None,
  };

  let payload_json = serde_json::to_string(&record.payload)
    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

  tx.execute(
    "INSERT INTO outbox_events (
       id, aggregate_type, aggregate_id, event_type, payload_json, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    rusqlite::params![
      encode_uuid(record.id),
      record.aggregate_type,
      record.aggregate_id,
      record.event_type,
      payload_json,
      encode_dt(record.created_at),
    ],
  )?;

  Ok(record)
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An outbox and projection store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Separate
/// [`SqliteStore::open`] calls on the same path get separate connections,
/// which is how several relay instances share one outbox.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  pub(crate) fn conn(&self) -> &tokio_rusqlite::Connection { &self.conn }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a business mutation and record its outbox event atomically.
  ///
  /// `mutation` runs inside a transaction and returns its own result plus the
  /// event describing it. The event row is inserted in the same transaction;
  /// if either step fails nothing is committed.
  pub async fn commit_with_event<T, F>(&self, mutation: F) -> Result<(T, OutboxRecord)>
  where
    F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<(T, NewOutboxRecord)>
      + Send
      + 'static,
    T: Send + 'static,
  {
    let (value, record) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let (value, new_record) = mutation(&tx)?;
        let record = append_event_in(&tx, new_record)?;
        tx.commit()?;
        Ok((value, record))
      })
      .await?;
    Ok((value, record))
  }

  /// Every outbox row, oldest first.
  pub async fn list_outbox(&self) -> Result<Vec<OutboxRecord>> {
    let raws: Vec<RawOutboxRecord> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {OUTBOX_COLUMNS} FROM outbox_events ORDER BY created_at, id"
        ))?;
        let rows = stmt
          .query_map([], RawOutboxRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawOutboxRecord::into_record).collect()
  }

  /// Set a terminal timestamp column on a row this worker has leased.
  async fn finish(&self, id: Uuid, lease: &Lease, column: &'static str) -> Result<()> {
    let id_str = encode_uuid(id);
    let worker = lease.worker_id.clone();
    let at_str = encode_dt(Utc::now());

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE outbox_events
             SET {column} = ?1, claimed_by = NULL, lease_expires_at = NULL
             WHERE id = ?2 AND claimed_by = ?3 AND {PENDING}"
          ),
          rusqlite::params![at_str, id_str, worker],
        )?)
      })
      .await?;

    if changed == 0 {
      return Err(Error::LeaseLost(id));
    }
    Ok(())
  }
}

// ─── OutboxStore impl ────────────────────────────────────────────────────────

impl OutboxStore for SqliteStore {
  type Error = Error;

  async fn enqueue(&self, record: NewOutboxRecord) -> Result<OutboxRecord> {
    let record = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let record = append_event_in(&tx, record)?;
        tx.commit()?;
        Ok(record)
      })
      .await?;
    Ok(record)
  }

  async fn get_record(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawOutboxRecord> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = ?1"),
            rusqlite::params![id_str],
            RawOutboxRecord::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawOutboxRecord::into_record).transpose()
  }

  async fn claim_batch(&self, limit: usize, lease: &Lease) -> Result<Vec<OutboxRecord>> {
    if limit == 0 {
      return Ok(Vec::new());
    }

    let now = Utc::now();
    let now_str = encode_dt(now);
    let until_str = encode_dt(lease.expires_at(now));
    let worker = lease.worker_id.clone();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    // BEGIN IMMEDIATE takes the write lock up front, so concurrent claimers
    // on other connections serialise here and each sees the previous
    // claimer's leases.
    let raws: Vec<RawOutboxRecord> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut raws = {
          let mut stmt = tx.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events
             WHERE {PENDING}
               AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
             ORDER BY created_at, id
             LIMIT ?2"
          ))?;
          stmt
            .query_map(rusqlite::params![now_str, limit], RawOutboxRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        {
          let mut stmt = tx.prepare(
            "UPDATE outbox_events SET claimed_by = ?1, lease_expires_at = ?2 WHERE id = ?3",
          )?;
          for raw in &mut raws {
            stmt.execute(rusqlite::params![worker, until_str, raw.id])?;
            raw.claimed_by = Some(worker.clone());
            raw.lease_expires_at = Some(until_str.clone());
          }
        }

        tx.commit()?;
        Ok(raws)
      })
      .await?;

    debug!(worker = %lease.worker_id, claimed = raws.len(), "claimed outbox batch");
    raws.into_iter().map(RawOutboxRecord::into_record).collect()
  }

  async fn mark_published(&self, id: Uuid, lease: &Lease) -> Result<()> {
    self.finish(id, lease, "published_at").await
  }

  async fn record_failure(
    &self,
    id: Uuid,
    lease: &Lease,
    error: &str,
    max_attempts: u32,
  ) -> Result<FailureRecorded> {
    let id_str = encode_uuid(id);
    let worker = lease.worker_id.clone();
    let error = error.to_owned();

    let recorded: Option<i64> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          &format!(
            "UPDATE outbox_events
             SET publish_attempts = publish_attempts + 1, last_error = ?1
             WHERE id = ?2 AND claimed_by = ?3 AND {PENDING}"
          ),
          rusqlite::params![error, id_str, worker],
        )?;
        if changed == 0 {
          return Ok(None);
        }

        let attempts: i64 = tx.query_row(
          "SELECT publish_attempts FROM outbox_events WHERE id = ?1",
          rusqlite::params![id_str],
          |row| row.get(0),
        )?;

        // Below the bound the row goes back to the pool; at the bound the
        // caller keeps it to dead-letter.
        if attempts < i64::from(max_attempts) {
          tx.execute(
            "UPDATE outbox_events SET claimed_by = NULL, lease_expires_at = NULL WHERE id = ?1",
            rusqlite::params![id_str],
          )?;
        }

        tx.commit()?;
        Ok(Some(attempts))
      })
      .await?;

    let attempts = recorded.ok_or(Error::LeaseLost(id))?;
    let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
    Ok(FailureRecorded { attempts, exhausted: attempts >= max_attempts })
  }

  async fn mark_failed(&self, id: Uuid, lease: &Lease) -> Result<()> {
    self.finish(id, lease, "failed_at").await
  }

  async fn release(&self, ids: &[Uuid], lease: &Lease) -> Result<usize> {
    if ids.is_empty() {
      return Ok(0);
    }

    let id_strs: Vec<String> = ids.iter().copied().map(encode_uuid).collect();
    let worker = lease.worker_id.clone();

    let released = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut released = 0;
        {
          let mut stmt = tx.prepare(&format!(
            "UPDATE outbox_events SET claimed_by = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND claimed_by = ?2 AND {PENDING}"
          ))?;
          for id in &id_strs {
            released += stmt.execute(rusqlite::params![id, worker])?;
          }
        }
        tx.commit()?;
        Ok(released)
      })
      .await?;

    Ok(released)
  }

  async fn reclaim_expired_leases(&self) -> Result<usize> {
    let now_str = encode_dt(Utc::now());

    let reclaimed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE outbox_events SET claimed_by = NULL, lease_expires_at = NULL
             WHERE claimed_by IS NOT NULL AND lease_expires_at <= ?1 AND {PENDING}"
          ),
          rusqlite::params![now_str],
        )?)
      })
      .await?;

    Ok(reclaimed)
  }

  async fn pending_count(&self) -> Result<u64> {
    let count: i64 = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          &format!("SELECT COUNT(*) FROM outbox_events WHERE {PENDING}"),
          [],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(u64::try_from(count).unwrap_or(0))
  }
}

// ─── ProjectionStore impl ────────────────────────────────────────────────────

/// Fixed-width UTC form of a parseable event time; anything else verbatim.
fn normalise_event_time(raw: &str) -> String {
  parse_event_time(raw)
    .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
    .unwrap_or_else(|| raw.to_owned())
}

impl ProjectionStore for SqliteStore {
  type Error = Error;

  async fn upsert_stat(&self, window: &AggregateWindow) -> Result<SkuStat> {
    let sku       = window.key.clone();
    let start_str = encode_dt(window.window_start);
    let end_str   = encode_dt(window.window_end);
    let total     = window.sum;
    let now_str   = encode_dt(Utc::now());

    let raw: RawSkuStat = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sku_stats (
             sku, window_start, window_end, total_qty, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
           ON CONFLICT (sku, window_start) DO UPDATE SET
             window_end = excluded.window_end,
             total_qty  = excluded.total_qty,
             updated_at = excluded.updated_at",
          rusqlite::params![sku, start_str, end_str, total, now_str],
        )?;

        Ok(conn.query_row(
          "SELECT sku, window_start, window_end, total_qty, created_at, updated_at
           FROM sku_stats WHERE sku = ?1 AND window_start = ?2",
          rusqlite::params![sku, start_str],
          RawSkuStat::from_row,
        )?)
      })
      .await?;

    raw.into_stat()
  }

  /// `occurred_at` is normalised first so the audit trail sorts by time
  /// whatever format the producer used.
  async fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
    let order_id    = record.order_id.clone();
    let event_type  = record.event_type.clone();
    let occurred_at = normalise_event_time(&record.occurred_at);
    let data_json   = serde_json::to_string(&record.data)?;
    let now_str     = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO order_events (order_id, event_type, occurred_at, data_json, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![order_id, event_type, occurred_at, data_json, now_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_stats(&self, query: &StatsQuery) -> Result<Vec<SkuStat>> {
    let sku      = query.sku.clone();
    let from_str = query.from.map(encode_dt);
    let to_str   = query.to.map(encode_dt);
    let limit    = i64::try_from(query.limit).unwrap_or(i64::MAX);

    let raws: Vec<RawSkuStat> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT sku, window_start, window_end, total_qty, created_at, updated_at
           FROM sku_stats
           WHERE (?1 IS NULL OR sku = ?1)
             AND (?2 IS NULL OR window_start >= ?2)
             AND (?3 IS NULL OR window_start <= ?3)
           ORDER BY window_start DESC, sku ASC
           LIMIT ?4",
        )?;
        let rows = stmt
          .query_map(
            rusqlite::params![sku, from_str, to_str, limit],
            RawSkuStat::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSkuStat::into_stat).collect()
  }

  async fn audit_for_order(&self, order_id: &str) -> Result<Vec<AuditRecord>> {
    let order_id = order_id.to_owned();

    let raws: Vec<RawAudit> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT order_id, event_type, occurred_at, data_json
           FROM order_events
           WHERE order_id = ?1
           ORDER BY occurred_at, audit_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![order_id], |row| {
            Ok(RawAudit {
              order_id:    row.get(0)?,
              event_type:  row.get(1)?,
              occurred_at: row.get(2)?,
              data_json:   row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawAudit::into_audit).collect()
  }
}
