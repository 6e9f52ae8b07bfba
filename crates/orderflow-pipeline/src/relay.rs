//! The outbox relay: moves committed outbox rows onto the primary topic.
//!
//! Each pass reaps expired leases, claims a batch, and publishes the rows one
//! at a time in claim order. A row is only marked published after the broker
//! acknowledged it. Failed rows are retried on later passes until
//! `max_retries` attempts have failed, then routed to the dead-letter topic.

use std::time::Duration;

use orderflow_core::{
  bus::{DeliveryError, Producer},
  event::DeadLetterEnvelope,
  outbox::{Lease, OutboxRecord, OutboxStore},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Error, Result, shutdown::Shutdown};

#[derive(Debug, Clone)]
pub struct RelayConfig {
  pub worker_id:       String,
  pub topic:           String,
  pub dlq_topic:       String,
  pub batch_size:      usize,
  /// Sleep after a pass that neither published nor dead-lettered a row.
  pub poll_interval:   Duration,
  pub publish_timeout: Duration,
  pub max_retries:     u32,
  pub lease_ttl:       Duration,
}

/// Counters for one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
  pub reclaimed:     usize,
  pub claimed:       usize,
  pub published:     usize,
  pub retried:       usize,
  pub dead_lettered: usize,
  /// Rows handed back without an outcome: shutdown mid-batch, a failed
  /// dead-letter publish, or an aborted pass.
  pub released:      usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Published,
  Retried,
  DeadLettered,
  Released,
}

impl BatchReport {
  fn count(&mut self, outcome: Outcome) {
    match outcome {
      Outcome::Published => self.published += 1,
      Outcome::Retried => self.retried += 1,
      Outcome::DeadLettered => self.dead_lettered += 1,
      Outcome::Released => self.released += 1,
    }
  }

  /// Whether any row reached a terminal state in this pass.
  pub fn made_progress(&self) -> bool { self.published + self.dead_lettered > 0 }
}

pub struct Relay<S, P> {
  store:    S,
  producer: P,
  config:   RelayConfig,
  lease:    Lease,
}

impl<S, P> Relay<S, P>
where
  S: OutboxStore,
  P: Producer,
{
  pub fn new(store: S, producer: P, config: RelayConfig) -> Self {
    let lease = Lease::new(config.worker_id.clone(), config.lease_ttl);
    Self { store, producer, config, lease }
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn producer(&self) -> &P { &self.producer }

  /// Run passes until `shutdown` fires, then flush the producer.
  ///
  /// A pass that published or dead-lettered a row is followed immediately by
  /// the next one. Any other pass (empty, all retried or released, or
  /// failed) sleeps for `poll_interval` first, so a failing row is retried
  /// at most once per interval.
  pub async fn run(&self, shutdown: &Shutdown) -> Result<()> {
    info!(
      worker = %self.lease.worker_id,
      topic = %self.config.topic,
      batch_size = self.config.batch_size,
      "relay started"
    );

    while !shutdown.is_triggered() {
      match self.run_once(shutdown).await {
        Ok(report) => {
          if report.claimed > 0 {
            info!(
              claimed = report.claimed,
              published = report.published,
              retried = report.retried,
              dead_lettered = report.dead_lettered,
              released = report.released,
              "relay pass complete"
            );
          } else {
            debug!("outbox empty");
          }
          if report.made_progress() {
            continue;
          }
        }
        Err(e) => error!(error = %e, "relay pass failed"),
      }
      if !shutdown.sleep(self.config.poll_interval).await {
        break;
      }
    }

    if let Err(e) = self.producer.flush(self.config.publish_timeout).await {
      warn!(error = %e, "producer flush on shutdown failed");
    }
    info!(worker = %self.lease.worker_id, "relay stopped");
    Ok(())
  }

  /// One claim-and-publish pass.
  ///
  /// Store errors abort the pass; rows still held are released on a best
  /// effort basis before the error is returned.
  pub async fn run_once(&self, shutdown: &Shutdown) -> Result<BatchReport> {
    let mut report = BatchReport::default();

    report.reclaimed =
      self.store.reclaim_expired_leases().await.map_err(Error::store)?;
    if report.reclaimed > 0 {
      warn!(rows = report.reclaimed, "reclaimed rows from expired leases");
    }

    let batch = self
      .store
      .claim_batch(self.config.batch_size, &self.lease)
      .await
      .map_err(Error::store)?;
    report.claimed = batch.len();

    for (index, record) in batch.iter().enumerate() {
      if shutdown.is_triggered() {
        report.released += self.release_rest(&batch[index..]).await;
        info!(released = report.released, "shutdown mid-batch, released claims");
        break;
      }

      match self.process(record).await {
        Ok(outcome) => report.count(outcome),
        Err(e) => {
          self.release_rest(&batch[index..]).await;
          return Err(e);
        }
      }
    }

    Ok(report)
  }

  async fn release_rest(&self, records: &[OutboxRecord]) -> usize {
    let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
    match self.store.release(&ids, &self.lease).await {
      Ok(released) => released,
      Err(e) => {
        warn!(error = %e, rows = ids.len(), "failed to release claims; leases will expire");
        0
      }
    }
  }

  async fn process(&self, record: &OutboxRecord) -> Result<Outcome> {
    // Exhausted on an earlier pass but the dead-letter publish failed.
    if record.publish_attempts >= self.config.max_retries {
      let error = record
        .last_error
        .clone()
        .unwrap_or_else(|| "max retries exceeded".to_owned());
      return self.dead_letter(record, &error).await;
    }

    match self.publish(record).await {
      Ok(()) => {
        if let Err(e) = self.store.mark_published(record.id, &self.lease).await {
          warn!(
            id = %record.id,
            error = %e,
            "published but not marked; will be re-published after lease expiry"
          );
        }
        debug!(id = %record.id, event_type = %record.event_type, "published");
        Ok(Outcome::Published)
      }
      Err(delivery) => {
        let error = delivery.to_string();
        let recorded = self
          .store
          .record_failure(record.id, &self.lease, &error, self.config.max_retries)
          .await
          .map_err(Error::store)?;

        if !recorded.exhausted {
          warn!(
            id = %record.id,
            attempts = recorded.attempts,
            max_retries = self.config.max_retries,
            error = %error,
            "publish failed, will retry"
          );
          return Ok(Outcome::Retried);
        }
        self.dead_letter(record, &error).await
      }
    }
  }

  /// Send `record` to the primary topic and wait for the acknowledgement.
  pub async fn publish(&self, record: &OutboxRecord) -> Result<(), DeliveryError> {
    let payload = record
      .envelope()
      .to_bytes()
      .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
    self
      .send_bounded(&self.config.topic, &record.aggregate_id, &payload)
      .await
  }

  /// Producers are trusted to honour the timeout; this is the backstop.
  async fn send_bounded(
    &self,
    topic: &str,
    key: &str,
    payload: &[u8],
  ) -> Result<(), DeliveryError> {
    let timeout = self.config.publish_timeout;
    tokio::time::timeout(timeout, self.producer.send(topic, key, payload, timeout))
      .await
      .unwrap_or(Err(DeliveryError::Timeout(timeout)))
  }

  async fn dead_letter(&self, record: &OutboxRecord, error: &str) -> Result<Outcome> {
    let dead = DeadLetterEnvelope { envelope: record.envelope(), error: error.to_owned() };
    let payload = dead.to_bytes()?;

    if let Err(e) = self
      .send_bounded(&self.config.dlq_topic, &record.aggregate_id, &payload)
      .await
    {
      error!(
        id = %record.id,
        error = %e,
        "dead-letter publish failed; row stays pending"
      );
      self
        .store
        .release(&[record.id], &self.lease)
        .await
        .map_err(Error::store)?;
      return Ok(Outcome::Released);
    }

    if let Err(e) = self.store.mark_failed(record.id, &self.lease).await {
      warn!(id = %record.id, error = %e, "dead-lettered but not marked failed");
    }
    error!(
      id = %record.id,
      aggregate_id = %record.aggregate_id,
      event_type = %record.event_type,
      error = %error,
      "outbox record dead-lettered"
    );
    Ok(Outcome::DeadLettered)
  }
}
