//! The materializer: writes aggregate windows and the order audit trail into
//! the projection store.
//!
//! One consumer group reads both the aggregate topic and the primary topic.
//! Stats are upserted, so replays converge; the audit trail is append-only,
//! so replays may add duplicates.

mod extract;

pub use extract::{extract_audit, parse_stats};

use std::time::Duration;

use backon::{BackoffBuilder as _, ExponentialBuilder};
use chrono::Utc;
use orderflow_core::{
  bus::{BusMessage, Consumer},
  projection::ProjectionStore,
};
use tracing::{debug, error, info, warn};

use crate::{Error, Result, shutdown::Shutdown};

/// Ceiling for the backoff between attempts at a message the store rejected.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct MaterializerConfig {
  pub stats_topic:  String,
  pub events_topic: String,
  pub group_id:     String,
  pub poll_timeout: Duration,
}

impl MaterializerConfig {
  pub fn topics(&self) -> [&str; 2] {
    [self.stats_topic.as_str(), self.events_topic.as_str()]
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializerStats {
  pub stats_upserted:  u64,
  pub audits_inserted: u64,
  /// Malformed messages and messages from unexpected topics.
  pub skipped:         u64,
  /// Failed store writes, one per attempt.
  pub failed:          u64,
}

/// What [`Materializer::handle`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
  Stat,
  Audit,
  Skipped,
}

pub struct Materializer<S, C> {
  store:    S,
  consumer: C,
  config:   MaterializerConfig,
  stats:    MaterializerStats,
}

impl<S, C> Materializer<S, C>
where
  S: ProjectionStore,
  C: Consumer,
{
  pub fn new(store: S, consumer: C, config: MaterializerConfig) -> Self {
    Self { store, consumer, config, stats: MaterializerStats::default() }
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn stats(&self) -> MaterializerStats { self.stats }

  /// Consume until `shutdown` fires. Invalid messages are skipped; a message
  /// the store rejects is retried until it is written.
  pub async fn run(&mut self, shutdown: &Shutdown) -> Result<MaterializerStats> {
    info!(
      topics = ?self.config.topics(),
      group = %self.config.group_id,
      "materializer started"
    );

    while !shutdown.is_triggered() {
      let message = match self.consumer.poll(self.config.poll_timeout).await {
        Ok(Some(message)) => message,
        Ok(None) => continue,
        Err(e) => {
          error!(error = %e, "materializer poll failed");
          shutdown.sleep(self.config.poll_timeout).await;
          continue;
        }
      };
      self.materialize(&message, shutdown).await;
    }

    info!(
      stats = self.stats.stats_upserted,
      audits = self.stats.audits_inserted,
      skipped = self.stats.skipped,
      failed = self.stats.failed,
      "materializer stopped"
    );
    Ok(self.stats)
  }

  /// Apply one message, backing off between attempts while the store fails.
  /// Gives up only on shutdown.
  async fn materialize(&mut self, message: &BusMessage, shutdown: &Shutdown) {
    let mut backoff = ExponentialBuilder::default()
      .with_min_delay(self.config.poll_timeout.clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY))
      .with_max_delay(MAX_RETRY_DELAY)
      .with_max_times(usize::MAX)
      .build();
    loop {
      let handled = match self.handle(message).await {
        Ok(handled) => handled,
        Err(e) => {
          self.stats.failed += 1;
          let delay = backoff.next().unwrap_or(MAX_RETRY_DELAY);
          error!(
            topic = %message.topic,
            offset = message.offset,
            error = %e,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "failed to materialize message"
          );
          if !shutdown.sleep(delay).await {
            warn!(
              topic = %message.topic,
              offset = message.offset,
              "shutting down with message not materialized"
            );
            return;
          }
          continue;
        }
      };

      match handled {
        Handled::Stat => self.stats.stats_upserted += 1,
        Handled::Audit => self.stats.audits_inserted += 1,
        Handled::Skipped => self.stats.skipped += 1,
      }
      return;
    }
  }

  /// Route one message by topic and write it. Undecodable messages are
  /// skipped with a warning; only store failures are errors.
  pub async fn handle(&self, message: &BusMessage) -> Result<Handled> {
    if message.topic == self.config.stats_topic {
      let window = match parse_stats(&message.payload) {
        Ok(window) => window,
        Err(e) => return Ok(self.skip(message, &e)),
      };
      let stat = self.store.upsert_stat(&window).await.map_err(Error::store)?;
      debug!(sku = %stat.sku, window_start = %stat.window_start, total_qty = stat.total_qty, "stat upserted");
      return Ok(Handled::Stat);
    }

    if message.topic == self.config.events_topic {
      let audit = match extract_audit(&message.payload, Utc::now()) {
        Ok(audit) => audit,
        Err(e) => return Ok(self.skip(message, &e)),
      };
      self.store.insert_audit(&audit).await.map_err(Error::store)?;
      debug!(order_id = %audit.order_id, event_type = %audit.event_type, "audit recorded");
      return Ok(Handled::Audit);
    }

    warn!(topic = %message.topic, "message from unexpected topic");
    Ok(Handled::Skipped)
  }

  fn skip(&self, message: &BusMessage, error: &orderflow_core::Error) -> Handled {
    warn!(
      topic = %message.topic,
      offset = message.offset,
      error = %error,
      "skipping invalid message"
    );
    Handled::Skipped
  }
}
