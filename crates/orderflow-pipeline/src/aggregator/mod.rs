//! The stream aggregator: per-SKU quantity totals over tumbling event-time
//! windows.
//!
//! Reads the primary topic, counts the line items of every `OrderCreated`,
//! and emits one [`AggregateWindow`] per SKU when a window closes. Output is
//! keyed by SKU.

mod extract;
mod window;

pub use extract::{Extracted, LineFact, event_time, extract_line_facts};
pub use window::{Admission, TumblingWindows};

use std::time::Duration;

use chrono::Utc;
use orderflow_core::{
  bus::{BusMessage, Consumer, Producer},
  window::AggregateWindow,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::{Result, shutdown::Shutdown};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
  pub input_topic:      String,
  pub output_topic:     String,
  pub group_id:         String,
  pub window_size:      Duration,
  pub allowed_lateness: Duration,
  /// Quiet period after which processing time starts driving the
  /// watermark.
  pub idle_timeout:     Duration,
  pub poll_timeout:     Duration,
  pub publish_timeout:  Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
  pub messages:        u64,
  pub ignored:         u64,
  pub malformed:       u64,
  pub accepted:        u64,
  pub late:            u64,
  pub windows_emitted: u64,
  pub emit_failures:   u64,
}

pub struct Aggregator<C, P> {
  consumer: C,
  producer: P,
  config:   AggregatorConfig,
  windows:  TumblingWindows,
  stats:    AggregatorStats,
}

impl<C, P> Aggregator<C, P>
where
  C: Consumer,
  P: Producer,
{
  pub fn new(consumer: C, producer: P, config: AggregatorConfig) -> Result<Self> {
    let windows = TumblingWindows::new(config.window_size, config.allowed_lateness)?;
    Ok(Self { consumer, producer, config, windows, stats: AggregatorStats::default() })
  }

  pub fn stats(&self) -> AggregatorStats { self.stats }

  pub fn windows(&self) -> &TumblingWindows { &self.windows }

  /// Consume until `shutdown` fires, then flush every open window.
  pub async fn run(&mut self, shutdown: &Shutdown) -> Result<AggregatorStats> {
    info!(
      topic = %self.config.input_topic,
      group = %self.config.group_id,
      window_secs = self.config.window_size.as_secs_f64(),
      "aggregator started"
    );

    let mut last_progress = Instant::now();
    while !shutdown.is_triggered() {
      match self.consumer.poll(self.config.poll_timeout).await {
        Ok(Some(message)) => {
          self.ingest(&message);
          last_progress = Instant::now();
        }
        Ok(None) => {
          let idle = last_progress.elapsed();
          if idle >= self.config.idle_timeout {
            self.windows.advance_by(idle);
            last_progress = Instant::now();
            trace!(watermark = ?self.windows.watermark(), "idle watermark advance");
          }
        }
        Err(e) => {
          error!(error = %e, "aggregator poll failed");
          shutdown.sleep(self.config.poll_timeout).await;
        }
      }

      let closed = self.windows.drain_closed();
      self.emit(closed).await;
    }

    let remaining = self.windows.drain_all();
    info!(windows = remaining.len(), "flushing open windows");
    self.emit(remaining).await;
    if let Err(e) = self.producer.flush(self.config.publish_timeout).await {
      warn!(error = %e, "producer flush on shutdown failed");
    }

    info!(
      messages = self.stats.messages,
      windows = self.stats.windows_emitted,
      late = self.stats.late,
      "aggregator stopped"
    );
    Ok(self.stats)
  }

  /// Feed one consumed message into the windows.
  pub fn ingest(&mut self, message: &BusMessage) {
    self.stats.messages += 1;

    let facts = match extract_line_facts(message, Utc::now()) {
      Ok(Extracted::Facts(facts)) => facts,
      Ok(Extracted::Ignored { event_type }) => {
        trace!(%event_type, "ignoring event");
        self.stats.ignored += 1;
        return;
      }
      Err(e) => {
        warn!(topic = %message.topic, offset = message.offset, error = %e, "skipping malformed message");
        self.stats.malformed += 1;
        return;
      }
    };

    for fact in facts {
      match self.windows.add(&fact.sku, fact.qty, fact.event_time) {
        Admission::Accepted { .. } => self.stats.accepted += 1,
        Admission::Late { window_start } => {
          debug!(sku = %fact.sku, %window_start, "dropping record for closed window");
          self.stats.late += 1;
        }
        Admission::Overflow { window_start } => {
          warn!(sku = %fact.sku, qty = fact.qty, %window_start, "window total would overflow, dropping line");
          self.stats.malformed += 1;
        }
      }
    }
  }

  async fn emit(&mut self, windows: Vec<AggregateWindow>) {
    for window in windows {
      let payload = match window.to_bytes() {
        Ok(payload) => payload,
        Err(e) => {
          error!(error = %e, "failed to encode window");
          self.stats.emit_failures += 1;
          continue;
        }
      };
      let timeout = self.config.publish_timeout;
      let sent = tokio::time::timeout(
        timeout,
        self.producer.send(&self.config.output_topic, &window.key, &payload, timeout),
      )
      .await;

      match sent {
        Ok(Ok(())) => {
          debug!(
            sku = %window.key,
            window_start = %window.window_start,
            total_qty = window.sum,
            "window emitted"
          );
          self.stats.windows_emitted += 1;
        }
        Ok(Err(e)) => {
          error!(sku = %window.key, error = %e, "failed to emit window");
          self.stats.emit_failures += 1;
        }
        Err(_) => {
          error!(sku = %window.key, "timed out emitting window");
          self.stats.emit_failures += 1;
        }
      }
    }
  }
}
