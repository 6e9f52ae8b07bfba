//! In-process event log with Kafka-like consumer groups.
//!
//! Every topic is an append-only vector. Each `(group, topic)` pair has its
//! own read offset, advanced as soon as a message is handed out, so separate
//! groups each see every message and members of one group share the stream.
//! Nothing is ever dropped, which makes replays a matter of resetting
//! offsets.

use std::{
  collections::HashMap,
  sync::Arc,
  time::Duration,
};

use chrono::Utc;
use orderflow_core::bus::{BusMessage, Consumer, DeliveryError, Producer};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::{BusError, Result};

struct Stored {
  /// Global append order across all topics.
  seq:     u64,
  message: BusMessage,
}

#[derive(Default)]
struct State {
  topics:   HashMap<String, Vec<Stored>>,
  /// Next index to hand out, per `(group, topic)`.
  offsets:  HashMap<(String, String), usize>,
  next_seq: u64,
}

#[derive(Default)]
struct Inner {
  state:  Mutex<State>,
  notify: Notify,
}

/// A shared in-memory bus. Clones refer to the same log.
#[derive(Clone, Default)]
pub struct MemoryBus {
  inner: Arc<Inner>,
}

impl MemoryBus {
  pub fn new() -> Self { Self::default() }

  /// Join consumer group `group` reading `topics`.
  pub fn subscribe(
    &self,
    group: impl Into<String>,
    topics: &[&str],
  ) -> MemoryConsumer {
    let group = group.into();
    debug!(%group, ?topics, "memory bus subscription");
    MemoryConsumer {
      bus: self.clone(),
      group,
      topics: topics.iter().map(|t| (*t).to_owned()).collect(),
    }
  }

  /// Append a message and wake waiting consumers.
  pub async fn append(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> i64 {
    let offset = {
      let mut state = self.inner.state.lock().await;
      let seq = state.next_seq;
      state.next_seq += 1;
      let log = state.topics.entry(topic.to_owned()).or_default();
      let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
      log.push(Stored {
        seq,
        message: BusMessage {
          topic: topic.to_owned(),
          key: key.map(str::to_owned),
          payload: payload.to_vec(),
          timestamp: Some(Utc::now()),
          offset,
        },
      });
      offset
    };
    self.inner.notify.notify_waiters();
    offset
  }

  /// Everything ever written to `topic`, in order.
  pub async fn messages(&self, topic: &str) -> Vec<BusMessage> {
    let state = self.inner.state.lock().await;
    state
      .topics
      .get(topic)
      .map(|log| log.iter().map(|s| s.message.clone()).collect())
      .unwrap_or_default()
  }

  /// Rewind every offset held by `group` so its next polls replay each
  /// topic from the start.
  pub async fn seek_to_beginning(&self, group: &str) {
    let mut state = self.inner.state.lock().await;
    state.offsets.retain(|(g, _), _| g != group);
  }

  /// Hand out the oldest unread message across `topics` for `group`.
  async fn take_next(&self, group: &str, topics: &[String]) -> Option<BusMessage> {
    let mut state = self.inner.state.lock().await;

    let mut best: Option<(&str, u64)> = None;
    for topic in topics {
      let Some(log) = state.topics.get(topic) else { continue };
      let next = state
        .offsets
        .get(&(group.to_owned(), topic.clone()))
        .copied()
        .unwrap_or(0);
      if let Some(stored) = log.get(next) {
        if best.is_none_or(|(_, seq)| stored.seq < seq) {
          best = Some((topic, stored.seq));
        }
      }
    }

    let topic = best?.0.to_owned();
    let offset = state.offsets.entry((group.to_owned(), topic.clone())).or_insert(0);
    let index = *offset;
    *offset += 1;
    state.topics.get(&topic).and_then(|log| log.get(index)).map(|s| s.message.clone())
  }
}

impl Producer for MemoryBus {
  async fn send(
    &self,
    topic: &str,
    key: &str,
    payload: &[u8],
    _timeout: Duration,
  ) -> Result<(), DeliveryError> {
    self.append(topic, Some(key), payload).await;
    Ok(())
  }

  async fn flush(&self, _timeout: Duration) -> Result<(), DeliveryError> { Ok(()) }
}

// ─── Consumer ────────────────────────────────────────────────────────────────

/// A member of one consumer group on a [`MemoryBus`].
pub struct MemoryConsumer {
  bus:    MemoryBus,
  group:  String,
  topics: Vec<String>,
}

impl MemoryConsumer {
  pub fn group(&self) -> &str { &self.group }
}

impl Consumer for MemoryConsumer {
  type Error = BusError;

  async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      // Register interest before checking so an append between the check
      // and the wait is not missed.
      let notified = self.bus.inner.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(message) = self.bus.take_next(&self.group, &self.topics).await {
        return Ok(Some(message));
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return Ok(None);
      }
    }
  }
}
