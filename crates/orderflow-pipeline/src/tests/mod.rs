mod aggregator;
mod materializer;

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use orderflow_bus::MemoryBus;
use orderflow_core::bus::{DeliveryError, Producer};
use serde_json::{Value, json};

use crate::relay::RelayConfig;

pub const EVENTS: &str = "orders.events";
pub const DLQ: &str = "orders.events.dlq";
pub const STATS: &str = "orders.sku-stats";

pub fn relay_config(worker_id: &str) -> RelayConfig {
  RelayConfig {
    worker_id:       worker_id.into(),
    topic:           EVENTS.into(),
    dlq_topic:       DLQ.into(),
    batch_size:      50,
    poll_interval:   Duration::from_millis(50),
    publish_timeout: Duration::from_millis(200),
    max_retries:     3,
    lease_ttl:       Duration::from_secs(60),
  }
}

/// A primary-topic envelope as the relay writes it.
pub fn envelope(event_type: &str, order_id: &str, payload: Value, created_at: &str) -> Vec<u8> {
  serde_json::to_vec(&json!({
    "event_type": event_type,
    "aggregate_id": order_id,
    "payload": payload,
    "created_at": created_at,
  }))
  .unwrap()
}

pub fn created(order_id: &str, items: &[(&str, i64)], created_at: &str) -> Vec<u8> {
  let items: Vec<Value> = items
    .iter()
    .map(|(sku, qty)| json!({ "sku": sku, "qty": qty }))
    .collect();
  envelope(
    "OrderCreated",
    order_id,
    json!({ "order_id": order_id, "items": items }),
    created_at,
  )
}

/// Wraps a [`MemoryBus`] with injectable delivery failures.
#[derive(Clone)]
pub struct ScriptedProducer {
  pub bus:           MemoryBus,
  /// Remaining primary-topic sends to reject.
  pub fail_primary:  Arc<AtomicUsize>,
  /// Remaining dead-letter sends to reject.
  pub fail_dlq:      Arc<AtomicUsize>,
  /// Dead-letter sends attempted, accepted or not.
  pub dlq_sends:     Arc<AtomicUsize>,
  /// Primary-topic sends attempted, accepted or not.
  pub primary_sends: Arc<AtomicUsize>,
  /// Never complete a send.
  pub hang:          bool,
}

impl ScriptedProducer {
  pub fn new(bus: MemoryBus) -> Self {
    Self {
      bus,
      fail_primary: Arc::new(AtomicUsize::new(0)),
      fail_dlq: Arc::new(AtomicUsize::new(0)),
      dlq_sends: Arc::new(AtomicUsize::new(0)),
      primary_sends: Arc::new(AtomicUsize::new(0)),
      hang: false,
    }
  }

  pub fn failing_primary(self, n: usize) -> Self {
    self.fail_primary.store(n, Ordering::SeqCst);
    self
  }

  pub fn failing_dlq(self, n: usize) -> Self {
    self.fail_dlq.store(n, Ordering::SeqCst);
    self
  }

  pub fn hanging(mut self) -> Self {
    self.hang = true;
    self
  }
}

fn take_one(counter: &AtomicUsize) -> bool {
  counter
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
    .is_ok()
}

impl Producer for ScriptedProducer {
  async fn send(
    &self,
    topic: &str,
    key: &str,
    payload: &[u8],
    timeout: Duration,
  ) -> Result<(), DeliveryError> {
    if self.hang {
      std::future::pending::<()>().await;
    }
    let (counter, sends) = if topic == DLQ {
      (&self.fail_dlq, &self.dlq_sends)
    } else {
      (&self.fail_primary, &self.primary_sends)
    };
    sends.fetch_add(1, Ordering::SeqCst);
    if take_one(counter) {
      return Err(DeliveryError::Rejected("broker unavailable".into()));
    }
    self.bus.send(topic, key, payload, timeout).await
  }

  async fn flush(&self, _timeout: Duration) -> Result<(), DeliveryError> { Ok(()) }
}
