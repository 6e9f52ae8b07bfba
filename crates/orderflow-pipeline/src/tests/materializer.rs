use std::{
  sync::{Arc, atomic::AtomicUsize},
  time::Duration,
};

use chrono::{TimeZone, Utc};
use orderflow_bus::{MemoryBus, MemoryConsumer};
use orderflow_core::{
  bus::BusMessage,
  projection::{AuditRecord, ProjectionStore, SkuStat, StatsQuery},
  window::AggregateWindow,
};
use orderflow_store_sqlite::SqliteStore;
use serde_json::json;

use super::{EVENTS, STATS, created, envelope, take_one};
use crate::{
  materializer::{
    Handled, Materializer, MaterializerConfig, MaterializerStats, extract_audit, parse_stats,
  },
  shutdown,
};

fn config() -> MaterializerConfig {
  MaterializerConfig {
    stats_topic:  STATS.into(),
    events_topic: EVENTS.into(),
    group_id:     "materializer-test".into(),
    poll_timeout: Duration::from_millis(20),
  }
}

fn window(sku: &str, minute: u32, total: i64) -> Vec<u8> {
  AggregateWindow {
    key:          sku.into(),
    window_start: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
    window_end:   Utc.with_ymd_and_hms(2024, 5, 1, 12, minute + 1, 0).unwrap(),
    sum:          total,
  }
  .to_bytes()
  .unwrap()
}

fn on(topic: &str, payload: Vec<u8>) -> BusMessage {
  BusMessage { topic: topic.into(), key: None, payload, timestamp: None, offset: 0 }
}

async fn materializer(bus: &MemoryBus) -> Materializer<SqliteStore, MemoryConsumer> {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let config = config();
  let consumer = bus.subscribe(config.group_id.clone(), &config.topics());
  Materializer::new(store, consumer, config)
}

/// Run until the group has caught up, then stop.
async fn drain<S: ProjectionStore>(
  materializer: &mut Materializer<S, MemoryConsumer>,
) -> MaterializerStats {
  let (trigger, shutdown) = shutdown::channel();
  let stop = async {
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.trigger();
  };
  let (stats, ()) = tokio::join!(materializer.run(&shutdown), stop);
  stats.unwrap()
}

/// Rejects the first `failures` stat upserts, then delegates.
struct FlakyProjections {
  inner:    SqliteStore,
  failures: Arc<AtomicUsize>,
}

impl ProjectionStore for FlakyProjections {
  type Error = std::io::Error;

  async fn upsert_stat(&self, window: &AggregateWindow) -> Result<SkuStat, Self::Error> {
    if take_one(&self.failures) {
      return Err(std::io::Error::other("database is locked"));
    }
    self.inner.upsert_stat(window).await.map_err(std::io::Error::other)
  }

  async fn insert_audit(&self, record: &AuditRecord) -> Result<(), Self::Error> {
    self.inner.insert_audit(record).await.map_err(std::io::Error::other)
  }

  async fn list_stats(&self, query: &StatsQuery) -> Result<Vec<SkuStat>, Self::Error> {
    self.inner.list_stats(query).await.map_err(std::io::Error::other)
  }

  async fn audit_for_order(&self, order_id: &str) -> Result<Vec<AuditRecord>, Self::Error> {
    self.inner.audit_for_order(order_id).await.map_err(std::io::Error::other)
  }
}

async fn flaky(bus: &MemoryBus, failures: usize) -> Materializer<FlakyProjections, MemoryConsumer> {
  let store = FlakyProjections {
    inner:    SqliteStore::open_in_memory().await.unwrap(),
    failures: Arc::new(AtomicUsize::new(failures)),
  };
  let config = config();
  let consumer = bus.subscribe(config.group_id.clone(), &config.topics());
  Materializer::new(store, consumer, config)
}

fn strip_updated(stats: Vec<SkuStat>) -> Vec<(String, i64, chrono::DateTime<Utc>)> {
  stats.into_iter().map(|s| (s.sku, s.total_qty, s.created_at)).collect()
}

// ─── Extraction ──────────────────────────────────────────────────────────────

#[test]
fn audit_takes_relay_envelopes_as_is() {
  let payload = created("o-1", &[("A", 2)], "2024-05-01T12:00:00Z");
  let audit = extract_audit(&payload, Utc::now()).unwrap();
  assert_eq!(audit.order_id, "o-1");
  assert_eq!(audit.event_type, "OrderCreated");
  assert_eq!(audit.occurred_at, "2024-05-01T12:00:00Z");
  assert_eq!(audit.data["items"][0]["sku"], "A");
}

#[test]
fn audit_field_sources_are_tried_in_order() {
  let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

  // top-level order_id wins over the payload and aggregate id
  let message = serde_json::to_vec(&json!({
    "event_type": "OrderPaid",
    "order_id": "top",
    "aggregate_id": "agg",
    "payload": { "order_id": "inner" },
    "occurred_at": "2024-05-01T12:30:00Z",
  }))
  .unwrap();
  let audit = extract_audit(&message, now).unwrap();
  assert_eq!(audit.order_id, "top");
  assert_eq!(audit.occurred_at, "2024-05-01T12:30:00Z");

  // a JSON string under `data` stands in for the payload
  let message = serde_json::to_vec(&json!({
    "event_type": "OrderPaid",
    "aggregate_id": "agg",
    "data": "{\"order_id\":\"from-data\",\"note\":1}",
  }))
  .unwrap();
  let audit = extract_audit(&message, now).unwrap();
  assert_eq!(audit.order_id, "from-data");
  assert_eq!(audit.data, json!({ "order_id": "from-data", "note": 1 }));
  assert_eq!(audit.occurred_at, "2024-05-01T13:00:00.000000Z");

  // no payload at all: the whole message is stored
  let message = serde_json::to_vec(&json!({
    "event_type": "OrderCanceled",
    "aggregate_id": "agg",
  }))
  .unwrap();
  let audit = extract_audit(&message, now).unwrap();
  assert_eq!(audit.order_id, "agg");
  assert_eq!(audit.data["event_type"], "OrderCanceled");
}

#[test]
fn audit_requires_type_and_order() {
  let now = Utc::now();
  let no_type = serde_json::to_vec(&json!({ "aggregate_id": "o-1" })).unwrap();
  assert!(extract_audit(&no_type, now).is_err());

  let no_order = serde_json::to_vec(&json!({ "event_type": "OrderPaid", "payload": {} })).unwrap();
  assert!(extract_audit(&no_order, now).is_err());

  assert!(extract_audit(b"not json", now).is_err());
}

#[test]
fn stats_messages_are_validated() {
  let parsed = parse_stats(&window("A", 0, 7)).unwrap();
  assert_eq!(parsed.key, "A");
  assert_eq!(parsed.sum, 7);

  for bad in [
    json!({ "window_start": "2024-05-01T12:00:00Z", "window_end": "2024-05-01T12:01:00Z", "total_qty": 1 }),
    json!({ "sku": "A", "window_start": "yesterday", "window_end": "2024-05-01T12:01:00Z", "total_qty": 1 }),
    json!({ "sku": "A", "window_start": "2024-05-01T12:00:00Z", "window_end": "2024-05-01T12:01:00Z" }),
    json!({ "sku": "A", "window_start": "2024-05-01T12:00:00Z", "window_end": "2024-05-01T12:01:00Z", "total_qty": "7" }),
    json!({ "sku": "A", "window_start": "2024-05-01T12:01:00Z", "window_end": "2024-05-01T12:00:00Z", "total_qty": 1 }),
  ] {
    assert!(parse_stats(&serde_json::to_vec(&bad).unwrap()).is_err(), "{bad}");
  }
}

// ─── Handling ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn messages_are_routed_by_topic() {
  let bus = MemoryBus::new();
  let m = materializer(&bus).await;

  assert_eq!(m.handle(&on(STATS, window("A", 0, 7))).await.unwrap(), Handled::Stat);
  assert_eq!(
    m.handle(&on(EVENTS, created("o-1", &[("A", 7)], "2024-05-01T12:00:00Z")))
      .await
      .unwrap(),
    Handled::Audit
  );
  assert_eq!(m.handle(&on("elsewhere", window("A", 0, 7))).await.unwrap(), Handled::Skipped);
  assert_eq!(m.handle(&on(STATS, b"{}".to_vec())).await.unwrap(), Handled::Skipped);
  assert_eq!(m.handle(&on(EVENTS, b"[]".to_vec())).await.unwrap(), Handled::Skipped);

  let stats = m.store().list_stats(&StatsQuery::default()).await.unwrap();
  assert_eq!(stats.len(), 1);
  assert_eq!(stats[0].total_qty, 7);
  assert_eq!(m.store().audit_for_order("o-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn replay_converges_stats_and_duplicates_audit() {
  let bus = MemoryBus::new();
  bus.append(EVENTS, Some("o-1"), &created("o-1", &[("A", 7)], "2024-05-01T12:00:10Z")).await;
  bus
    .append(EVENTS, Some("o-1"), &envelope("OrderPaid", "o-1", json!({ "order_id": "o-1" }), "2024-05-01T12:00:20Z"))
    .await;
  bus.append(STATS, Some("A"), &window("A", 0, 7)).await;
  bus.append(STATS, Some("B"), &window("B", 0, 2)).await;
  bus.append(STATS, Some("A"), &window("A", 0, 9)).await;

  let mut m = materializer(&bus).await;
  let first = drain(&mut m).await;
  assert_eq!(first.stats_upserted, 3);
  assert_eq!(first.audits_inserted, 2);
  assert_eq!(first.skipped, 0);

  let before = m.store().list_stats(&StatsQuery::default()).await.unwrap();
  assert_eq!(before.len(), 2);
  let a = before.iter().find(|s| s.sku == "A").unwrap();
  assert_eq!(a.total_qty, 9);

  bus.seek_to_beginning(&config().group_id).await;
  drain(&mut m).await;

  let after = m.store().list_stats(&StatsQuery::default()).await.unwrap();
  assert_eq!(strip_updated(after), strip_updated(before));

  let audit = m.store().audit_for_order("o-1").await.unwrap();
  let types: Vec<_> = audit.iter().map(|a| a.event_type.as_str()).collect();
  assert_eq!(types, vec!["OrderCreated", "OrderCreated", "OrderPaid", "OrderPaid"]);
}

#[tokio::test]
async fn store_failures_retry_the_same_message() {
  let bus = MemoryBus::new();
  bus.append(STATS, Some("A"), &window("A", 0, 7)).await;
  bus.append(STATS, Some("B"), &window("B", 0, 2)).await;

  let mut m = flaky(&bus, 2).await;
  let stats = drain(&mut m).await;
  assert_eq!(stats.failed, 2);
  assert_eq!(stats.stats_upserted, 2);
  assert_eq!(stats.skipped, 0);

  let stored = m.store().list_stats(&StatsQuery::default()).await.unwrap();
  let mut totals: Vec<_> = stored.into_iter().map(|s| (s.sku, s.total_qty)).collect();
  totals.sort();
  assert_eq!(totals, vec![("A".to_owned(), 7), ("B".to_owned(), 2)]);
}

#[tokio::test]
async fn shutdown_interrupts_a_failing_retry() {
  let bus = MemoryBus::new();
  bus.append(STATS, Some("A"), &window("A", 0, 7)).await;

  let mut m = flaky(&bus, usize::MAX).await;
  let stats = drain(&mut m).await;
  assert!(stats.failed >= 1);
  assert_eq!(stats.stats_upserted, 0);
  assert!(m.store().list_stats(&StatsQuery::default()).await.unwrap().is_empty());
}
