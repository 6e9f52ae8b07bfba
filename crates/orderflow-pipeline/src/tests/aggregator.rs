use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use orderflow_bus::MemoryBus;
use orderflow_core::{bus::BusMessage, window::AggregateWindow};
use serde_json::{Value, json};

use super::{EVENTS, STATS, created, envelope};
use crate::{
  aggregator::{
    Admission, Aggregator, AggregatorConfig, Extracted, LineFact, TumblingWindows,
    extract_line_facts,
  },
  shutdown,
};

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
}

fn message(payload: Vec<u8>) -> BusMessage {
  BusMessage { topic: EVENTS.into(), key: None, payload, timestamp: None, offset: 0 }
}

fn config() -> AggregatorConfig {
  AggregatorConfig {
    input_topic:      EVENTS.into(),
    output_topic:     STATS.into(),
    group_id:         "sku-aggregator-test".into(),
    window_size:      Duration::from_secs(60),
    allowed_lateness: Duration::from_secs(10),
    idle_timeout:     Duration::from_secs(60),
    poll_timeout:     Duration::from_millis(20),
    publish_timeout:  Duration::from_millis(200),
  }
}

// ─── Windows ─────────────────────────────────────────────────────────────────

#[test]
fn windows_align_to_the_epoch() {
  let windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::ZERO).unwrap();
  assert_eq!(windows.window_start(at(12, 0, 0)), at(12, 0, 0));
  assert_eq!(windows.window_start(at(12, 0, 59)), at(12, 0, 0));
  assert_eq!(windows.window_start(at(12, 1, 0)), at(12, 1, 0));

  let windows =
    TumblingWindows::new(Duration::from_secs(300), Duration::ZERO).unwrap();
  assert_eq!(windows.window_start(at(12, 7, 30)), at(12, 5, 0));
}

#[test]
fn zero_window_size_is_rejected() {
  assert!(TumblingWindows::new(Duration::ZERO, Duration::ZERO).is_err());
}

#[test]
fn late_records_within_the_bound_still_count() {
  let mut windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::from_secs(10)).unwrap();

  windows.add("A", 3, at(12, 0, 50));
  windows.add("X", 1, at(12, 1, 5));
  assert_eq!(windows.watermark(), Some(at(12, 0, 55)));

  // older than the watermark, but its window is still open
  assert_eq!(
    windows.add("A", 4, at(12, 0, 20)),
    Admission::Accepted { window_start: at(12, 0, 0) }
  );
  assert!(windows.drain_closed().is_empty());

  windows.add("X", 1, at(12, 1, 15));
  let closed = windows.drain_closed();
  assert_eq!(closed, vec![AggregateWindow {
    key:          "A".into(),
    window_start: at(12, 0, 0),
    window_end:   at(12, 1, 0),
    sum:          7,
  }]);

  assert_eq!(
    windows.add("A", 1, at(12, 0, 59)),
    Admission::Late { window_start: at(12, 0, 0) }
  );
  assert_eq!(windows.open_windows(), 1);
}

#[test]
fn watermark_never_moves_backwards() {
  let mut windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::ZERO).unwrap();
  windows.add("A", 1, at(12, 0, 30));
  windows.add("A", 1, at(12, 0, 10));
  assert_eq!(windows.watermark(), Some(at(12, 0, 30)));
}

#[test]
fn idle_advance_needs_a_first_record() {
  let mut windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::ZERO).unwrap();
  windows.advance_by(Duration::from_secs(3600));
  assert_eq!(windows.watermark(), None);

  windows.add("A", 2, at(12, 0, 30));
  windows.advance_by(Duration::from_secs(30));
  assert_eq!(windows.watermark(), Some(at(12, 1, 0)));
  assert_eq!(windows.drain_closed().len(), 1);
}

#[test]
fn drain_all_flushes_everything_in_window_order() {
  let mut windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::from_secs(600)).unwrap();
  windows.add("B", 1, at(12, 1, 0));
  windows.add("A", 2, at(12, 0, 0));
  windows.add("C", 5, at(12, 1, 30));

  let drained: Vec<_> = windows
    .drain_all()
    .into_iter()
    .map(|w| (w.key, w.window_start, w.sum))
    .collect();
  assert_eq!(drained, vec![
    ("A".to_owned(), at(12, 0, 0), 2),
    ("B".to_owned(), at(12, 1, 0), 1),
    ("C".to_owned(), at(12, 1, 0), 5),
  ]);
  assert_eq!(windows.open_windows(), 0);
}

#[test]
fn overflowing_sum_is_rejected_and_left_unchanged() {
  let mut windows =
    TumblingWindows::new(Duration::from_secs(60), Duration::ZERO).unwrap();
  windows.add("A", i64::MAX - 1, at(12, 0, 10));
  assert_eq!(
    windows.add("A", 2, at(12, 0, 20)),
    Admission::Overflow { window_start: at(12, 0, 0) }
  );
  assert_eq!(windows.watermark(), Some(at(12, 0, 10)));

  assert_eq!(
    windows.add("A", 1, at(12, 0, 30)),
    Admission::Accepted { window_start: at(12, 0, 0) }
  );
  let sums: Vec<_> = windows.drain_all().into_iter().map(|w| w.sum).collect();
  assert_eq!(sums, vec![i64::MAX]);
}

// ─── Extraction ──────────────────────────────────────────────────────────────

#[test]
fn extracts_one_fact_per_line() {
  let payload = created("o-1", &[("A", 2), ("B", 1), ("A", 3)], "2024-05-01T12:00:10Z");
  let Extracted::Facts(facts) = extract_line_facts(&message(payload), Utc::now()).unwrap()
  else {
    panic!("expected facts");
  };
  assert_eq!(facts.len(), 3);
  assert_eq!(facts[2], LineFact { sku: "A".into(), qty: 3, event_time: at(12, 0, 10) });
}

#[test]
fn other_event_types_are_ignored() {
  let payload = envelope("OrderPaid", "o-1", json!({ "order_id": "o-1" }), "2024-05-01T12:00:10Z");
  assert_eq!(
    extract_line_facts(&message(payload), Utc::now()).unwrap(),
    Extracted::Ignored { event_type: "OrderPaid".into() }
  );
}

#[test]
fn event_time_falls_back_to_bus_then_clock() {
  let now = at(13, 0, 0);
  let payload = created("o-1", &[("A", 1)], "not a time");

  let mut with_ts = message(payload.clone());
  with_ts.timestamp = Some(at(12, 30, 0));
  let Extracted::Facts(facts) = extract_line_facts(&with_ts, now).unwrap() else {
    panic!("expected facts");
  };
  assert_eq!(facts[0].event_time, at(12, 30, 0));

  let Extracted::Facts(facts) = extract_line_facts(&message(payload), now).unwrap() else {
    panic!("expected facts");
  };
  assert_eq!(facts[0].event_time, now);
}

#[test]
fn postgres_style_timestamps_are_accepted() {
  let payload = created("o-1", &[("A", 1)], "2024-05-01 12:00:10.5+00");
  let Extracted::Facts(facts) = extract_line_facts(&message(payload), Utc::now()).unwrap()
  else {
    panic!("expected facts");
  };
  assert_eq!(facts[0].event_time.timestamp_millis(), at(12, 0, 10).timestamp_millis() + 500);
}

#[test]
fn malformed_envelopes_are_errors() {
  let now = Utc::now();
  assert!(extract_line_facts(&message(b"{not json".to_vec()), now).is_err());
  assert!(extract_line_facts(&message(b"[1, 2]".to_vec()), now).is_err());

  let no_type = serde_json::to_vec(&json!({ "payload": {} })).unwrap();
  assert!(extract_line_facts(&message(no_type), now).is_err());

  let bad_items = envelope("OrderCreated", "o-1", json!({ "order_id": "o-1", "items": "many" }), "");
  assert!(extract_line_facts(&message(bad_items), now).is_err());
}

#[test]
fn lines_without_a_sku_are_skipped() {
  let payload = created("o-1", &[("", 4), ("B", 1)], "2024-05-01T12:00:10Z");
  let Extracted::Facts(facts) = extract_line_facts(&message(payload), Utc::now()).unwrap()
  else {
    panic!("expected facts");
  };
  let skus: Vec<_> = facts.iter().map(|f| f.sku.as_str()).collect();
  assert_eq!(skus, vec!["B"]);
}

// ─── Loop ────────────────────────────────────────────────────────────────────

async fn emitted(bus: &MemoryBus) -> Vec<Value> {
  bus
    .messages(STATS)
    .await
    .iter()
    .map(|m| serde_json::from_slice(&m.payload).unwrap())
    .collect()
}

#[tokio::test]
async fn run_counts_messages_and_flushes_on_shutdown() {
  let bus = MemoryBus::new();
  bus.append(EVENTS, Some("o-1"), &created("o-1", &[("A", 2), ("B", 1)], "2024-05-01T12:00:05Z")).await;
  bus.append(EVENTS, Some("o-2"), &created("o-2", &[("A", 3)], "2024-05-01T12:00:40Z")).await;
  bus
    .append(EVENTS, Some("o-1"), &envelope("OrderPaid", "o-1", json!({ "order_id": "o-1" }), "2024-05-01T12:00:50Z"))
    .await;
  bus.append(EVENTS, Some("o-3"), b"garbage").await;

  let config = config();
  let consumer = bus.subscribe(config.group_id.clone(), &[EVENTS]);
  let mut aggregator = Aggregator::new(consumer, bus.clone(), config).unwrap();
  let (trigger, shutdown) = shutdown::channel();

  let stop = async {
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.trigger();
  };
  let (stats, ()) = tokio::join!(aggregator.run(&shutdown), stop);
  let stats = stats.unwrap();

  assert_eq!(stats.messages, 4);
  assert_eq!(stats.ignored, 1);
  assert_eq!(stats.malformed, 1);
  assert_eq!(stats.accepted, 3);
  assert_eq!(stats.windows_emitted, 2);

  let out = emitted(&bus).await;
  assert_eq!(out.len(), 2);
  assert_eq!(out[0]["sku"], "A");
  assert_eq!(out[0]["total_qty"], 5);
  assert_eq!(out[0]["window_start"], "2024-05-01T12:00:00Z");
  assert_eq!(out[0]["window_end"], "2024-05-01T12:01:00Z");
  assert_eq!(out[1]["sku"], "B");
  assert_eq!(out[1]["total_qty"], 1);

  let keys: Vec<_> = bus.messages(STATS).await.into_iter().map(|m| m.key).collect();
  assert_eq!(keys, vec![Some("A".to_owned()), Some("B".to_owned())]);
}

#[tokio::test]
async fn huge_quantities_are_counted_as_malformed() {
  let bus = MemoryBus::new();
  let config = config();
  let consumer = bus.subscribe(config.group_id.clone(), &[EVENTS]);
  let mut aggregator = Aggregator::new(consumer, bus.clone(), config).unwrap();

  for order_id in ["o-1", "o-2"] {
    aggregator.ingest(&message(created(order_id, &[("A", i64::MAX)], "2024-05-01T12:00:05Z")));
  }
  aggregator.ingest(&message(created("o-3", &[("B", 4)], "2024-05-01T12:00:06Z")));

  let stats = aggregator.stats();
  assert_eq!(stats.messages, 3);
  assert_eq!(stats.accepted, 2);
  assert_eq!(stats.malformed, 1);
  assert_eq!(aggregator.windows().open_windows(), 1);
}

#[tokio::test]
async fn idle_input_closes_windows_on_processing_time() {
  let bus = MemoryBus::new();
  let now = Utc::now().to_rfc3339();
  bus.append(EVENTS, Some("o-1"), &created("o-1", &[("A", 1)], &now)).await;

  let config = AggregatorConfig {
    window_size: Duration::from_millis(200),
    allowed_lateness: Duration::ZERO,
    idle_timeout: Duration::from_millis(50),
    poll_timeout: Duration::from_millis(20),
    ..config()
  };
  let consumer = bus.subscribe(config.group_id.clone(), &[EVENTS]);
  let mut aggregator = Aggregator::new(consumer, bus.clone(), config).unwrap();
  let (trigger, shutdown) = shutdown::channel();

  let observe = async {
    let mut seen = 0;
    for _ in 0..100 {
      seen = bus.messages(STATS).await.len();
      if seen > 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    trigger.trigger();
    seen
  };
  let (stats, seen) = tokio::join!(aggregator.run(&shutdown), observe);

  // emitted while running, not by the shutdown flush
  assert_eq!(seen, 1);
  assert_eq!(stats.unwrap().windows_emitted, 1);
  assert_eq!(emitted(&bus).await[0]["total_qty"], 1);
}
