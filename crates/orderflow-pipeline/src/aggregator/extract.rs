//! Turns primary-topic envelopes into per-line quantity facts.

use chrono::{DateTime, Utc};
use orderflow_core::{
  bus::BusMessage,
  event::{ORDER_CREATED, OrderEvent, parse_event_time, required_str},
  Error, Result,
};
use serde_json::Value;

/// One line item's contribution to its SKU's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFact {
  pub sku:        String,
  pub qty:        i64,
  pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
  Facts(Vec<LineFact>),
  /// Well-formed, but not an event the aggregator counts.
  Ignored { event_type: String },
}

/// Event time for an envelope: its `created_at` if parseable, else the bus
/// timestamp, else `now`.
pub fn event_time(envelope: &Value, message: &BusMessage, now: DateTime<Utc>) -> DateTime<Utc> {
  envelope
    .get("created_at")
    .and_then(Value::as_str)
    .and_then(parse_event_time)
    .or(message.timestamp)
    .unwrap_or(now)
}

pub fn extract_line_facts(message: &BusMessage, now: DateTime<Utc>) -> Result<Extracted> {
  let envelope: Value = serde_json::from_slice(&message.payload)?;
  if !envelope.is_object() {
    return Err(Error::Malformed("envelope is not a JSON object".into()));
  }

  let event_type = required_str(&envelope, "event_type")?;
  if event_type != ORDER_CREATED {
    return Ok(Extracted::Ignored { event_type: event_type.to_owned() });
  }

  let payload = envelope
    .get("payload")
    .filter(|p| p.is_object())
    .ok_or(Error::MissingField("payload"))?;
  let event = OrderEvent::from_parts(event_type, payload)?;
  let event_time = event_time(&envelope, message, now);

  let facts = event
    .line_items()
    .iter()
    .filter(|item| !item.sku.is_empty())
    .map(|item| LineFact { sku: item.sku.clone(), qty: item.qty, event_time })
    .collect();
  Ok(Extracted::Facts(facts))
}
