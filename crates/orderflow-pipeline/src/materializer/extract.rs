//! Decoding of the two message kinds the materializer stores.
//!
//! Audit extraction tolerates several producer shapes. Each field is taken
//! from the first source in its list that yields a value:
//!
//! | field         | sources, in order                                          |
//! |---------------|------------------------------------------------------------|
//! | payload       | `payload` (object), `data` (string holding a JSON object)  |
//! | `order_id`    | top-level `order_id`, `payload.order_id`, `aggregate_id`   |
//! | `occurred_at` | `created_at`, `occurred_at`, the processing clock          |
//!
//! The stored data is the extracted payload, or the whole message when there
//! is none. `event_type` and an order id are required.

use chrono::{DateTime, SecondsFormat, Utc};
use orderflow_core::{
  Error, Result,
  event::{parse_event_time, required_str},
  projection::AuditRecord,
  window::AggregateWindow,
};
use serde_json::Value;

fn object(payload: &[u8]) -> Result<Value> {
  let value: Value = serde_json::from_slice(payload)?;
  if !value.is_object() {
    return Err(Error::Malformed("message is not a JSON object".into()));
  }
  Ok(value)
}

fn timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>> {
  let raw = required_str(value, field)?;
  parse_event_time(raw).ok_or_else(|| Error::InvalidField {
    field,
    reason: format!("unparseable timestamp {raw:?}"),
  })
}

/// Validate and decode an aggregate-topic message.
pub fn parse_stats(payload: &[u8]) -> Result<AggregateWindow> {
  let value = object(payload)?;
  let sku = required_str(&value, "sku")?.to_owned();
  let window_start = timestamp(&value, "window_start")?;
  let window_end = timestamp(&value, "window_end")?;

  let sum = match value.get("total_qty") {
    None | Some(Value::Null) => return Err(Error::MissingField("total_qty")),
    Some(v) => v.as_i64().ok_or_else(|| Error::InvalidField {
      field:  "total_qty",
      reason: format!("expected an integer, got {v}"),
    })?,
  };

  if window_end <= window_start {
    return Err(Error::InvalidField {
      field:  "window_end",
      reason: "must be after window_start".into(),
    });
  }

  Ok(AggregateWindow { key: sku, window_start, window_end, sum })
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
  value.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn extract_payload(message: &Value) -> Option<Value> {
  if let Some(payload) = message.get("payload").filter(|p| p.is_object()) {
    return Some(payload.clone());
  }
  message
    .get("data")
    .and_then(Value::as_str)
    .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
    .filter(Value::is_object)
}

/// Build the audit row for a primary-topic message.
pub fn extract_audit(payload: &[u8], now: DateTime<Utc>) -> Result<AuditRecord> {
  let message = object(payload)?;
  let event_type = required_str(&message, "event_type")?.to_owned();
  let extracted = extract_payload(&message);

  let order_id = non_empty_str(&message, "order_id")
    .or_else(|| extracted.as_ref().and_then(|p| non_empty_str(p, "order_id")))
    .or_else(|| non_empty_str(&message, "aggregate_id"))
    .ok_or(Error::MissingField("order_id"))?
    .to_owned();

  let occurred_at = non_empty_str(&message, "created_at")
    .or_else(|| non_empty_str(&message, "occurred_at"))
    .map(str::to_owned)
    .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Micros, true));

  Ok(AuditRecord {
    order_id,
    event_type,
    occurred_at,
    data: extracted.unwrap_or(message),
  })
}
