//! Order events and the JSON envelopes that carry them over the bus.
//!
//! Outbox payloads are schema-less JSON. Internally the pipeline decodes the
//! event types it understands into [`OrderEvent`], but the raw payload is
//! always kept alongside so audit storage and dead-lettering never lose
//! fields the decoder does not know about.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

// ─── Event type discriminants ────────────────────────────────────────────────

pub const ORDER_CREATED: &str = "OrderCreated";
pub const ORDER_PAID: &str = "OrderPaid";
pub const ORDER_CANCELED: &str = "OrderCanceled";

/// `aggregate_type` written for every order event.
pub const ORDER_AGGREGATE: &str = "order";

// ─── Payloads ────────────────────────────────────────────────────────────────

/// One line of an order. Each line contributes separately to its SKU's
/// windowed total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
  pub sku:        String,
  pub qty:        i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unit_price: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
  pub order_id:     String,
  #[serde(default)]
  pub items:        Vec<LineItem>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency:     Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total_amount: Option<i64>,
}

/// Payload of the status-transition events, which only name the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
  pub order_id: String,
}

// ─── OrderEvent ──────────────────────────────────────────────────────────────

/// Tagged union over the order event types the pipeline knows about.
///
/// Any other `event_type` decodes to [`OrderEvent::Other`]; that is never an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
  Created(OrderCreated),
  Paid(OrderRef),
  Canceled(OrderRef),
  Other { event_type: String },
}

impl OrderEvent {
  /// The discriminant used as `event_type` in the outbox and on the wire.
  pub fn event_type(&self) -> &str {
    match self {
      Self::Created(_) => ORDER_CREATED,
      Self::Paid(_) => ORDER_PAID,
      Self::Canceled(_) => ORDER_CANCELED,
      Self::Other { event_type } => event_type,
    }
  }

  /// Decode from the discriminant and the raw payload. The payload is
  /// borrowed; callers keep the original for verbatim storage.
  pub fn from_parts(event_type: &str, payload: &Value) -> Result<Self> {
    let event = match event_type {
      ORDER_CREATED => Self::Created(serde_json::from_value(payload.clone())?),
      ORDER_PAID => Self::Paid(serde_json::from_value(payload.clone())?),
      ORDER_CANCELED => {
        Self::Canceled(serde_json::from_value(payload.clone())?)
      }
      other => Self::Other { event_type: other.to_owned() },
    };
    Ok(event)
  }

  /// Serialise the payload (without the type tag) for the outbox.
  pub fn to_payload(&self) -> Result<Value> {
    let value = match self {
      Self::Created(created) => serde_json::to_value(created)?,
      Self::Paid(r) | Self::Canceled(r) => serde_json::to_value(r)?,
      Self::Other { .. } => Value::Object(Default::default()),
    };
    Ok(value)
  }

  pub fn order_id(&self) -> Option<&str> {
    match self {
      Self::Created(created) => Some(&created.order_id),
      Self::Paid(r) | Self::Canceled(r) => Some(&r.order_id),
      Self::Other { .. } => None,
    }
  }

  /// Line items carried by the event; empty for everything but
  /// `OrderCreated`.
  pub fn line_items(&self) -> &[LineItem] {
    match self {
      Self::Created(created) => &created.items,
      _ => &[],
    }
  }
}

// ─── Envelopes ───────────────────────────────────────────────────────────────

/// The primary-topic message body. The bus key is `aggregate_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
  pub event_type:   String,
  pub aggregate_id: String,
  pub payload:      Value,
  #[serde(with = "micros")]
  pub created_at:   DateTime<Utc>,
}

impl EventEnvelope {
  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(self)?) }
}

/// Dead-letter message: the primary envelope plus the error that exhausted
/// the retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
  #[serde(flatten)]
  pub envelope: EventEnvelope,
  pub error:    String,
}

impl DeadLetterEnvelope {
  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(serde_json::to_vec(self)?) }
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

/// Fixed-width RFC 3339 with microseconds, so serialised timestamps sort
/// the same as text and as time.
mod micros {
  use chrono::{DateTime, SecondsFormat, Utc};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    DateTime::<Utc>::deserialize(d)
  }
}

/// Parse an event timestamp leniently.
///
/// Accepted, in order: RFC 3339; `YYYY-MM-DD HH:MM:SS[.f]±HH[:MM]` (the text
/// form Postgres produces); and the same shapes without an offset, which are
/// taken to be UTC. Returns `None` for anything else.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
  let raw = raw.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.with_timezone(&Utc));
  }
  if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
    return Some(dt.with_timezone(&Utc));
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    .map(|naive| naive.and_utc())
}

/// Read a required string field from a JSON object.
pub fn required_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str> {
  match value.get(field) {
    Some(Value::String(s)) if !s.is_empty() => Ok(s),
    Some(Value::String(_)) | Some(Value::Null) | None => {
      Err(Error::MissingField(field))
    }
    Some(other) => Err(Error::InvalidField {
      field,
      reason: format!("expected a string, got {other}"),
    }),
  }
}
