//! A minimal order service that writes through the transactional outbox.
//!
//! Placing an order and moving it to `paid` or `canceled` each commit the
//! order rows and exactly one outbox event together.

use chrono::{DateTime, Utc};
use orderflow_core::{
  event::{LineItem, OrderCreated, OrderEvent, OrderRef},
  outbox::{NewOutboxRecord, OutboxRecord},
};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  encode::{decode_dt, encode_dt},
  store::{SqliteStore, append_event_in},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
  Created,
  Paid,
  Canceled,
}

impl OrderStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Created => "created",
      Self::Paid => "paid",
      Self::Canceled => "canceled",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "created" => Some(Self::Created),
      "paid" => Some(Self::Paid),
      "canceled" => Some(Self::Canceled),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub order_id:     String,
  pub status:       OrderStatus,
  pub currency:     Option<String>,
  pub total_amount: Option<i64>,
  pub items:        Vec<LineItem>,
  pub created_at:   DateTime<Utc>,
  pub updated_at:   DateTime<Utc>,
}

/// Sum of `qty * unit_price`, or `None` if any line has no price.
fn line_total(items: &[LineItem]) -> Result<Option<i64>> {
  let mut total: i64 = 0;
  for item in items {
    let Some(price) = item.unit_price else { return Ok(None) };
    total = price
      .checked_mul(item.qty)
      .and_then(|line| total.checked_add(line))
      .ok_or_else(|| orderflow_core::Error::InvalidField {
        field:  "total_amount",
        reason: "order total overflows".into(),
      })?;
  }
  Ok(Some(total))
}

impl SqliteStore {
  /// Insert a new order in `created` state and capture `OrderCreated`.
  ///
  /// A missing `total_amount` is computed from the line prices when every
  /// line has one.
  pub async fn create_order(&self, mut order: OrderCreated) -> Result<OutboxRecord> {
    if order.total_amount.is_none() {
      order.total_amount = line_total(&order.items)?;
    }
    let new = NewOutboxRecord::for_order(
      order.order_id.clone(),
      &OrderEvent::Created(order.clone()),
    )?;
    let now = encode_dt(Utc::now());

    let ((), record) = self
      .commit_with_event(move |tx| {
        tx.execute(
          "INSERT INTO orders (order_id, status, currency, total_amount, created_at, updated_at)
           VALUES (?1, 'created', ?2, ?3, ?4, ?4)",
          rusqlite::params![order.order_id, order.currency, order.total_amount, now],
        )?;
        let mut stmt = tx.prepare(
          "INSERT INTO order_items (order_id, line_no, sku, qty, unit_price)
           VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (line_no, item) in order.items.iter().enumerate() {
          stmt.execute(rusqlite::params![
            order.order_id,
            line_no as i64,
            item.sku,
            item.qty,
            item.unit_price,
          ])?;
        }
        Ok(((), new))
      })
      .await?;

    tracing::debug!(order_id = %record.aggregate_id, "order created");
    Ok(record)
  }

  /// Move a `created` order to `paid` or `canceled` and capture the matching
  /// event. Any other transition is rejected and nothing is written.
  pub async fn transition_order(
    &self,
    order_id: &str,
    to: OrderStatus,
  ) -> Result<OutboxRecord> {
    let order_ref = OrderRef { order_id: order_id.to_owned() };
    let event = match to {
      OrderStatus::Paid => OrderEvent::Paid(order_ref),
      OrderStatus::Canceled => OrderEvent::Canceled(order_ref),
      OrderStatus::Created => {
        return Err(Error::InvalidTransition {
          order_id: order_id.to_owned(),
          from:     "?".to_owned(),
          to:       to.as_str(),
        });
      }
    };
    let new = NewOutboxRecord::for_order(order_id, &event)?;
    let order_id = order_id.to_owned();
    let now = encode_dt(Utc::now());

    let outcome = self
      .conn()
      .call(move |conn| {
        // Read-then-write: take the write lock before the read.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
          .query_row(
            "SELECT status FROM orders WHERE order_id = ?1",
            rusqlite::params![order_id],
            |row| row.get(0),
          )
          .optional()?;

        let Some(current) = current else {
          return Ok(Err(Error::OrderNotFound(order_id)));
        };
        if current != OrderStatus::Created.as_str() {
          return Ok(Err(Error::InvalidTransition { order_id, from: current, to: to.as_str() }));
        }

        tx.execute(
          "UPDATE orders SET status = ?1, updated_at = ?2 WHERE order_id = ?3",
          rusqlite::params![to.as_str(), now, order_id],
        )?;
        let record = append_event_in(&tx, new)?;
        tx.commit()?;
        Ok(Ok(record))
      })
      .await?;

    outcome
  }

  pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
    let order_id = order_id.to_owned();

    type Header = (String, String, Option<String>, Option<i64>, String, String);
    let found: Option<(Header, Vec<LineItem>)> = self
      .conn()
      .call(move |conn| {
        let header: Option<Header> = conn
          .query_row(
            "SELECT order_id, status, currency, total_amount, created_at, updated_at
             FROM orders WHERE order_id = ?1",
            rusqlite::params![order_id],
            |row| {
              Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
              ))
            },
          )
          .optional()?;
        let Some(header) = header else { return Ok(None) };

        let mut stmt = conn.prepare(
          "SELECT sku, qty, unit_price FROM order_items
           WHERE order_id = ?1 ORDER BY line_no",
        )?;
        let items = stmt
          .query_map(rusqlite::params![order_id], |row| {
            Ok(LineItem { sku: row.get(0)?, qty: row.get(1)?, unit_price: row.get(2)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some((header, items)))
      })
      .await?;

    let Some(((order_id, status, currency, total_amount, created_at, updated_at), items)) =
      found
    else {
      return Ok(None);
    };

    Ok(Some(Order {
      status: OrderStatus::parse(&status).ok_or(Error::InvalidStatus(status))?,
      order_id,
      currency,
      total_amount,
      items,
      created_at: decode_dt(&created_at)?,
      updated_at: decode_dt(&updated_at)?,
    }))
  }
}
