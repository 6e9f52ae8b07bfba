//! Handler for `GET /stats/sku`.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Query, State},
};
use chrono::{DateTime, Utc};
use orderflow_core::{
  event::parse_event_time,
  projection::{ProjectionStore, SkuStat, StatsQuery},
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize, Default)]
pub struct StatsParams {
  pub sku:     Option<String>,
  /// Inclusive lower bound on `window_start`.
  pub from_ts: Option<String>,
  /// Inclusive upper bound on `window_start`.
  pub to_ts:   Option<String>,
  pub limit:   Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
  pub items: Vec<SkuStat>,
}

fn bound(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
  raw
    .filter(|s| !s.is_empty())
    .map(|s| {
      parse_event_time(s)
        .ok_or_else(|| ApiError::BadRequest(format!("{name}: unparseable timestamp {s:?}")))
    })
    .transpose()
}

impl StatsParams {
  fn into_query(self) -> Result<StatsQuery, ApiError> {
    let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
      return Err(ApiError::BadRequest(format!(
        "limit must be between 1 and {MAX_LIMIT}"
      )));
    }
    Ok(StatsQuery {
      from: bound("from_ts", self.from_ts.as_deref())?,
      to: bound("to_ts", self.to_ts.as_deref())?,
      sku: self.sku.filter(|s| !s.is_empty()),
      limit,
    })
  }
}

/// `GET /stats/sku[?sku=...][&from_ts=...][&to_ts=...][&limit=...]`
///
/// Newest window first.
pub async fn list<S>(
  State(store): State<Arc<S>>,
  Query(params): Query<StatsParams>,
) -> Result<Json<StatsResponse>, ApiError>
where
  S: ProjectionStore,
{
  let query = params.into_query()?;
  let items = store.list_stats(&query).await.map_err(ApiError::store)?;
  Ok(Json(StatsResponse { items }))
}
