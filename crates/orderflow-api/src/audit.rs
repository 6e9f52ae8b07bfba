//! Handler for `GET /orders/{order_id}/events`.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use orderflow_core::projection::{AuditRecord, ProjectionStore};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditResponse {
  pub items: Vec<AuditRecord>,
}

/// Audit trail for one order, oldest first. Unknown orders yield an empty
/// list.
pub async fn list_for_order<S>(
  State(store): State<Arc<S>>,
  Path(order_id): Path<String>,
) -> Result<Json<AuditResponse>, ApiError>
where
  S: ProjectionStore,
{
  let items = store
    .audit_for_order(&order_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(AuditResponse { items }))
}
