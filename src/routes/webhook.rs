use axum::{
    extract::{Path, Query, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::dto::webhook_dto::{DeliveryListQuery, DeliveryListResponse};
use crate::error::{Error, Result};
use crate::AppState;

const DEFAULT_DELIVERY_LIMIT: i64 = 50;
const MAX_DELIVERY_LIMIT: i64 = 200;

#[utoipa::path(
    post,
    path = "/api/admin/webhooks/{id}/test",
    params(
        ("id" = String, Path, description = "Webhook ID")
    ),
    responses(
        (status = 200, description = "Test event sent, see `success` for the receiver's verdict"),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Webhook not found")
    )
)]
#[axum::debug_handler]
pub async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let result = state.dispatcher.send_test(id, user_agent).await?;
    Ok((StatusCode::OK, Json(result)))
}

#[utoipa::path(
    get,
    path = "/api/admin/webhooks/{id}/deliveries",
    params(
        ("id" = String, Path, description = "Webhook ID"),
        ("limit" = Option<i64>, Query, description = "Most recent records to return (default 50, max 200)")
    ),
    responses(
        (status = 200, description = "Delivery records, newest first"),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 404, description = "Webhook not found")
    )
)]
#[axum::debug_handler]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveryListQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT);
    if limit < 1 {
        return Err(Error::BadRequest("limit must be positive".to_string()));
    }
    if state.store.find_subscriber(id).await?.is_none() {
        return Err(Error::NotFound("Webhook not found".to_string()));
    }
    let records = state
        .store
        .list_deliveries(id, limit.min(MAX_DELIVERY_LIMIT))
        .await?;
    Ok((StatusCode::OK, Json(DeliveryListResponse::from(records))))
}
