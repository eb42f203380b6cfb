use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::dto::event_dto::{LeadFormSubmit, PuppyReservation, WhatsAppClick};
use crate::dto::webhook_dto::WebhookMetadata;
use crate::error::Result;
use crate::AppState;

fn request_metadata(headers: &HeaderMap) -> WebhookMetadata {
    let header = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    WebhookMetadata {
        user_agent: header(axum::http::header::USER_AGENT),
        referrer: header(axum::http::header::REFERER),
        ..WebhookMetadata::default()
    }
}

fn queued() -> impl IntoResponse {
    (StatusCode::ACCEPTED, Json(json!({ "queued": true })))
}

#[utoipa::path(
    post,
    path = "/api/events/lead",
    responses(
        (status = 202, description = "Lead event queued for webhook delivery"),
        (status = 400, description = "Invalid payload"),
        (status = 429, description = "Rate limit exceeded")
    )
)]
#[axum::debug_handler]
pub async fn submit_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LeadFormSubmit>,
) -> Result<impl IntoResponse> {
    state
        .notification_service
        .notify_lead_form_submit(payload, request_metadata(&headers))?;
    Ok(queued())
}

#[utoipa::path(
    post,
    path = "/api/events/reservation",
    responses(
        (status = 202, description = "Reservation event queued for webhook delivery"),
        (status = 400, description = "Invalid payload"),
        (status = 429, description = "Rate limit exceeded")
    )
)]
#[axum::debug_handler]
pub async fn submit_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PuppyReservation>,
) -> Result<impl IntoResponse> {
    state
        .notification_service
        .notify_puppy_reservation(payload, request_metadata(&headers))?;
    Ok(queued())
}

#[utoipa::path(
    post,
    path = "/api/events/whatsapp-click",
    responses(
        (status = 202, description = "Click event queued for webhook delivery"),
        (status = 400, description = "Invalid payload"),
        (status = 429, description = "Rate limit exceeded")
    )
)]
#[axum::debug_handler]
pub async fn submit_whatsapp_click(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WhatsAppClick>,
) -> Result<impl IntoResponse> {
    state
        .notification_service
        .notify_whatsapp_click(payload, request_metadata(&headers))?;
    Ok(queued())
}
