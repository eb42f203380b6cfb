pub mod events;
pub mod health;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};

use crate::middleware::{
    auth::{require_admin, AdminAuth},
    rate_limit::{new_rps_state, rps_middleware},
};
use crate::AppState;

pub fn router(state: AppState, jwt_secret: &str, public_rps: u32) -> Router {
    let base_routes = Router::new().route("/health", get(health::health));

    let event_api = Router::new()
        .route("/api/events/lead", post(events::submit_lead))
        .route("/api/events/reservation", post(events::submit_reservation))
        .route(
            "/api/events/whatsapp-click",
            post(events::submit_whatsapp_click),
        )
        .layer(axum::middleware::from_fn_with_state(
            new_rps_state(public_rps),
            rps_middleware,
        ));

    let admin_api = Router::new()
        .route("/api/admin/webhooks/:id/test", post(webhook::test_webhook))
        .route(
            "/api/admin/webhooks/:id/deliveries",
            get(webhook::list_deliveries),
        )
        .layer(axum::middleware::from_fn_with_state(
            AdminAuth::new(jwt_secret),
            require_admin,
        ));

    base_routes
        .merge(event_api)
        .merge(admin_api)
        .with_state(state)
}
