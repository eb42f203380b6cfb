use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};

/// Storefront pages post events cross-origin; admin calls carry a bearer token.
pub fn storefront_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any)
}
