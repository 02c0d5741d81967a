use axum::http::{header, HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::warn;

use super::auth::API_KEY_HEADER;

/// CORS for the web frontend. An empty origin list means permissive (development).
pub fn create_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️ Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    if allowed_origins.is_empty() {
        return CorsLayer::very_permissive();
    }

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            API_KEY_HEADER,
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(60 * 60)) // 1 hour
}
