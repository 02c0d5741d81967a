use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use http::{header, HeaderMap, HeaderName};
use tracing::warn;

use crate::api::AppState;
use crate::error::AppError;

pub const CRON_KEY_HEADER: HeaderName = HeaderName::from_static("x-cron-key");
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Shared secrets guarding the trigger and admin routes
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub cron_secret: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<set>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

/// True if either the bearer token or the custom header equals `secret`
fn presents_secret(headers: &HeaderMap, custom: &HeaderName, secret: &str) -> bool {
    bearer_token(headers) == Some(secret) || header_str(headers, custom) == Some(secret)
}

impl AuthConfig {
    /// The trigger is closed when no secret is configured
    pub fn cron_authorized(&self, headers: &HeaderMap) -> bool {
        match self.cron_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                presents_secret(headers, &CRON_KEY_HEADER, secret)
            }
            _ => {
                warn!("⚠️ CRON_SECRET_KEY is not set, rejecting trigger");
                false
            }
        }
    }

    /// Admin routes are open when no key is configured (development)
    pub fn admin_authorized(&self, headers: &HeaderMap) -> bool {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => presents_secret(headers, &API_KEY_HEADER, key),
            _ => {
                warn!("⚠️ API_KEY is not set, allowing admin request");
                true
            }
        }
    }

    /// Manual settlement spends operator gas, so it needs a key even in development
    pub fn settlement_authorized(&self, headers: &HeaderMap) -> bool {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => presents_secret(headers, &API_KEY_HEADER, key),
            _ => {
                warn!("⚠️ API_KEY is not set, rejecting manual settlement");
                false
            }
        }
    }
}

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.auth.admin_authorized(req.headers()) {
        warn!("🔒 Rejected admin request to {}", req.uri().path());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

pub async fn require_settlement_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.auth.settlement_authorized(req.headers()) {
        warn!("🔒 Rejected settlement request to {}", req.uri().path());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}
