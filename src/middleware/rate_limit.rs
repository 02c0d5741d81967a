use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::ErrorResponse;

/// Process-wide request quota for the public API
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    /// `requests_per_minute` of zero is treated as one
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let burst = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);

        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(burst))),
        }
    }

    pub fn check(&self) -> Result<(), Response> {
        self.limiter.check().map_err(|_| {
            warn!("🚦 Rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse {
                    error: "Rate limit exceeded. Please try again later.".to_string(),
                    error_code: "RATE_LIMITED".to_string(),
                    details: None,
                }),
            )
                .into_response()
        })
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimitLayer>>,
    req: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(req).await,
        Err(response) => response,
    }
}
