//! Optional process-wide admission limit in front of the run API.
//!
//! Off by default: per-caller quotas belong to the gateway in front of the
//! orchestrator. When enabled, every request draws from one shared bucket
//! and a refused caller is told when the next token lands.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::AppState;

#[derive(Debug)]
struct Bucket {
    refilled_at: Instant,
    tokens: f64,
}

/// Token bucket refilled at `per_second`, holding at most `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    bucket: Mutex<Bucket>,
    per_second: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(per_second: f64, capacity: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                refilled_at: Instant::now(),
                tokens: capacity,
            }),
            per_second,
            capacity,
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if self.per_second <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second))
    }
}

fn retry_after(wait: Duration) -> HeaderValue {
    let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
    HeaderValue::from(secs.max(1))
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.resilience.rate_limit_enabled
        && let Err(wait) = state.rate_limiter.try_acquire()
    {
        tracing::warn!(
            path = %req.uri().path(),
            retry_after_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "Admission limit reached"
        );
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after(wait))],
        )
            .into_response();
    }
    next.run(req).await
}
