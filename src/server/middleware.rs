//! Authentication and rate limiting.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use governor::{Quota, RateLimiter};
use lru::LruCache;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use super::handlers::error_response;
use super::ServerState;

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

pub type IpRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub type RateLimiterCache = Mutex<LruCache<IpAddr, Arc<IpRateLimiter>>>;

/// Maximum number of per-IP rate limiter entries to keep in the LRU cache.
const MAX_RATE_LIMITER_ENTRIES: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();

/// IPv6 addresses are aggregated to their /64 so one host cannot rotate
/// through its prefix.
fn limiter_key(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            IpAddr::V6(Ipv6Addr::new(seg[0], seg[1], seg[2], seg[3], 0, 0, 0, 0))
        }
    }
}

/// Get or create the rate limiter for `ip`. `None` when limiting is off.
pub async fn get_rate_limiter(
    rate_limit_rpm: u32,
    rate_limiters: &RateLimiterCache,
    ip: IpAddr,
) -> Option<Arc<IpRateLimiter>> {
    let rpm = NonZeroU32::new(rate_limit_rpm)?;
    let key = limiter_key(ip);

    let mut limiters = rate_limiters.lock().await;
    if let Some(limiter) = limiters.get(&key) {
        return Some(Arc::clone(limiter));
    }

    let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
    limiters.push(key, Arc::clone(&limiter));
    Some(limiter)
}

pub fn new_rate_limiter_cache() -> RateLimiterCache {
    Mutex::new(LruCache::new(MAX_RATE_LIMITER_ENTRIES))
}

/// Rejects requests over the per-IP quota with 429.
///
/// Requests without connection info are not limited.
pub async fn rate_limit_middleware(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = ip {
        if let Some(limiter) =
            get_rate_limiter(state.config.rate_limit_rpm, &state.rate_limiters, ip).await
        {
            if limiter.check().is_err() {
                state.usage.rate_limited.fetch_add(1, Ordering::Relaxed);
                state.usage.record_error();
                tracing::debug!(ip = %ip, "rate limit exceeded");
                return error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    format!(
                        "Rate limit exceeded. Maximum {} requests per minute.",
                        state.config.rate_limit_rpm
                    ),
                );
            }
        }
    }

    next.run(request).await
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

/// Bearer token authentication for `/api/v1/*`.
///
/// With no `api_key` configured every request passes. Otherwise a missing or
/// wrong token is rejected with 401; tokens are compared in constant time.
pub async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected_key) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let token_matches = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| bool::from(t.trim().as_bytes().ct_eq(expected_key.as_bytes())));

    match token_matches {
        Some(true) => next.run(request).await,
        Some(false) => {
            state.usage.record_error();
            error_response(StatusCode::UNAUTHORIZED, "Invalid API key")
        }
        None => {
            state.usage.record_error();
            error_response(
                StatusCode::UNAUTHORIZED,
                "Missing Authorization header. Use: Authorization: Bearer <api_key>",
            )
        }
    }
}
