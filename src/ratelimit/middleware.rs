//! Rate limiting middleware for the shared HTTP path.
//!
//! The limiting key is derived per request by a pluggable extractor. The
//! default keys on client IP, preferring the leftmost `X-Forwarded-For`
//! entry, then `X-Real-IP`, then the transport remote address. Denied
//! requests get a 429 with `X-RateLimit-Remaining: 0`; admitted requests
//! carry the remaining quota in the same header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::RateLimiter;

/// Derives the limiting key for a request.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// State handed to [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<dyn RateLimiter>,
    pub key_fn: KeyFn,
}

impl RateLimitState {
    /// Limit by client IP.
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        RateLimitState {
            limiter,
            key_fn: Arc::new(client_ip_key),
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }
}

/// Default key extractor: `ip:<client address>`.
pub fn client_ip_key(request: &Request<Body>) -> String {
    let headers = request.headers();

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        // Leftmost entry is the original client.
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return format!("ip:{first}");
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return format!("ip:{real_ip}");
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// Axum middleware enforcing the configured quota before dispatch.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = (state.key_fn)(&request);

    let allowed = match state.limiter.allow(&key).await {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(key = %key, error = %e, "rate limiter backend error");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "message": "rate limiter error",
                })),
            )
                .into_response();
        }
    };

    if !allowed {
        warn!(key = %key, "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "message": "rate limit exceeded",
            })),
        )
            .into_response();
        response
            .headers_mut()
            .insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        return response;
    }

    let remaining = state.limiter.remaining(&key).await.unwrap_or(0);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryRateLimiter;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn request_with_headers(pairs: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn key_prefers_forwarded_for() {
        let request =
            request_with_headers(&[("x-forwarded-for", "203.0.113.50, 70.41.3.18")]);
        assert_eq!(client_ip_key(&request), "ip:203.0.113.50");
    }

    #[test]
    fn key_falls_back_to_real_ip() {
        let request = request_with_headers(&[("x-real-ip", "203.0.113.100")]);
        assert_eq!(client_ip_key(&request), "ip:203.0.113.100");
    }

    #[test]
    fn key_falls_back_to_remote_addr() {
        let mut request = request_with_headers(&[]);
        request.extensions_mut().insert(ConnectInfo(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            4444,
        )));
        assert_eq!(client_ip_key(&request), "ip:10.1.2.3");
    }

    #[test]
    fn key_without_any_source_is_stable() {
        let request = request_with_headers(&[]);
        assert_eq!(client_ip_key(&request), "ip:unknown");
    }

    fn limited_app(limit: usize) -> Router {
        let limiter = Arc::new(MemoryRateLimiter::new(limit, Duration::from_secs(60)));
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(
                RateLimitState::new(limiter),
                rate_limit_middleware,
            ))
    }

    #[tokio::test]
    async fn middleware_denies_over_quota() {
        let app = limited_app(2);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request_with_headers(&[("x-real-ip", "1.2.3.4")]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(request_with_headers(&[("x-real-ip", "1.2.3.4")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn middleware_reports_remaining_quota() {
        let app = limited_app(5);
        let response = app
            .oneshot(request_with_headers(&[("x-real-ip", "4.3.2.1")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "4"
        );
    }

    #[tokio::test]
    async fn middleware_separates_clients() {
        let app = limited_app(1);

        let ok = app
            .clone()
            .oneshot(request_with_headers(&[("x-real-ip", "1.1.1.1")]))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let denied = app
            .clone()
            .oneshot(request_with_headers(&[("x-real-ip", "1.1.1.1")]))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app
            .oneshot(request_with_headers(&[("x-real-ip", "2.2.2.2")]))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }
}
