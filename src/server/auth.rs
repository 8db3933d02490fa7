//! Bearer-token authentication for the management surface.
//!
//! When a token is configured, every management request must carry
//! `Authorization: Bearer <token>`; comparison is timing-safe. With no
//! token configured the middleware passes everything through, which keeps
//! local development friction-free.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

/// Management-surface auth settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Expected bearer token; `None` disables the check.
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn with_token(token: impl Into<String>) -> Self {
        AuthConfig {
            token: Some(token.into()),
        }
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Extract the bearer token from an `Authorization` header value.
fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            (!token.is_empty()).then_some(token)
        }
        _ => None,
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}

/// Axum middleware enforcing the configured bearer token.
pub async fn bearer_auth_middleware(
    State(config): State<AuthConfig>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = config.token.as_deref() else {
        return next.run(request).await;
    };

    let Some(auth_header) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        debug!("management request without authorization header");
        return unauthorized("missing authorization header");
    };

    let Some(token) = bearer_token(auth_header) else {
        return unauthorized("invalid authorization header format");
    };

    if !timing_safe_eq(token, expected) {
        debug!("management request with mismatched token");
        return unauthorized("invalid token");
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use tower::util::ServiceExt;

    #[test]
    fn timing_safe_eq_basics() {
        assert!(timing_safe_eq("secret", "secret"));
        assert!(!timing_safe_eq("secret", "secreT"));
        assert!(!timing_safe_eq("secret", "secret2"));
        assert!(!timing_safe_eq("", "x"));
        assert!(timing_safe_eq("", ""));
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    fn app(config: AuthConfig) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(config, bearer_auth_middleware))
    }

    async fn status_with_header(app: Router, auth: Option<&str>) -> StatusCode {
        let mut builder = Request::builder().uri("/");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn no_token_configured_passes_everything() {
        let app = app(AuthConfig::default());
        assert_eq!(status_with_header(app, None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let app = app(AuthConfig::with_token("s3cret"));
        assert_eq!(
            status_with_header(app, None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let app = app(AuthConfig::with_token("s3cret"));
        assert_eq!(
            status_with_header(app, Some("Bearer nope")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn correct_token_passes() {
        let app = app(AuthConfig::with_token("s3cret"));
        assert_eq!(
            status_with_header(app, Some("Bearer s3cret")).await,
            StatusCode::OK
        );
    }
}
