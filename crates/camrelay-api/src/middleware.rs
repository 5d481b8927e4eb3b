//! Middleware: token extraction and security headers.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use camrelay_common::error::ApiError;
use std::sync::Arc;

use crate::AppState;

/// Cookie carrying the session token for browser clients.
pub const AUTH_COOKIE: &str = "jwt";

/// Authenticated operator, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
}

/// Token from `Authorization: Bearer <token>`, falling back to the `jwt` cookie.
pub fn extract_token(headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .or_else(|| jar.get(AUTH_COOKIE).map(|c| c.value().to_owned()))
}

/// Reject requests without a valid session token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), &jar).ok_or(ApiError::Unauthorized)?;
    let claims = state.auth.verify_token(&token)?;

    request.extensions_mut().insert(AuthContext {
        username: claims.sub,
    });

    Ok(next.run(request).await)
}

// ── Security headers ──────────────────────────────────────────────────────────

/// Add security headers to every HTTP response.
///
/// The viewer page needs camera/microphone for publishing and WebSocket
/// access back to this origin, so the policies allow exactly that.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let h = response.headers_mut();

    macro_rules! set {
        ($name:expr, $val:expr) => {
            if let Ok(v) = $val.parse::<axum::http::HeaderValue>() {
                h.insert($name, v);
            }
        };
    }

    set!(
        axum::http::header::HeaderName::from_static("x-content-type-options"),
        "nosniff"
    );
    set!(
        axum::http::header::HeaderName::from_static("x-frame-options"),
        "DENY"
    );
    set!(
        axum::http::header::HeaderName::from_static("referrer-policy"),
        "strict-origin-when-cross-origin"
    );
    set!(
        axum::http::header::HeaderName::from_static("permissions-policy"),
        "camera=(self), microphone=(self), geolocation=()"
    );
    set!(
        axum::http::header::HeaderName::from_static("content-security-policy"),
        "default-src 'self'; \
         script-src 'self'; \
         style-src 'self' 'unsafe-inline'; \
         connect-src 'self' ws: wss:; \
         media-src 'self' blob:; \
         frame-ancestors 'none'"
    );

    response
}
