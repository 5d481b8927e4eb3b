//! Authentication routes: login, logout, token validation.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};
use camrelay_common::{error::ApiResult, validation::validate_request};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::{
    AppState,
    middleware::{AUTH_COOKIE, extract_token},
};

/// Auth router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/validate", post(validate))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,

    #[validate(length(min = 1, max = 128))]
    pub password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    message: &'static str,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    token_valid: bool,
}

/// POST /auth/login
///
/// Check credentials against the configured accounts. Returns the token in
/// the body and sets it as an HTTP-only cookie for the viewer page.
async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<LoginResponse>)> {
    validate_request(&body)?;

    if let Err(e) = state.auth.authorize_user(&body.username, &body.password) {
        tracing::warn!(username = %body.username, "Failed login attempt");
        return Err(e);
    }
    let token = state.auth.issue_token(&body.username)?;

    tracing::info!(username = %body.username, "Operator logged in");

    let cookie = Cookie::build((AUTH_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            token,
            message: "Login successful",
        }),
    ))
}

/// POST /auth/logout
async fn logout(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    (
        jar.remove(Cookie::build(AUTH_COOKIE).path("/")),
        Json(MessageResponse {
            message: "Logged out",
        }),
    )
}

/// POST /auth/validate
///
/// Reports whether the presented token is currently valid.
async fn validate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> (StatusCode, Json<ValidateResponse>) {
    let valid = extract_token(&headers, &jar)
        .is_some_and(|token| state.auth.verify_token(&token).is_ok());

    let status = if valid {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    (status, Json(ValidateResponse { token_valid: valid }))
}
