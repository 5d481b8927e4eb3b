//! # camrelay-api
//!
//! HTTP surface for camrelay: the two signaling WebSockets, relay status and
//! management, operator authentication, and the demo page.

pub mod auth;
pub mod middleware;
pub mod routes;

use auth::Authorizer;
use axum::Router;
use camrelay_relay::{MediaEndpoint, Relay};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub auth: Arc<Authorizer>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, auth: Authorizer) -> Self {
        Self {
            relay,
            auth: Arc::new(auth),
            started_at: Instant::now(),
        }
    }
}

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);
    let receiver_signaling = state.relay.receiver().accepts_signaling();

    let protected = routes::relay::protected_router().route_layer(
        axum::middleware::from_fn_with_state(state.clone(), middleware::auth_middleware),
    );

    Router::new()
        .merge(routes::relay::router(receiver_signaling))
        .merge(protected)
        .merge(routes::auth::router())
        .merge(routes::health::router())
        .merge(routes::ui::router())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
