//! Shared fixtures for the API integration tests.

#![allow(dead_code)]

use camrelay_api::{AppState, auth, auth::Authorizer, build_router};
use camrelay_relay::testing::{FakeBehavior, FakeSessionFactory};
use camrelay_relay::{
    CaptureOptions, CaptureSource, MediaReceiver, Relay, SignalingReceiver, SignalingSender,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const USERNAME: &str = "operator";
pub const PASSWORD: &str = "correct horse battery";

pub struct Harness {
    pub relay: Arc<Relay>,
    pub factory: Arc<FakeSessionFactory>,
    pub state: AppState,
}

fn authorizer() -> Authorizer {
    let hash = auth::hash_password(PASSWORD).expect("hash");
    Authorizer::new("integration-secret", 3600, [(USERNAME.to_string(), hash)])
}

/// A relay whose receiver and sender negotiate with in-memory sessions.
pub fn signaling_harness() -> Harness {
    let factory = Arc::new(FakeSessionFactory::new(FakeBehavior {
        connect_on_answer: true,
        ..FakeBehavior::default()
    }));
    let receiver = Arc::new(SignalingReceiver::new(factory.clone()));
    build(receiver, factory)
}

/// A relay fed by the camera; never started, so no process is spawned.
pub fn capture_harness() -> Harness {
    let factory = Arc::new(FakeSessionFactory::new(FakeBehavior::default()));
    let receiver = Arc::new(CaptureSource::new(CaptureOptions::default()));
    build(receiver, factory)
}

fn build(receiver: Arc<dyn MediaReceiver>, factory: Arc<FakeSessionFactory>) -> Harness {
    let sender = Arc::new(SignalingSender::new(factory.clone()));
    let relay = Arc::new(Relay::new(receiver, sender));
    let state = AppState::new(relay.clone(), authorizer());
    Harness {
        relay,
        factory,
        state,
    }
}

/// Serve the router on an ephemeral port.
pub async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.expect("serve");
    });
    addr
}
