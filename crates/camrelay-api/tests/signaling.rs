//! Signaling over real WebSockets.

mod common;

use camrelay_relay::{Frame, MediaEndpoint, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const OFFER: &str = r#"{"type":"offer","sdp":"v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"}"#;

async fn connect(addr: std::net::SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect");
    ws
}

async fn next_signal(ws: &mut Client, wait: Duration) -> Option<SignalMessage> {
    loop {
        let msg = tokio::time::timeout(wait, ws.next()).await.ok()??.ok()?;
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).ok();
        }
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn viewer_offer_gets_exactly_one_answer() {
    let harness = common::signaling_harness();
    let relay = harness.relay.clone();
    let addr = common::serve(harness.state).await;

    let mut viewer = connect(addr, "/ws/sender").await;
    viewer.send(Message::Text(OFFER.into())).await.unwrap();

    let reply = next_signal(&mut viewer, Duration::from_secs(3)).await;
    assert!(matches!(reply, Some(SignalMessage::Answer { ref sdp }) if sdp.starts_with("v=0")));
    assert!(next_signal(&mut viewer, Duration::from_millis(200)).await.is_none());

    wait_until(|| relay.status().sender_connected).await;
    assert!(!relay.status().relay_active);

    viewer.close(None).await.unwrap();
    wait_until(|| !relay.status().sender_connected).await;
}

#[tokio::test]
async fn malformed_messages_keep_the_socket_open() {
    let harness = common::signaling_harness();
    let addr = common::serve(harness.state).await;

    let mut viewer = connect(addr, "/ws/sender").await;
    viewer.send(Message::Text("{not json".into())).await.unwrap();
    viewer
        .send(Message::Text(r#"{"type":"ice-candidate","candidate":{}}"#.into()))
        .await
        .unwrap();
    viewer.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    viewer.send(Message::Text(OFFER.into())).await.unwrap();

    assert!(matches!(
        next_signal(&mut viewer, Duration::from_secs(3)).await,
        Some(SignalMessage::Answer { .. })
    ));
}

#[tokio::test]
async fn published_frames_reach_the_viewer() {
    let harness = common::signaling_harness();
    let relay = harness.relay.clone();
    let factory = harness.factory.clone();
    let addr = common::serve(harness.state).await;
    relay.start().await.unwrap();

    let mut viewer = connect(addr, "/ws/sender").await;
    viewer.send(Message::Text(OFFER.into())).await.unwrap();
    next_signal(&mut viewer, Duration::from_secs(3)).await.expect("viewer answer");
    wait_until(|| relay.sender().is_connected()).await;

    let mut publisher = connect(addr, "/ws/receiver").await;
    publisher.send(Message::Text(OFFER.into())).await.unwrap();
    next_signal(&mut publisher, Duration::from_secs(3)).await.expect("publisher answer");
    wait_until(|| relay.status().relay_active).await;

    let viewer_session = factory.session(0).await;
    let publisher_session = factory.session(1).await;
    publisher_session.push_frame(Frame::video(vec![1, 2, 3]));
    publisher_session.push_frame(Frame::audio(vec![4, 5]));
    wait_until(|| viewer_session.written().len() == 2).await;

    publisher.close(None).await.unwrap();
    wait_until(|| !relay.status().relay_active).await;

    relay.close().await.unwrap();
}

#[tokio::test]
async fn reconnecting_viewer_gets_a_fresh_session() {
    let harness = common::signaling_harness();
    let relay = harness.relay.clone();
    let factory = harness.factory.clone();
    let addr = common::serve(harness.state).await;

    let mut first = connect(addr, "/ws/sender").await;
    first.send(Message::Text(OFFER.into())).await.unwrap();
    next_signal(&mut first, Duration::from_secs(3)).await.expect("first answer");
    first.close(None).await.unwrap();
    wait_until(|| !relay.sender().is_connected()).await;

    let mut second = connect(addr, "/ws/sender").await;
    second.send(Message::Text(OFFER.into())).await.unwrap();
    next_signal(&mut second, Duration::from_secs(3)).await.expect("second answer");
    wait_until(|| relay.sender().is_connected()).await;

    assert_eq!(factory.created(), 2);
}
