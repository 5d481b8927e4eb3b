//! The receiver endpoint: a browser publishes media to us over WebRTC.

use crate::endpoint::{
    EndpointStats, FrameCallback, MediaEndpoint, MediaReceiver, StateCallback,
};
use crate::error::RelayResult;
use crate::session::{ConnectionState, Direction, SessionFactory};
use crate::signaling::{SignalingChannel, SignalingConnection};
use async_trait::async_trait;
use std::sync::Arc;

/// Accepts one publishing peer at a time and fires its callbacks for every
/// frame the peer sends.
pub struct SignalingReceiver {
    channel: SignalingChannel,
}

impl SignalingReceiver {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            channel: SignalingChannel::new(Direction::Inbound, factory),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state()
    }
}

#[async_trait]
impl MediaEndpoint for SignalingReceiver {
    async fn start(&self) -> RelayResult<()> {
        // Nothing to run until a publisher connects.
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    fn stats(&self) -> EndpointStats {
        self.channel.stats()
    }

    async fn handle_signaling_connection(&self, conn: SignalingConnection) -> RelayResult<()> {
        self.channel.handle_connection(conn).await
    }

    async fn close(&self) -> RelayResult<()> {
        tracing::info!("Closing receiver");
        self.channel.close().await
    }
}

impl MediaReceiver for SignalingReceiver {
    fn assign_video_callback(&self, callback: FrameCallback) {
        self.channel.callbacks().set_video(callback);
    }

    fn assign_audio_callback(&self, callback: FrameCallback) {
        self.channel.callbacks().set_audio(callback);
    }

    fn assign_connected_callback(&self, callback: StateCallback) {
        self.channel.callbacks().set_connected(callback);
    }

    fn assign_disconnected_callback(&self, callback: StateCallback) {
        self.channel.callbacks().set_disconnected(callback);
    }
}
