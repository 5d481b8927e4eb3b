//! Endpoint capability traits and the callback table receivers fire into.

use crate::error::RelayResult;
use crate::frame::{Frame, FrameKind};
use crate::signaling::SignalingConnection;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-kind frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    /// Frames handed to this endpoint by its producer.
    pub received: u64,
    /// Frames accepted into an ingestion queue.
    pub queued: u64,
    /// Frames rejected because the queue was full.
    pub dropped: u64,
    /// Frames written to the outbound session.
    pub written: u64,
    /// Frames dequeued while no session was connected, or whose write failed.
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub video: FrameCounters,
    pub audio: FrameCounters,
}

impl EndpointStats {
    pub fn kind_mut(&mut self, kind: FrameKind) -> &mut FrameCounters {
        match kind {
            FrameKind::Video => &mut self.video,
            FrameKind::Audio => &mut self.audio,
        }
    }

    pub fn kind(&self, kind: FrameKind) -> &FrameCounters {
        match kind {
            FrameKind::Video => &self.video,
            FrameKind::Audio => &self.audio,
        }
    }
}

/// Surface shared by every endpoint variant.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Start background work (pacing loops, capture process). Idempotent.
    async fn start(&self) -> RelayResult<()>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> EndpointStats;

    /// Whether [`MediaEndpoint::handle_signaling_connection`] may be called.
    /// Routers must check this before exposing a signaling route.
    fn accepts_signaling(&self) -> bool {
        true
    }

    /// Serve one signaling connection until it closes.
    async fn handle_signaling_connection(&self, conn: SignalingConnection) -> RelayResult<()>;

    /// Tear the endpoint down. Subsequent calls are no-ops.
    async fn close(&self) -> RelayResult<()>;
}

/// An endpoint that produces frames.
pub trait MediaReceiver: MediaEndpoint {
    fn assign_video_callback(&self, callback: FrameCallback);
    fn assign_audio_callback(&self, callback: FrameCallback);
    fn assign_connected_callback(&self, callback: StateCallback);
    fn assign_disconnected_callback(&self, callback: StateCallback);
}

/// An endpoint that consumes frames.
pub trait MediaSender: MediaEndpoint {
    /// Enqueue a video frame without blocking; dropped when the queue is full.
    fn send_video_frame(&self, frame: Frame);
    /// Enqueue an audio frame without blocking; dropped when the queue is full.
    fn send_audio_frame(&self, frame: Frame);
}

/// Callback table owned by a receiver.
///
/// Each fire clones the callback out of its slot and releases the slot lock
/// before invoking it, so a callback may replace any slot.
#[derive(Default)]
pub struct Callbacks {
    video: RwLock<Option<FrameCallback>>,
    audio: RwLock<Option<FrameCallback>>,
    connected: RwLock<Option<StateCallback>>,
    disconnected: RwLock<Option<StateCallback>>,
}

impl Callbacks {
    pub fn set_video(&self, callback: FrameCallback) {
        *self.video.write() = Some(callback);
    }

    pub fn set_audio(&self, callback: FrameCallback) {
        *self.audio.write() = Some(callback);
    }

    pub fn set_connected(&self, callback: StateCallback) {
        *self.connected.write() = Some(callback);
    }

    pub fn set_disconnected(&self, callback: StateCallback) {
        *self.disconnected.write() = Some(callback);
    }

    pub fn frame(&self, frame: Frame) {
        let callback = match frame.kind {
            FrameKind::Video => self.video.read().clone(),
            FrameKind::Audio => self.audio.read().clone(),
        };
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    pub fn connected(&self) {
        let callback = self.connected.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn disconnected(&self) {
        let callback = self.disconnected.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}
