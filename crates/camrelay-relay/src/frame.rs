//! Media frames moved from a receiver to a sender.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nominal duration of one video frame (~30 fps).
pub const VIDEO_FRAME_DURATION: Duration = Duration::from_millis(33);
/// Nominal duration of one Opus audio packet.
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Video,
    Audio,
}

impl FrameKind {
    /// Natural cadence of this media kind; also the sender's pacing tick.
    pub fn nominal_duration(self) -> Duration {
        match self {
            FrameKind::Video => VIDEO_FRAME_DURATION,
            FrameKind::Audio => AUDIO_FRAME_DURATION,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Video => f.write_str("video"),
            FrameKind::Audio => f.write_str("audio"),
        }
    }
}

/// Payload encoding. Capture always produces VP8; relayed frames keep
/// whatever the publisher negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
    Av1,
    Opus,
}

impl Codec {
    pub fn kind(self) -> FrameKind {
        match self {
            Codec::Opus => FrameKind::Audio,
            Codec::Vp8 | Codec::Vp9 | Codec::H264 | Codec::Av1 => FrameKind::Video,
        }
    }

    /// Codec assumed when a producer does not say otherwise.
    pub fn default_for(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Video => Codec::Vp8,
            FrameKind::Audio => Codec::Opus,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
            Codec::H264 => "h264",
            Codec::Av1 => "av1",
            Codec::Opus => "opus",
        })
    }
}

/// One encoded unit of audio or video. Immutable once built; cloning only
/// bumps the payload's reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub codec: Codec,
    pub payload: Bytes,
    pub duration: Duration,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            kind,
            codec: Codec::default_for(kind),
            payload: payload.into(),
            duration,
        }
    }

    /// Override the payload encoding; the kind follows the codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.kind = codec.kind();
        self.codec = codec;
        self
    }

    pub fn video(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Video, payload, VIDEO_FRAME_DURATION)
    }

    pub fn audio(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Audio, payload, AUDIO_FRAME_DURATION)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
