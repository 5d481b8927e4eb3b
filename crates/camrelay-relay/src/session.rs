//! The media session seam.
//!
//! A media session is one WebRTC peer connection. The relay never talks to the
//! transport library directly: it drives a [`MediaSession`] created by a
//! [`SessionFactory`] and observes it through the [`SessionEvent`] channel
//! handed out at creation. The production implementation lives in
//! [`crate::rtc`].

use crate::error::SessionError;
use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the per-session event channel.
pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Which way media flows relative to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The remote peer produces media and we receive it.
    Inbound,
    /// We send media to the remote peer (a viewer).
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States in which media can no longer flow on the session.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, in the shape browsers serialize `RTCIceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u16,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

/// Notifications a session pushes to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A local candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    /// Media received from the remote peer (inbound sessions only).
    Frame(Frame),
}

pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// One peer connection.
///
/// Implementations must emit `StateChanged(Closed)` (or `Failed`) when they
/// shut down and then drop their event sender, so that the owner's event pump
/// terminates.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    /// Write one frame to the outbound track of the frame's kind.
    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError>;

    fn state(&self) -> ConnectionState;

    /// Close the session. Safe to call more than once.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Creates a fresh session for every signaling connection.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        direction: Direction,
    ) -> Result<(Arc<dyn MediaSession>, SessionEvents), SessionError>;
}
