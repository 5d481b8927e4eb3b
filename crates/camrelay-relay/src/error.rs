//! Relay engine errors.

/// Failures reported by a media session (the WebRTC peer connection).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] str0m::RtcError),

    #[error("SDP parse error: {0}")]
    Sdp(String),

    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("No remote offer has been applied")]
    NoRemoteDescription,

    #[error("Unexpected {0} description")]
    UnexpectedDescription(&'static str),

    #[error("No negotiated {0} track")]
    NoTrack(crate::frame::FrameKind),

    #[error("Session closed")]
    Closed,
}

/// Failures on the signaling transport (the WebSocket).
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Signaling channel closed")]
    Closed,
}

/// Failures of the camera capture pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to spawn capture process `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture stream IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture process has no stdout pipe")]
    MissingStdout,

    #[error("Invalid IVF frame length {0}")]
    InvalidFrameLength(u32),

    #[error("Camera is already streaming")]
    AlreadyStreaming,
}

/// Top-level error for endpoint and relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Endpoint does not accept signaling connections")]
    SignalingUnsupported,

    #[error("{} endpoint(s) failed to close: {}", .0.len(), join_errors(.0))]
    Close(Vec<RelayError>),
}

fn join_errors(errors: &[RelayError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type RelayResult<T> = Result<T, RelayError>;
