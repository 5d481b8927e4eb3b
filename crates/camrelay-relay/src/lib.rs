//! # camrelay-relay
//!
//! Relay engine for camrelay: forwards a live stream from one producing
//! endpoint to one viewing endpoint over WebRTC.
//!
//! Architecture:
//! - A **receiver** produces frames: either a browser publishing over WebRTC
//!   ([`SignalingReceiver`]) or a local camera via ffmpeg ([`CaptureSource`])
//! - A **sender** ([`SignalingSender`]) buffers frames in bounded queues and
//!   paces them onto the viewer's session at the media's natural cadence
//! - The **relay** ([`Relay`]) wires the two through receiver callbacks and
//!   only forwards while both sides are up
//! - Each endpoint negotiates through one [`SignalingChannel`] (JSON
//!   offer/answer/ice-candidate over any text transport)
//! - WebRTC itself (ICE, DTLS, SRTP) is `str0m`, behind the
//!   [`MediaSession`] trait

pub mod capture;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod relay;
pub mod rtc;
pub mod sender;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capture::{CaptureOptions, CaptureSource};
pub use endpoint::{EndpointStats, FrameCounters, MediaEndpoint, MediaReceiver, MediaSender};
pub use error::{CaptureError, RelayError, RelayResult, SessionError, SignalingError};
pub use frame::{Codec, Frame, FrameKind};
pub use receiver::SignalingReceiver;
pub use relay::{Relay, RelayStats, RelayStatus};
pub use rtc::RtcSessionFactory;
pub use sender::SignalingSender;
pub use session::{ConnectionState, Direction, MediaSession, SessionFactory};
pub use signaling::{SignalMessage, SignalingChannel, SignalingConnection};
