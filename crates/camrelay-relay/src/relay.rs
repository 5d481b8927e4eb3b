//! The relay: wires one receiver to one sender.
//!
//! The receiver's callbacks drive everything. Its connected/disconnected
//! transitions flip the relay-active flag, and each frame it produces is
//! forwarded to the sender only while the relay is active and a viewer is
//! connected. Frames that fail the gate are dropped, never retried.

use crate::endpoint::{EndpointStats, MediaReceiver, MediaSender};
use crate::error::{RelayError, RelayResult};
use crate::frame::Frame;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Point-in-time relay state, recomputed on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub relay_active: bool,
    pub receiver_connected: bool,
    pub sender_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub receiver: EndpointStats,
    pub sender: EndpointStats,
}

#[derive(Default)]
struct RelayState {
    active: bool,
    closed: bool,
}

/// The part of the relay the receiver's callbacks hold on to.
struct RelayCore {
    sender: Arc<dyn MediaSender>,
    state: RwLock<RelayState>,
}

impl RelayCore {
    fn is_active(&self) -> bool {
        self.state.read().active
    }

    fn set_active(&self, active: bool) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        if state.active != active {
            state.active = active;
            tracing::info!(active, "Relay state changed");
        }
    }

    fn relay_video_frame(&self, frame: Frame) -> bool {
        if !self.is_active() || !self.sender.is_connected() {
            return false;
        }
        self.sender.send_video_frame(frame);
        true
    }

    fn relay_audio_frame(&self, frame: Frame) -> bool {
        if !self.is_active() || !self.sender.is_connected() {
            return false;
        }
        self.sender.send_audio_frame(frame);
        true
    }
}

pub struct Relay {
    receiver: Arc<dyn MediaReceiver>,
    core: Arc<RelayCore>,
}

impl Relay {
    /// Build a relay and install its callbacks on `receiver`.
    pub fn new(receiver: Arc<dyn MediaReceiver>, sender: Arc<dyn MediaSender>) -> Self {
        let core = Arc::new(RelayCore {
            sender,
            state: RwLock::new(RelayState::default()),
        });

        // Callbacks hold the core weakly so the receiver does not keep the
        // relay alive.
        let weak = Arc::downgrade(&core);
        receiver.assign_video_callback(Arc::new({
            let weak = weak.clone();
            move |frame: Frame| {
                if let Some(core) = weak.upgrade() {
                    core.relay_video_frame(frame);
                }
            }
        }));
        receiver.assign_audio_callback(Arc::new({
            let weak = weak.clone();
            move |frame: Frame| {
                if let Some(core) = weak.upgrade() {
                    core.relay_audio_frame(frame);
                }
            }
        }));
        receiver.assign_connected_callback(Arc::new({
            let weak = weak.clone();
            move || {
                tracing::info!("Receiver connected, relay active");
                if let Some(core) = weak.upgrade() {
                    core.set_active(true);
                }
            }
        }));
        receiver.assign_disconnected_callback(Arc::new(move || {
            tracing::info!("Receiver disconnected, relay inactive");
            if let Some(core) = weak.upgrade() {
                core.set_active(false);
            }
        }));

        Self { receiver, core }
    }

    pub fn receiver(&self) -> &Arc<dyn MediaReceiver> {
        &self.receiver
    }

    pub fn sender(&self) -> &Arc<dyn MediaSender> {
        &self.core.sender
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Forward a video frame if relaying; returns whether it was handed on.
    pub fn relay_video_frame(&self, frame: Frame) -> bool {
        self.core.relay_video_frame(frame)
    }

    /// Forward an audio frame if relaying; returns whether it was handed on.
    pub fn relay_audio_frame(&self, frame: Frame) -> bool {
        self.core.relay_audio_frame(frame)
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            relay_active: self.core.is_active(),
            receiver_connected: self.receiver.is_connected(),
            sender_connected: self.core.sender.is_connected(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            receiver: self.receiver.stats(),
            sender: self.core.sender.stats(),
        }
    }

    /// Start both endpoints. Safe to call repeatedly; no-op once closed.
    pub async fn start(&self) -> RelayResult<()> {
        if self.core.state.read().closed {
            return Ok(());
        }
        self.core.sender.start().await?;
        self.receiver.start().await?;
        tracing::info!("Relay started");
        Ok(())
    }

    /// Close both endpoints, even if one of them fails. Idempotent.
    pub async fn close(&self) -> RelayResult<()> {
        {
            let mut state = self.core.state.write();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.active = false;
        }

        let mut errors = Vec::new();
        if let Err(e) = self.receiver.close().await {
            tracing::error!(error = %e, "Failed to close receiver");
            errors.push(e);
        }
        if let Err(e) = self.core.sender.close().await {
            tracing::error!(error = %e, "Failed to close sender");
            errors.push(e);
        }

        tracing::info!("Relay closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Close(errors))
        }
    }
}
