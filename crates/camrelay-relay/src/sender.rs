//! The sender endpoint: buffers relayed frames and paces them onto a
//! viewer's WebRTC session.
//!
//! Ingestion never blocks the producer. Each kind has its own bounded queue;
//! when it is full the incoming frame is dropped and the queue keeps its
//! older contents. A pacing task per kind dequeues at most one frame per
//! tick at the kind's nominal cadence.

use crate::endpoint::{EndpointStats, MediaEndpoint, MediaSender};
use crate::error::RelayResult;
use crate::frame::{Frame, FrameKind};
use crate::session::{ConnectionState, Direction, SessionFactory};
use crate::signaling::{SignalingChannel, SignalingConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Capacity of each per-kind ingestion queue.
pub const QUEUE_CAPACITY: usize = 100;

struct Queues {
    video: mpsc::Receiver<Frame>,
    audio: mpsc::Receiver<Frame>,
}

pub struct SignalingSender {
    channel: SignalingChannel,
    video_tx: mpsc::Sender<Frame>,
    audio_tx: mpsc::Sender<Frame>,
    /// Queue receivers until `start` hands them to the pacing tasks.
    pending: Mutex<Option<Queues>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingSender {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let (video_tx, video_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            channel: SignalingChannel::new(Direction::Outbound, factory),
            video_tx,
            audio_tx,
            pending: Mutex::new(Some(Queues {
                video: video_rx,
                audio: audio_rx,
            })),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state()
    }

    fn enqueue(&self, kind: FrameKind, frame: Frame) {
        let tx = match kind {
            FrameKind::Video => &self.video_tx,
            FrameKind::Audio => &self.audio_tx,
        };
        let accepted = match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(kind = %kind, "Ingestion queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(kind = %kind, "Sender closed, dropping frame");
                false
            }
        };
        self.channel.record(kind, |c| {
            c.received += 1;
            if accepted {
                c.queued += 1;
            } else {
                c.dropped += 1;
            }
        });
    }

    #[cfg(test)]
    fn drain_pending(&self, kind: FrameKind) -> Vec<Frame> {
        let mut pending = self.pending.lock();
        let Some(queues) = pending.as_mut() else {
            return Vec::new();
        };
        let queue = match kind {
            FrameKind::Video => &mut queues.video,
            FrameKind::Audio => &mut queues.audio,
        };
        let mut frames = Vec::new();
        while let Ok(frame) = queue.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Dequeue one frame per tick and write it to the connected session.
async fn pace(
    kind: FrameKind,
    mut queue: mpsc::Receiver<Frame>,
    channel: SignalingChannel,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(kind.nominal_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = match queue.try_recv() {
            Ok(frame) => frame,
            Err(TryRecvError::Empty) => continue,
            Err(TryRecvError::Disconnected) => break,
        };

        match channel.connected_session() {
            Some(session) => match session.write_frame(frame).await {
                Ok(()) => channel.record(kind, |c| c.written += 1),
                Err(e) => {
                    channel.record(kind, |c| c.discarded += 1);
                    tracing::warn!(kind = %kind, error = %e, "Failed to write frame");
                }
            },
            None => channel.record(kind, |c| c.discarded += 1),
        }
    }

    tracing::debug!(kind = %kind, "Pacing loop stopped");
}

#[async_trait]
impl MediaEndpoint for SignalingSender {
    async fn start(&self) -> RelayResult<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let Some(queues) = self.pending.lock().take() else {
            return Ok(());
        };

        let video = tokio::spawn(pace(
            FrameKind::Video,
            queues.video,
            self.channel.clone(),
            self.cancel.clone(),
        ));
        let audio = tokio::spawn(pace(
            FrameKind::Audio,
            queues.audio,
            self.channel.clone(),
            self.cancel.clone(),
        ));
        self.tasks.lock().extend([video, audio]);

        tracing::info!("Sender pacing started");
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
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Pacing task ended abnormally");
            }
        }
        self.pending.lock().take();

        tracing::info!("Closing sender");
        self.channel.close().await
    }
}

impl MediaSender for SignalingSender {
    fn send_video_frame(&self, frame: Frame) {
        self.enqueue(FrameKind::Video, frame);
    }

    fn send_audio_frame(&self, frame: Frame) {
        self.enqueue(FrameKind::Audio, frame);
    }
}
