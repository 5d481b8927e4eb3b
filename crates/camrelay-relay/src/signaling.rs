//! Signaling: WebSocket-based negotiation for one media session.
//!
//! One [`SignalingChannel`] backs each endpoint, parametrized by
//! [`Direction`]. Every accepted connection gets a fresh media session:
//!
//! 1. Client connects (`/ws/receiver` or `/ws/sender`)
//! 2. Client sends an `offer`; we apply it, answer, and send the `answer`
//! 3. Both sides trickle `ice-candidate` messages
//! 4. The session reports `Connected` and media starts flowing
//! 5. The connection ends (client close or transport error) → session closed
//!
//! Media never flows over this channel, only negotiation.
//!
//! Session notifications are drained by a single pump task per session.
//! Every callback fire, including the disconnect raised when a session is
//! replaced, goes through one dispatch lock per endpoint and re-checks the
//! session generation under it. Callbacks for one endpoint therefore never
//! overlap, and a replaced session cannot fire after its replacement's
//! disconnect.

use crate::endpoint::{Callbacks, EndpointStats, FrameCounters};
use crate::error::{RelayError, RelayResult, SignalingError};
use crate::frame::{Frame, FrameKind};
use crate::session::{
    ConnectionState, Direction, IceCandidate, MediaSession, SessionDescription, SessionEvent,
    SessionEvents, SessionFactory,
};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Buffered outbound signaling messages per connection.
const OUTBOUND_CAPACITY: usize = 64;
/// How long teardown waits for a closed session to flush its events.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Signaling messages exchanged with the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

type Outbound = Pin<Box<dyn Sink<String, Error = SignalingError> + Send>>;

/// A bidirectional text channel to one remote peer, decoupled from the
/// transport that carries it.
pub struct SignalingConnection {
    inbound: BoxStream<'static, Result<String, SignalingError>>,
    outbound: Outbound,
}

impl SignalingConnection {
    pub fn new<I, O>(inbound: I, outbound: O) -> Self
    where
        I: Stream<Item = Result<String, SignalingError>> + Send + 'static,
        O: Sink<String, Error = SignalingError> + Send + 'static,
    {
        Self {
            inbound: inbound.boxed(),
            outbound: Box::pin(outbound),
        }
    }
}

/// Which way a connection-state change crossed the connected boundary.
enum Edge {
    Up,
    Down,
}

struct ChannelState {
    connection: ConnectionState,
    connected: bool,
    /// Bumped on every new connection; events from older sessions are ignored.
    generation: u64,
    session: Option<Arc<dyn MediaSession>>,
    stats: EndpointStats,
}

struct ChannelInner {
    state: RwLock<ChannelState>,
    /// Held for the whole of every callback fire. Callbacks must not call
    /// back into the channel.
    dispatch: Mutex<()>,
    callbacks: Callbacks,
    shutdown: CancellationToken,
}

impl ChannelInner {
    fn is_current(&self, generation: u64) -> bool {
        self.state.read().generation == generation
    }

    /// Deliver a frame from session `generation`, unless it has been replaced.
    fn deliver(&self, generation: u64, frame: Frame) {
        let _dispatch = self.dispatch.lock();
        if !self.is_current(generation) {
            return;
        }
        self.record(frame.kind, |c| c.received += 1);
        self.callbacks.frame(frame);
    }

    fn record(&self, kind: FrameKind, update: impl FnOnce(&mut FrameCounters)) {
        update(self.state.write().stats.kind_mut(kind));
    }

    /// Apply a session state change and fire the matching callback, if any.
    fn transition(&self, generation: u64, next: ConnectionState) {
        let _dispatch = self.dispatch.lock();
        let edge = {
            let mut st = self.state.write();
            if st.generation != generation {
                return;
            }
            st.connection = next;
            if !st.connected && next == ConnectionState::Connected {
                st.connected = true;
                Some(Edge::Up)
            } else if st.connected && next.is_down() {
                st.connected = false;
                Some(Edge::Down)
            } else {
                None
            }
        };

        match edge {
            Some(Edge::Up) => self.callbacks.connected(),
            Some(Edge::Down) => self.callbacks.disconnected(),
            None => {}
        }
    }
}

/// Drives one media session per signaling connection.
#[derive(Clone)]
pub struct SignalingChannel {
    direction: Direction,
    factory: Arc<dyn SessionFactory>,
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    pub fn new(direction: Direction, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            direction,
            factory,
            inner: Arc::new(ChannelInner {
                state: RwLock::new(ChannelState {
                    connection: ConnectionState::New,
                    connected: false,
                    generation: 0,
                    session: None,
                    stats: EndpointStats::default(),
                }),
                dispatch: Mutex::new(()),
                callbacks: Callbacks::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.inner.callbacks
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read().connection
    }

    pub fn stats(&self) -> EndpointStats {
        self.inner.state.read().stats
    }

    pub fn record(&self, kind: FrameKind, update: impl FnOnce(&mut FrameCounters)) {
        self.inner.record(kind, update);
    }

    /// The current session, only while it is connected.
    pub fn connected_session(&self) -> Option<Arc<dyn MediaSession>> {
        let st = self.inner.state.read();
        if st.connected {
            st.session.clone()
        } else {
            None
        }
    }

    /// Serve one signaling connection until the peer goes away, a transport
    /// error occurs, or the channel is closed.
    pub async fn handle_connection(&self, conn: SignalingConnection) -> RelayResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SignalingError::Closed.into());
        }

        let connection_id = Uuid::new_v4();
        let SignalingConnection {
            mut inbound,
            outbound,
        } = conn;

        let (session, events) = match self.factory.create(self.direction).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(
                    connection = %connection_id,
                    direction = %self.direction,
                    error = %e,
                    "Failed to create media session"
                );
                return Err(e.into());
            }
        };
        let generation = self.install(session.clone()).await;

        tracing::info!(
            connection = %connection_id,
            direction = %self.direction,
            "Signaling connection established"
        );

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_outbound(outbound, out_rx, connection_id));
        let mut pump = tokio::spawn(pump_events(
            self.inner.clone(),
            self.direction,
            generation,
            events,
            out_tx.clone(),
        ));

        let result = tokio::select! {
            res = self.read_loop(connection_id, session.as_ref(), &mut inbound, &out_tx) => res,
            _ = self.inner.shutdown.cancelled() => Ok(()),
        };

        // Teardown: release the slot, close the session, let the pump drain
        // the final state change, then let the writer flush and close.
        {
            let mut st = self.inner.state.write();
            if st.generation == generation {
                st.session = None;
            }
        }
        if let Err(e) = session.close().await {
            tracing::warn!(connection = %connection_id, error = %e, "Failed to close media session");
        }
        drop(out_tx);
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            tracing::warn!(connection = %connection_id, "Session event pump did not drain, aborting");
            pump.abort();
        }
        // The endpoint goes down with its connection even if the session
        // never reported a terminal state.
        self.inner.transition(generation, ConnectionState::Closed);
        if let Err(e) = writer.await {
            tracing::debug!(connection = %connection_id, error = %e, "Signaling writer task ended abnormally");
        }

        tracing::info!(
            connection = %connection_id,
            direction = %self.direction,
            "Signaling connection closed"
        );
        result
    }

    /// Close the current session and stop accepting connections. Idempotent.
    pub async fn close(&self) -> RelayResult<()> {
        self.inner.shutdown.cancel();
        let session = self.inner.state.write().session.take();
        match session {
            Some(session) => session.close().await.map_err(RelayError::from),
            None => Ok(()),
        }
    }

    /// Make `session` the current one, closing whatever it replaces.
    async fn install(&self, session: Arc<dyn MediaSession>) -> u64 {
        let (generation, previous) = {
            // Waits out any callback the previous session is firing; once the
            // generation moves, that session's later events are dropped.
            let _dispatch = self.inner.dispatch.lock();
            let (generation, previous, was_connected) = {
                let mut st = self.inner.state.write();
                st.generation += 1;
                st.connection = ConnectionState::New;
                let previous = st.session.replace(session);
                let was_connected = std::mem::replace(&mut st.connected, false);
                (st.generation, previous, was_connected)
            };
            if was_connected {
                self.inner.callbacks.disconnected();
            }
            (generation, previous)
        };

        if let Some(previous) = previous {
            tracing::info!(direction = %self.direction, "Replacing previous media session");
            if let Err(e) = previous.close().await {
                tracing::warn!(error = %e, "Failed to close replaced media session");
            }
        }
        generation
    }

    async fn read_loop(
        &self,
        connection_id: Uuid,
        session: &dyn MediaSession,
        inbound: &mut BoxStream<'static, Result<String, SignalingError>>,
        out_tx: &mpsc::Sender<SignalMessage>,
    ) -> RelayResult<()> {
        while let Some(item) = inbound.next().await {
            let text = match item {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection = %connection_id, error = %e, "Signaling read failed");
                    return Err(e.into());
                }
            };

            let message = match serde_json::from_str::<SignalMessage>(&text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        connection = %connection_id,
                        error = %e,
                        "Ignoring malformed signaling message"
                    );
                    continue;
                }
            };

            match message {
                SignalMessage::Offer { sdp } => {
                    let Some(answer) = negotiate(session, sdp, connection_id).await else {
                        continue;
                    };
                    let len = answer.sdp.len();
                    if out_tx.send(SignalMessage::Answer { sdp: answer.sdp }).await.is_err() {
                        tracing::warn!(connection = %connection_id, "Signaling writer gone");
                        return Err(SignalingError::Closed.into());
                    }
                    tracing::debug!(connection = %connection_id, sdp_len = len, "SDP answer sent");
                }
                SignalMessage::IceCandidate { candidate } => {
                    if let Err(e) = session.add_ice_candidate(candidate).await {
                        tracing::warn!(
                            connection = %connection_id,
                            error = %e,
                            "Failed to add ICE candidate"
                        );
                    }
                }
                SignalMessage::Answer { .. } => {
                    tracing::warn!(
                        connection = %connection_id,
                        "Ignoring answer from peer; the relay only answers offers"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Apply a remote offer and produce the local answer.
///
/// Any failing step is logged and leaves the session un-negotiated until the
/// peer sends another offer.
async fn negotiate(
    session: &dyn MediaSession,
    sdp: String,
    connection_id: Uuid,
) -> Option<SessionDescription> {
    if let Err(e) = session
        .set_remote_description(SessionDescription::offer(sdp))
        .await
    {
        tracing::warn!(connection = %connection_id, error = %e, "Failed to set remote description");
        return None;
    }

    let answer = match session.create_answer().await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(connection = %connection_id, error = %e, "Failed to create answer");
            return None;
        }
    };

    if let Err(e) = session.set_local_description(answer.clone()).await {
        tracing::warn!(connection = %connection_id, error = %e, "Failed to set local description");
        return None;
    }

    Some(answer)
}

/// Serialize queued messages onto the transport until every sender is gone
/// or a write fails.
async fn write_outbound(
    mut outbound: Outbound,
    mut rx: mpsc::Receiver<SignalMessage>,
    connection_id: Uuid,
) {
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection = %connection_id, error = %e, "Failed to encode signaling message");
                continue;
            }
        };
        if let Err(e) = outbound.send(text).await {
            tracing::warn!(connection = %connection_id, error = %e, "Signaling write failed");
            return;
        }
    }
    let _ = outbound.close().await;
}

/// Drain one session's notifications into endpoint state and callbacks.
async fn pump_events(
    inner: Arc<ChannelInner>,
    direction: Direction,
    generation: u64,
    mut events: SessionEvents,
    out_tx: mpsc::Sender<SignalMessage>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                tracing::debug!(direction = %direction, state = ?state, "Session state changed");
                inner.transition(generation, state);
            }
            SessionEvent::LocalCandidate(candidate) => {
                if out_tx
                    .send(SignalMessage::IceCandidate { candidate })
                    .await
                    .is_err()
                {
                    tracing::debug!(direction = %direction, "Signaling closed, dropping local candidate");
                }
            }
            SessionEvent::Frame(frame) => {
                if direction == Direction::Inbound {
                    inner.deliver(generation, frame);
                }
            }
        }
    }
}
