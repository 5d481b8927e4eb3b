//! In-memory session and signaling doubles for exercising endpoints without
//! a network stack.

use crate::error::{SessionError, SignalingError};
use crate::frame::Frame;
use crate::session::{
    ConnectionState, Direction, IceCandidate, MediaSession, SESSION_EVENT_CAPACITY, SdpType,
    SessionDescription, SessionEvent, SessionEvents, SessionFactory,
};
use crate::signaling::{SignalMessage, SignalingConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const FAKE_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=camrelay-fake\r\n";
const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// How fake sessions react to negotiation.
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Report `Connected` as soon as the local answer is applied.
    pub connect_on_answer: bool,
    /// Candidates to trickle once the local answer is applied.
    pub local_candidates: Vec<IceCandidate>,
    /// Make every `write_frame` fail.
    pub fail_writes: bool,
}

struct FakeState {
    state: ConnectionState,
    remote: Option<String>,
    answer: Option<String>,
    candidates: Vec<IceCandidate>,
    written: Vec<Frame>,
    events: Option<mpsc::Sender<SessionEvent>>,
}

pub struct FakeSession {
    direction: Direction,
    behavior: FakeBehavior,
    inner: Mutex<FakeState>,
}

impl FakeSession {
    pub fn new(direction: Direction, behavior: FakeBehavior) -> (Arc<Self>, SessionEvents) {
        let (tx, rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let session = Arc::new(Self {
            direction,
            behavior,
            inner: Mutex::new(FakeState {
                state: ConnectionState::New,
                remote: None,
                answer: None,
                candidates: Vec::new(),
                written: Vec::new(),
                events: Some(tx),
            }),
        });
        (session, rx)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Force a state change, as the transport would on ICE/DTLS progress.
    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Deliver a frame as if it arrived from the remote peer.
    pub fn push_frame(&self, frame: Frame) {
        self.emit(SessionEvent::Frame(frame));
    }

    pub fn emit(&self, event: SessionEvent) {
        let tx = self.inner.lock().events.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(event);
        }
    }

    pub fn written(&self) -> Vec<Frame> {
        self.inner.lock().written.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().candidates.clone()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.inner.lock().remote.clone()
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        if desc.sdp_type != SdpType::Offer {
            return Err(SessionError::UnexpectedDescription("answer"));
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(SessionError::Sdp("missing version line".into()));
        }
        self.inner.lock().remote = Some(desc.sdp);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.remote.is_none() {
                return Err(SessionError::NoRemoteDescription);
            }
            inner.answer = Some(FAKE_ANSWER.to_string());
            inner.state = ConnectionState::Connecting;
        }
        self.emit(SessionEvent::StateChanged(ConnectionState::Connecting));
        Ok(SessionDescription::answer(FAKE_ANSWER))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        if desc.sdp_type != SdpType::Answer {
            return Err(SessionError::UnexpectedDescription("offer"));
        }
        if self.inner.lock().answer.as_deref() != Some(desc.sdp.as_str()) {
            return Err(SessionError::Sdp("local description was not created here".into()));
        }
        for candidate in &self.behavior.local_candidates {
            self.emit(SessionEvent::LocalCandidate(candidate.clone()));
        }
        if self.behavior.connect_on_answer {
            self.set_state(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        if candidate.candidate.is_empty() {
            return Err(SessionError::Candidate("empty candidate".into()));
        }
        self.inner.lock().candidates.push(candidate);
        Ok(())
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if self.behavior.fail_writes || inner.state == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        inner.written.push(frame);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    async fn close(&self) -> Result<(), SessionError> {
        let tx = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Ok(());
            }
            inner.state = ConnectionState::Closed;
            inner.events.take()
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(SessionEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Hands out [`FakeSession`]s and remembers every one it created.
pub struct FakeSessionFactory {
    behavior: FakeBehavior,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSessionFactory {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    /// The `index`-th session created, waiting for it if necessary.
    ///
    /// Panics if it does not appear in time.
    pub async fn session(&self, index: usize) -> Arc<FakeSession> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            if let Some(session) = self.sessions.lock().get(index).cloned() {
                return session;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session {index} was never created"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create(
        &self,
        direction: Direction,
    ) -> Result<(Arc<dyn MediaSession>, SessionEvents), SessionError> {
        let (session, events) = FakeSession::new(direction, self.behavior.clone());
        self.sessions.lock().push(session.clone());
        Ok((session, events))
    }
}

/// The remote side of an in-memory [`SignalingConnection`].
pub struct PeerHandle {
    tx: Option<mpsc::UnboundedSender<Result<String, SignalingError>>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl PeerHandle {
    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Inject a transport failure.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(SignalingError::Transport(reason.to_string())));
        }
    }

    /// Close the peer's sending half, ending the server's read loop.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.recv_within(DEFAULT_WAIT).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Option<SignalMessage> {
        let text = tokio::time::timeout(wait, self.rx.recv()).await.ok()??;
        serde_json::from_str(&text).ok()
    }
}

/// An in-memory signaling connection and the peer that drives it.
pub fn connection() -> (SignalingConnection, PeerHandle) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();

    let inbound = futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let outbound = futures_util::sink::unfold(out_tx, |tx, text: String| async move {
        tx.send(text).map_err(|_| SignalingError::Closed)?;
        Ok::<_, SignalingError>(tx)
    });

    (
        SignalingConnection::new(inbound, outbound),
        PeerHandle {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

/// Poll `condition` until it holds. Panics after a couple of seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
