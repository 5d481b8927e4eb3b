//! Production media session backed by `str0m`.
//!
//! str0m is Sans-IO: each session owns one `Rtc` instance and one UDP socket,
//! and a driver task shuttles datagrams, timeouts and commands between them:
//!
//! - str0m handles ICE, DTLS, SRTP, SDP negotiation and packetization
//! - the driver feeds it socket input and flushes its transmit queue
//! - the [`RtcSession`] handle talks to the driver over a command channel

use crate::error::SessionError;
use crate::frame::{Codec, Frame, FrameKind};
use crate::session::{
    ConnectionState, Direction, IceCandidate, MediaSession, SESSION_EVENT_CAPACITY, SdpType,
    SessionDescription, SessionEvent, SessionEvents, SessionFactory,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use str0m::change::SdpOffer;
use str0m::format::Codec as RtpCodec;
use str0m::media::{Frequency, MediaKind, MediaTime, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 64;
/// Kernel receive buffer for each session socket.
const SOCKET_RECV_BUFFER: usize = 1024 * 1024;
/// MTU-sized datagram buffer.
const DATAGRAM_BUFFER: usize = 2000;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Answer { offer: SdpOffer, reply: Reply<String> },
    AddCandidate { candidate: Candidate, reply: Reply<()> },
    Write { frame: Frame, reply: Reply<()> },
    Close,
}

/// Creates one str0m session per signaling connection, each on its own
/// ephemeral UDP port bound to `local_ip`.
pub struct RtcSessionFactory {
    local_ip: IpAddr,
}

impl RtcSessionFactory {
    pub fn new(local_ip: IpAddr) -> Self {
        Self { local_ip }
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn create(
        &self,
        direction: Direction,
    ) -> Result<(Arc<dyn MediaSession>, SessionEvents), SessionError> {
        let id = Uuid::new_v4();
        let socket = bind_socket(self.local_ip)?;
        let local_addr = socket.local_addr()?;

        tracing::debug!(session = %id, addr = %local_addr, "Bound UDP socket for session");

        let mut rtc = Rtc::builder()
            // The server is always the answerer with a single host candidate.
            .set_ice_lite(true)
            .build(Instant::now());

        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| SessionError::Candidate(e.to_string()))?;
        let local_candidate = candidate.to_sdp_string();
        rtc.add_local_candidate(candidate);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::New));

        let driver = Driver {
            id,
            direction,
            rtc,
            socket,
            local_addr,
            local_candidate,
            commands: cmd_rx,
            events: event_tx,
            state: state.clone(),
            mids: HashMap::new(),
            trickle_pending: false,
            video_ticks: 0,
            audio_ticks: 0,
        };
        let handle = tokio::spawn(driver.run());

        let session = RtcSession {
            id,
            commands: cmd_tx,
            state,
            offer: Mutex::new(None),
            answer: Mutex::new(None),
            driver: Mutex::new(Some(handle)),
        };
        Ok((Arc::new(session), event_rx))
    }
}

fn bind_socket(ip: IpAddr) -> Result<UdpSocket, SessionError> {
    let addr = SocketAddr::new(ip, 0);
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_recv_buffer_size(SOCKET_RECV_BUFFER)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Handle to one str0m peer connection.
pub struct RtcSession {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    /// Parsed remote offer waiting for `create_answer`.
    offer: Mutex<Option<SdpOffer>>,
    answer: Mutex<Option<String>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RtcSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        if desc.sdp_type != SdpType::Offer {
            return Err(SessionError::UnexpectedDescription("answer"));
        }
        let offer =
            SdpOffer::from_sdp_string(&desc.sdp).map_err(|e| SessionError::Sdp(e.to_string()))?;
        *self.offer.lock() = Some(offer);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .offer
            .lock()
            .take()
            .ok_or(SessionError::NoRemoteDescription)?;
        let sdp = self
            .request(|reply| Command::Answer { offer, reply })
            .await?;
        *self.answer.lock() = Some(sdp.clone());
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        // str0m applies its answer while creating it; only check it is ours.
        if desc.sdp_type != SdpType::Answer {
            return Err(SessionError::UnexpectedDescription("offer"));
        }
        match self.answer.lock().as_deref() {
            Some(sdp) if sdp == desc.sdp => Ok(()),
            _ => Err(SessionError::Sdp(
                "local description does not match the created answer".into(),
            )),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let line = candidate.candidate.trim();
        if line.is_empty() {
            // End-of-candidates marker.
            return Ok(());
        }
        let candidate =
            Candidate::from_sdp_string(line).map_err(|e| SessionError::Candidate(e.to_string()))?;
        self.request(|reply| Command::AddCandidate { candidate, reply })
            .await
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), SessionError> {
        self.request(|reply| Command::Write { frame, reply }).await
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn close(&self) -> Result<(), SessionError> {
        let Some(mut handle) = self.driver.lock().take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Close).await;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!(session = %self.id, "Session driver did not stop, aborting");
            handle.abort();
            *self.state.write() = ConnectionState::Closed;
        }
        Ok(())
    }
}

/// What woke the driver loop.
enum Wake {
    Command(Option<Command>),
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Timeout,
}

struct Driver {
    id: Uuid,
    direction: Direction,
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    local_candidate: String,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<RwLock<ConnectionState>>,
    mids: HashMap<Mid, FrameKind>,
    /// Set after an answer; the next negotiated mid carries our candidate.
    trickle_pending: bool,
    video_ticks: u64,
    audio_ticks: u64,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = vec![0u8; DATAGRAM_BUFFER];

        let outcome: Result<(), SessionError> = loop {
            let deadline = match self.drain_output().await {
                Ok(Some(deadline)) => deadline,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let wait = deadline.saturating_duration_since(Instant::now());

            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                res = self.socket.recv_from(&mut buf) => Wake::Datagram(res),
                _ = tokio::time::sleep(wait) => Wake::Timeout,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Close)) => break Ok(()),
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Datagram(Ok((n, source))) => {
                    if let Err(e) = self.receive(source, &buf[..n]) {
                        break Err(e);
                    }
                }
                Wake::Datagram(Err(e)) => {
                    tracing::warn!(session = %self.id, error = %e, "UDP recv error");
                }
                Wake::Timeout => {
                    if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                        break Err(e.into());
                    }
                }
            }
        };

        self.rtc.disconnect();
        let last = match outcome {
            Ok(()) => ConnectionState::Closed,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Session driver failed");
                ConnectionState::Failed
            }
        };
        self.set_state(last).await;
        tracing::debug!(session = %self.id, "Session driver stopped");
    }

    /// Flush everything str0m wants to do now. Returns the next deadline, or
    /// `None` once the connection is dead.
    async fn drain_output(&mut self) -> Result<Option<Instant>, SessionError> {
        loop {
            if !self.rtc.is_alive() {
                return Ok(None);
            }
            match self.rtc.poll_output()? {
                Output::Timeout(deadline) => return Ok(Some(deadline)),
                Output::Transmit(transmit) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        tracing::debug!(session = %self.id, error = %e, "UDP send failed");
                    }
                }
                Output::Event(event) => self.handle_event(event).await,
            }
        }
    }

    fn receive(&mut self, source: SocketAddr, datagram: &[u8]) -> Result<(), SessionError> {
        let Ok(receive) = Receive::new(Protocol::Udp, source, self.local_addr, datagram) else {
            tracing::trace!(session = %self.id, source = %source, "Ignoring unrecognised datagram");
            return Ok(());
        };
        self.rtc
            .handle_input(Input::Receive(Instant::now(), receive))
            .map_err(SessionError::from)
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Answer { offer, reply } => {
                let result = self
                    .rtc
                    .sdp_api()
                    .accept_offer(offer)
                    .map(|answer| answer.to_sdp_string())
                    .map_err(SessionError::from);
                if result.is_ok() {
                    self.trickle_pending = true;
                    self.set_state(ConnectionState::Connecting).await;
                }
                let _ = reply.send(result);
            }
            Command::AddCandidate { candidate, reply } => {
                self.rtc.add_remote_candidate(candidate);
                let _ = reply.send(Ok(()));
            }
            Command::Write { frame, reply } => {
                let _ = reply.send(self.write(frame));
            }
            Command::Close => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected => self.set_state(ConnectionState::Connected).await,
            Event::IceConnectionStateChange(IceConnectionState::Disconnected) => {
                self.set_state(ConnectionState::Disconnected).await;
            }
            Event::MediaAdded(media) => {
                let kind = frame_kind(media.kind);
                self.mids.insert(media.mid, kind);
                tracing::debug!(session = %self.id, mid = %media.mid, kind = %kind, "Media added");

                if std::mem::take(&mut self.trickle_pending) {
                    let candidate = IceCandidate {
                        candidate: self.local_candidate.clone(),
                        sdp_m_line_index: 0,
                        sdp_mid: media.mid.to_string(),
                    };
                    let _ = self.events.send(SessionEvent::LocalCandidate(candidate)).await;
                }
            }
            Event::MediaData(data) => {
                if self.direction != Direction::Inbound {
                    return;
                }
                let Some(&kind) = self.mids.get(&data.mid) else {
                    return;
                };
                let rtp_codec = data.params.spec().codec;
                let Some(codec) = codec_of(rtp_codec).filter(|c| c.kind() == kind) else {
                    tracing::debug!(session = %self.id, codec = ?rtp_codec, "Dropping frame with unsupported codec");
                    return;
                };
                let frame = Frame::new(kind, data.data, kind.nominal_duration()).with_codec(codec);
                if self.events.try_send(SessionEvent::Frame(frame)).is_err() {
                    tracing::debug!(session = %self.id, kind = %kind, "Event queue full, dropping frame");
                }
            }
            _ => {}
        }
    }

    fn write(&mut self, frame: Frame) -> Result<(), SessionError> {
        let kind = frame.kind;
        let mid = self
            .mids
            .iter()
            .find_map(|(mid, k)| (*k == kind).then_some(*mid))
            .ok_or(SessionError::NoTrack(kind))?;

        let writer = self.rtc.writer(mid).ok_or(SessionError::NoTrack(kind))?;
        let offered = writer
            .payload_params()
            .filter_map(|params| codec_of(params.spec().codec).map(|codec| (codec, params.pt())));
        let Some(pt) = select_payload(offered, frame.codec) else {
            tracing::debug!(session = %self.id, codec = %frame.codec, "Peer did not negotiate the frame's codec");
            return Err(SessionError::NoTrack(kind));
        };

        let (frequency, hz, ticks) = match kind {
            FrameKind::Video => (Frequency::NINETY_KHZ, 90_000, &mut self.video_ticks),
            FrameKind::Audio => (Frequency::FORTY_EIGHT_KHZ, 48_000, &mut self.audio_ticks),
        };
        let rtp_time = MediaTime::new(*ticks, frequency);
        *ticks += frame.duration.as_micros() as u64 * hz / 1_000_000;

        writer.write(pt, Instant::now(), rtp_time, frame.payload.to_vec())?;
        Ok(())
    }

    async fn set_state(&mut self, state: ConnectionState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        let _ = self.events.send(SessionEvent::StateChanged(state)).await;
    }
}

fn codec_of(codec: RtpCodec) -> Option<Codec> {
    match codec {
        RtpCodec::Vp8 => Some(Codec::Vp8),
        RtpCodec::Vp9 => Some(Codec::Vp9),
        RtpCodec::H264 => Some(Codec::H264),
        RtpCodec::Av1 => Some(Codec::Av1),
        RtpCodec::Opus => Some(Codec::Opus),
        _ => None,
    }
}

/// First payload type the peer negotiated for `codec`, in the peer's
/// preference order.
fn select_payload<P>(offered: impl IntoIterator<Item = (Codec, P)>, codec: Codec) -> Option<P> {
    offered
        .into_iter()
        .find_map(|(offered, pt)| (offered == codec).then_some(pt))
}

fn frame_kind(kind: MediaKind) -> FrameKind {
    match kind {
        MediaKind::Audio => FrameKind::Audio,
        MediaKind::Video => FrameKind::Video,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn factory() -> RtcSessionFactory {
        RtcSessionFactory::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn payload_type_follows_the_frame_codec() {
        // Safari-style ordering: H264 preferred over VP8.
        let offered = [(Codec::H264, 102u8), (Codec::H264, 127), (Codec::Vp8, 96), (Codec::Vp9, 98)];
        assert_eq!(select_payload(offered, Codec::Vp8), Some(96));
        assert_eq!(select_payload(offered, Codec::H264), Some(102));
        assert_eq!(select_payload(offered, Codec::Av1), None);
        assert_eq!(select_payload([(Codec::Opus, 111u8)], Codec::Opus), Some(111));
    }

    #[test]
    fn rtp_codecs_map_onto_frame_codecs() {
        assert_eq!(codec_of(RtpCodec::Vp8), Some(Codec::Vp8));
        assert_eq!(codec_of(RtpCodec::Opus), Some(Codec::Opus));
        assert_eq!(codec_of(RtpCodec::PCMU), None);
    }

    #[tokio::test]
    async fn new_session_starts_in_new_state() {
        let (session, _events) = factory().create(Direction::Outbound).await.unwrap();
        assert_eq!(session.state(), ConnectionState::New);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unparseable_offer() {
        let (session, _events) = factory().create(Direction::Inbound).await.unwrap();
        let err = session
            .set_remote_description(SessionDescription::offer("definitely not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Sdp(_)));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let (session, _events) = factory().create(Direction::Inbound).await.unwrap();
        assert!(matches!(
            session.create_answer().await,
            Err(SessionError::NoRemoteDescription)
        ));
        assert!(matches!(
            session
                .set_remote_description(SessionDescription::answer("v=0"))
                .await,
            Err(SessionError::UnexpectedDescription(_))
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_without_negotiated_track_fails() {
        let (session, _events) = factory().create(Direction::Outbound).await.unwrap();
        assert!(matches!(
            session.write_frame(Frame::video(vec![0u8; 8])).await,
            Err(SessionError::NoTrack(FrameKind::Video))
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_reports_closed_and_ends_events() {
        let (session, mut events) = factory().create(Direction::Inbound).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        let mut last = None;
        while let Some(event) = events.recv().await {
            if let SessionEvent::StateChanged(state) = event {
                last = Some(state);
            }
        }
        assert_eq!(last, Some(ConnectionState::Closed));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(
            session.write_frame(Frame::audio(vec![0u8; 4])).await,
            Err(SessionError::Closed)
        ));
    }
}
