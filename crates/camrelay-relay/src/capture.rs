//! Direct camera capture.
//!
//! Spawns an encoder process (ffmpeg by default) against a local camera and
//! demultiplexes its IVF output into video frames. Stands in for the WebRTC
//! receiver when the relay is fed locally, so it never accepts signaling.

use crate::endpoint::{
    Callbacks, EndpointStats, FrameCallback, MediaEndpoint, MediaReceiver, StateCallback,
};
use crate::error::{CaptureError, RelayError, RelayResult};
use crate::frame::Frame;
use crate::signaling::SignalingConnection;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// IVF file header, skipped unread.
pub const IVF_FILE_HEADER_LEN: usize = 32;
/// Per-frame header: u32 LE payload length, then a u64 timestamp.
pub const IVF_FRAME_HEADER_LEN: usize = 12;
/// Frame lengths above this are treated as stream corruption.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// How long a killed capture process gets to exit.
const EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Camera and encoder settings.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub program: String,
    /// Input device format (`avfoundation`, `v4l2`, `dshow`)
    pub input_format: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target bitrate in ffmpeg notation (`500k`)
    pub bitrate: String,
    pub crf: u32,
    /// Capture stops on its own after this long.
    pub duration: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            input_format: "avfoundation".into(),
            device: "0".into(),
            width: 640,
            height: 480,
            framerate: 30,
            bitrate: "500k".into(),
            crf: 40,
            duration: Duration::from_secs(3600),
        }
    }
}

impl CaptureOptions {
    /// Encoder arguments: camera in, VP8 in IVF on stdout.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            self.input_format.clone(),
            "-video_size".into(),
            format!("{}x{}", self.width, self.height),
            "-framerate".into(),
            self.framerate.to_string(),
            "-i".into(),
            self.device.clone(),
            "-t".into(),
            self.duration.as_secs().to_string(),
            "-c:v".into(),
            "libvpx".into(),
            "-b:v".into(),
            self.bitrate.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-f".into(),
            "ivf".into(),
            "-".into(),
        ]
    }
}

/// Read an IVF stream, calling `on_frame` for every frame.
///
/// Returns the number of frames read once the stream ends cleanly on a frame
/// boundary. A zero or oversized frame length aborts the stream.
pub async fn read_ivf_frames<R, F>(mut reader: R, mut on_frame: F) -> Result<u64, CaptureError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame),
{
    let mut file_header = [0u8; IVF_FILE_HEADER_LEN];
    reader.read_exact(&mut file_header).await?;

    let mut count = 0u64;
    let mut header = [0u8; IVF_FRAME_HEADER_LEN];
    loop {
        let n = reader.read(&mut header).await?;
        if n == 0 {
            return Ok(count);
        }
        reader.read_exact(&mut header[n..]).await?;

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(CaptureError::InvalidFrameLength(len));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        on_frame(Frame::video(payload));
        count += 1;
    }
}

struct CaptureInner {
    program: String,
    args: Vec<String>,
    duration: Duration,
    /// A capture run owns the source.
    busy: AtomicBool,
    /// The encoder process is alive.
    streaming: AtomicBool,
    callbacks: Callbacks,
    stats: Mutex<EndpointStats>,
}

impl CaptureInner {
    async fn capture(&self, cancel: CancellationToken) -> Result<u64, CaptureError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyStreaming);
        }
        let result = self.run_process(cancel).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    async fn run_process(&self, cancel: CancellationToken) -> Result<u64, CaptureError> {
        tracing::debug!(program = %self.program, args = ?self.args, "Spawning capture process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            start_kill(&mut child);
            return Err(CaptureError::MissingStdout);
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, self.program.clone()));
        }

        self.streaming.store(true, Ordering::Release);
        tracing::info!(program = %self.program, pid = ?child.id(), "Camera capture started");
        self.callbacks.connected();

        let emitted = AtomicU64::new(0);
        let parse = read_ivf_frames(BufReader::new(stdout), |frame| {
            emitted.fetch_add(1, Ordering::Relaxed);
            self.stats.lock().video.received += 1;
            self.callbacks.frame(frame);
        });

        let result = tokio::select! {
            res = parse => res,
            _ = cancel.cancelled() => {
                tracing::info!("Camera capture stopped");
                Ok(0)
            }
            _ = tokio::time::sleep(self.duration) => {
                tracing::info!(duration = ?self.duration, "Camera capture duration elapsed");
                Ok(0)
            }
        }
        .map(|_| emitted.load(Ordering::Relaxed));

        // Stream and process end together.
        start_kill(&mut child);
        match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(status = %status, "Capture process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap capture process"),
            Err(_) => tracing::warn!("Capture process did not exit after kill"),
        }

        self.streaming.store(false, Ordering::Release);
        self.callbacks.disconnected();
        result
    }
}

fn start_kill(child: &mut Child) {
    // Fails harmlessly when the process has already exited.
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to signal capture process");
    }
}

async fn drain_stderr(stderr: ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(program = %program, "{line}");
    }
}

/// A receiver fed by a local camera.
pub struct CaptureSource {
    inner: Arc<CaptureInner>,
    /// Cancelled by `close`; every run's token derives from it.
    shutdown: CancellationToken,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CaptureSource {
    pub fn new(options: CaptureOptions) -> Self {
        let args = options.args();
        Self::from_command(options.program, args, options.duration)
    }

    /// Run an arbitrary command that writes IVF to stdout.
    pub fn from_command(
        program: impl Into<String>,
        args: Vec<String>,
        duration: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                program: program.into(),
                args,
                duration,
                busy: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                callbacks: Callbacks::default(),
                stats: Mutex::new(EndpointStats::default()),
            }),
            shutdown: CancellationToken::new(),
            run: Mutex::new(None),
        }
    }

    /// Run one capture in the calling task until the stream ends, the
    /// duration elapses, or the source is stopped. Returns the frame count.
    pub async fn capture(&self) -> Result<u64, CaptureError> {
        self.inner.capture(self.shutdown.child_token()).await
    }

    /// Stop the running capture, if any, and wait for it to wind down.
    pub async fn stop(&self) {
        let run = self.run.lock().take();
        if let Some((cancel, handle)) = run {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Capture task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl MediaEndpoint for CaptureSource {
    async fn start(&self) -> RelayResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            match inner.capture(token).await {
                Ok(frames) => tracing::info!(frames, "Camera capture finished"),
                Err(e) => tracing::error!(error = %e, "Camera capture failed"),
            }
        });
        *run = Some((cancel, handle));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    fn stats(&self) -> EndpointStats {
        *self.inner.stats.lock()
    }

    fn accepts_signaling(&self) -> bool {
        false
    }

    async fn handle_signaling_connection(&self, _conn: SignalingConnection) -> RelayResult<()> {
        Err(RelayError::SignalingUnsupported)
    }

    async fn close(&self) -> RelayResult<()> {
        self.shutdown.cancel();
        self.stop().await;
        Ok(())
    }
}

impl MediaReceiver for CaptureSource {
    fn assign_video_callback(&self, callback: FrameCallback) {
        self.inner.callbacks.set_video(callback);
    }

    fn assign_audio_callback(&self, callback: FrameCallback) {
        // The camera pipeline carries no audio.
        self.inner.callbacks.set_audio(callback);
    }

    fn assign_connected_callback(&self, callback: StateCallback) {
        self.inner.callbacks.set_connected(callback);
    }

    fn assign_disconnected_callback(&self, callback: StateCallback) {
        self.inner.callbacks.set_disconnected(callback);
    }
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("program", &self.inner.program)
            .field("streaming", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use std::io::Cursor;

    fn ivf(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0u8; IVF_FILE_HEADER_LEN];
        out[..4].copy_from_slice(b"DKIF");
        for (i, payload) in frames.iter().enumerate() {
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&(i as u64).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn default_args_match_ffmpeg_invocation() {
        let args = CaptureOptions::default().args().join(" ");
        assert_eq!(
            args,
            "-f avfoundation -video_size 640x480 -framerate 30 -i 0 -t 3600 \
             -c:v libvpx -b:v 500k -crf 40 -f ivf -"
        );
    }

    #[tokio::test]
    async fn reads_frames_in_order() {
        let data = ivf(&[b"abc".as_slice(), b"hello".as_slice(), &[7u8; 1000]]);
        let mut seen = Vec::new();
        let count = read_ivf_frames(Cursor::new(data), |f| seen.push(f)).await.unwrap();

        assert_eq!(count, 3);
        assert_eq!(&seen[0].payload[..], b"abc");
        assert_eq!(&seen[1].payload[..], b"hello");
        assert_eq!(seen[2].len(), 1000);
        assert!(seen.iter().all(|f| f.kind == FrameKind::Video));
    }

    #[tokio::test]
    async fn header_only_stream_is_empty() {
        let count = read_ivf_frames(Cursor::new(ivf(&[])), |_| panic!("no frames"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn rejects_zero_and_oversized_lengths() {
        let mut zero = vec![0u8; IVF_FILE_HEADER_LEN + IVF_FRAME_HEADER_LEN];
        zero.extend_from_slice(b"junk");
        assert!(matches!(
            read_ivf_frames(Cursor::new(zero), |_| {}).await,
            Err(CaptureError::InvalidFrameLength(0))
        ));

        let mut huge = vec![0u8; IVF_FILE_HEADER_LEN];
        huge.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        huge.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            read_ivf_frames(Cursor::new(huge), |_| {}).await,
            Err(CaptureError::InvalidFrameLength(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let mut data = ivf(&[b"whole".as_slice()]);
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(b"part");
        let mut frames = 0;
        let result = read_ivf_frames(Cursor::new(data), |_| frames += 1).await;
        assert!(matches!(result, Err(CaptureError::Io(_))));
        assert_eq!(frames, 1);
    }

    #[tokio::test]
    async fn refuses_signaling() {
        let source = CaptureSource::new(CaptureOptions::default());
        assert!(!source.accepts_signaling());
        let (conn, _peer) = crate::testing::connection();
        assert!(matches!(
            source.handle_signaling_connection(conn).await,
            Err(RelayError::SignalingUnsupported)
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let source = CaptureSource::from_command(
            "/nonexistent/camrelay-encoder",
            Vec::new(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            source.capture().await,
            Err(CaptureError::Spawn { .. })
        ));
        assert!(!source.is_connected());
    }

    #[cfg(unix)]
    fn shell(script: &str, duration: Duration) -> CaptureSource {
        CaptureSource::from_command("sh", vec!["-c".into(), script.into()], duration)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_frames_reach_callbacks() {
        use std::sync::atomic::AtomicUsize;

        let source = shell(
            r"head -c 32 /dev/zero; printf '\003\000\000\000'; head -c 8 /dev/zero; printf 'abc'",
            Duration::from_secs(30),
        );
        let frames = Arc::new(Mutex::new(Vec::new()));
        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        source.assign_video_callback({
            let frames = frames.clone();
            Arc::new(move |frame: Frame| frames.lock().push(frame))
        });
        source.assign_connected_callback({
            let ups = ups.clone();
            Arc::new(move || {
                ups.fetch_add(1, Ordering::SeqCst);
            })
        });
        source.assign_disconnected_callback({
            let downs = downs.clone();
            Arc::new(move || {
                downs.fetch_add(1, Ordering::SeqCst);
            })
        });

        let count = source.capture().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(&frames.lock()[0].payload[..], b"abc");
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert_eq!(source.stats().video.received, 1);
        assert!(!source.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_length_kills_the_process() {
        // 0x001e8480 = 2_000_000 bytes, over the frame limit.
        let source = shell(
            r"head -c 32 /dev/zero; printf '\200\204\036\000'; head -c 8 /dev/zero; sleep 30",
            Duration::from_secs(30),
        );
        let frames = Arc::new(AtomicU64::new(0));
        let downs = Arc::new(AtomicU64::new(0));
        source.assign_video_callback({
            let frames = frames.clone();
            Arc::new(move |_frame: Frame| {
                frames.fetch_add(1, Ordering::SeqCst);
            })
        });
        source.assign_disconnected_callback({
            let downs = downs.clone();
            Arc::new(move || {
                downs.fetch_add(1, Ordering::SeqCst);
            })
        });

        let result = tokio::time::timeout(Duration::from_secs(10), source.capture())
            .await
            .expect("capture should abort promptly");
        assert!(matches!(result, Err(CaptureError::InvalidFrameLength(2_000_000))));
        assert!(!source.is_connected());
        assert_eq!(frames.load(Ordering::SeqCst), 0);
        assert_eq!(source.stats().video.received, 0);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duration_bounds_the_capture() {
        let source = shell("sleep 30", Duration::from_millis(100));
        let result = tokio::time::timeout(Duration::from_secs(10), source.capture())
            .await
            .expect("duration should end the capture");
        assert_eq!(result.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_stops_a_started_capture() {
        let source = shell("sleep 30", Duration::from_secs(30));
        source.start().await.unwrap();
        source.start().await.unwrap();
        crate::testing::wait_until(|| source.is_connected()).await;

        tokio::time::timeout(Duration::from_secs(10), source.close())
            .await
            .expect("close should not hang")
            .unwrap();
        assert!(!source.is_connected());

        // Closed sources stay closed.
        source.start().await.unwrap();
        assert!(source.run.lock().is_none());
    }
}
