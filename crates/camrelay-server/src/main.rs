//! # camrelay
//!
//! Single binary that runs the relay and its HTTP surface:
//! - Signaling WebSockets for the publishing and viewing peers
//! - Relay status and management API
//! - The demo viewer page
//!
//! The receiver side is either a browser publishing over WebRTC or, with
//! `--direct-camera`, the local camera through ffmpeg.

use anyhow::Context;
use camrelay_api::{AppState, auth, build_router};
use camrelay_common::config::{AppConfig, CameraConfig};
use camrelay_relay::{
    CaptureOptions, CaptureSource, MediaReceiver, Relay, RtcSessionFactory, SignalingReceiver,
    SignalingSender,
};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "camrelay", version, about = "Camera-to-browser WebRTC relay")]
struct Cli {
    /// Config file name without extension
    #[arg(long, env = "CAMRELAY_CONFIG")]
    config: Option<String>,

    /// Feed the relay from the local camera instead of a publishing peer
    #[arg(long)]
    direct_camera: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an Argon2 hash for an `auth.users` entry
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::HashPassword { password }) = &cli.command {
        let hash = auth::hash_password(password).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{hash}");
        return Ok(());
    }

    let config = camrelay_common::config::init(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camrelay=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting camrelay v{}", env!("CARGO_PKG_VERSION"));

    if config.auth.users.is_empty() {
        tracing::warn!("No operator accounts configured; management routes are unreachable");
    }

    let relay = Arc::new(build_relay(config, cli.direct_camera)?);
    relay.start().await?;

    let state = AppState::new(relay.clone(), auth::Authorizer::from_config(&config.auth));
    let router = build_router(state);

    let addr = SocketAddr::new(
        config.server.host.parse().context("invalid server.host")?,
        config.server.port,
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down relay");
    relay.close().await?;

    Ok(())
}

/// Pick the receiver, attach the sender, and wire them together.
fn build_relay(config: &AppConfig, direct_camera: bool) -> anyhow::Result<Relay> {
    let local_ip: IpAddr = config.rtc.local_ip.parse().context("invalid rtc.local_ip")?;
    let factory = Arc::new(RtcSessionFactory::new(local_ip));

    let receiver: Arc<dyn MediaReceiver> = if direct_camera || config.server.use_direct_camera {
        tracing::info!(device = %config.camera.device, "Receiver: local camera");
        Arc::new(CaptureSource::new(capture_options(&config.camera)))
    } else {
        tracing::info!("Receiver: WebRTC publisher on /ws/receiver");
        Arc::new(SignalingReceiver::new(factory.clone()))
    };
    let sender = Arc::new(SignalingSender::new(factory));

    Ok(Relay::new(receiver, sender))
}

fn capture_options(camera: &CameraConfig) -> CaptureOptions {
    CaptureOptions {
        program: camera.program.clone(),
        input_format: camera.input_format.clone(),
        device: camera.device.clone(),
        width: camera.width,
        height: camera.height,
        framerate: camera.framerate,
        bitrate: camera.bitrate.clone(),
        crf: camera.crf,
        duration: Duration::from_secs(camera.duration_secs),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from(["camrelay", "--config", "prod", "--direct-camera"]);
        assert_eq!(cli.config.as_deref(), Some("prod"));
        assert!(cli.direct_camera);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["camrelay", "hash-password", "hunter2"]);
        assert!(matches!(cli.command, Some(Command::HashPassword { ref password }) if password == "hunter2"));
    }

    #[test]
    fn camera_config_maps_to_capture_options() {
        let camera = CameraConfig {
            program: "ffmpeg".into(),
            input_format: "v4l2".into(),
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            framerate: 25,
            bitrate: "1M".into(),
            crf: 30,
            duration_secs: 60,
        };
        let options = capture_options(&camera);
        assert_eq!(options.input_format, "v4l2");
        assert_eq!(options.framerate, 25);
        assert_eq!(options.duration, Duration::from_secs(60));
    }
}
