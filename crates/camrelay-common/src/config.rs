//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.{yaml,toml} > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// `file` names the config file without extension (default `config`); the
/// format is picked from whichever extension exists on disk.
/// Should be called once at application startup, before any other code accesses config.
pub fn init(file: Option<&str>) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = builder()?
        .add_source(config::File::with_name(file.unwrap_or("config")).required(false))
        // Environment variables (CAMRELAY__SERVER__PORT, CAMRELAY__AUTH__JWT_SECRET, etc.)
        .add_source(
            config::Environment::with_prefix("CAMRELAY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Config builder preloaded with defaults for every optional key.
pub fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError>
{
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.use_direct_camera", false)?
        .set_default("auth.expiration_secs", 86_400)? // 24h
        .set_default("camera.program", "ffmpeg")?
        .set_default("camera.input_format", "avfoundation")?
        .set_default("camera.device", "0")?
        .set_default("camera.width", 640)?
        .set_default("camera.height", 480)?
        .set_default("camera.framerate", 30)?
        .set_default("camera.bitrate", "500k")?
        .set_default("camera.crf", 40)?
        .set_default("camera.duration_secs", 3600)?
        .set_default("rtc.local_ip", "127.0.0.1")
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub camera: CameraConfig,
    pub rtc: RtcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Feed the relay from the local camera instead of an inbound WebRTC peer.
    pub use_direct_camera: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256)
    pub jwt_secret: String,
    /// Token lifetime in seconds
    pub expiration_secs: u64,
    /// Accounts allowed to log in. There is no user database.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    /// Argon2 PHC string
    pub hashed_password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub program: String,
    /// ffmpeg input device format (`avfoundation`, `v4l2`, `dshow`)
    pub input_format: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: String,
    pub crf: u32,
    pub duration_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RtcConfig {
    /// Address media sockets bind to; also advertised as the host candidate.
    pub local_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(yaml: &str) -> AppConfig {
        builder()
            .unwrap()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = load("auth:\n  jwt_secret: s3cret\n");
        assert_eq!(cfg.server.port, 8080);
        assert!(!cfg.server.use_direct_camera);
        assert_eq!(cfg.camera.program, "ffmpeg");
        assert_eq!(cfg.camera.framerate, 30);
        assert!(cfg.auth.users.is_empty());
    }

    #[test]
    fn users_and_camera_flag_are_read() {
        let cfg = load(
            "server:\n  port: 9000\n  use_direct_camera: true\n\
             auth:\n  jwt_secret: s3cret\n  users:\n    - username: cat\n      hashed_password: x\n",
        );
        assert_eq!(cfg.server.port, 9000);
        assert!(cfg.server.use_direct_camera);
        assert_eq!(cfg.auth.users.len(), 1);
        assert_eq!(cfg.auth.users[0].username, "cat");
    }
}
