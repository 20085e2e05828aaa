use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sample::VideoCodec;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Default log filter: one of `debug`, `info`, `warn`, `error`.
    /// `RUST_LOG` overrides it when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the signaling surface
    #[serde(default = "default_listen")]
    pub listen: String,
    /// CORS origins allowed to call the signaling surface; "*" disables the check
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Seconds between periodic throughput summaries
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Filesystem path of the producer stream socket
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Track codec; must match what the producer encodes
    #[serde(default = "default_codec")]
    pub codec: VideoCodec,
    /// Bitrate cap in kbps advertised on the video section of the answer SDP
    pub max_bitrate_kbps: Option<u32>,
    /// Presentation framerate assumed until the producer sends metadata
    #[serde(default = "default_fps")]
    pub default_fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent viewer sessions
    #[serde(default = "default_max_peers")]
    pub max_peers: u32,
    /// ICE server URLs handed to each peer connection (empty on a LAN)
    #[serde(default)]
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Video queue capacity between ingest and distribution (~2x target fps)
    #[serde(default = "default_video_queue")]
    pub video_queue: usize,
    /// Audio queue capacity between ingest and distribution
    #[serde(default = "default_audio_queue")]
    pub audio_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            allowed_origins: default_allowed_origins(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            max_bitrate_kbps: None,
            default_fps: default_fps(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            stun_urls: Vec::new(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            video_queue: default_video_queue(),
            audio_queue: default_audio_queue(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ipc: IpcConfig::default(),
            video: VideoConfig::default(),
            session: SessionConfig::default(),
            ingest: IngestConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the gateway should not
    /// start) or "WARNING:" (advisory). Returns `Ok(())` when clean.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.listen.parse::<SocketAddr>().is_err() {
            issues.push(format!(
                "ERROR: server.listen '{}' is not a valid socket address (expected host:port)",
                self.server.listen
            ));
        }

        if self.server.allowed_origins.is_empty() {
            issues.push(
                "WARNING: server.allowed_origins is empty — every browser origin \
                 will be refused. Use [\"*\"] to disable the origin check."
                    .to_string(),
            );
        }

        if self.ipc.socket_path.is_empty() {
            issues.push("ERROR: ipc.socket_path must not be empty".to_string());
        }

        if let Some(kbps) = self.video.max_bitrate_kbps
            && !(1..=100_000).contains(&kbps)
        {
            issues.push(format!(
                "ERROR: video.max_bitrate_kbps must be between 1 and 100000, got {kbps}"
            ));
        }

        if self.video.default_fps == 0 {
            issues.push(
                "WARNING: video.default_fps is 0 — the gateway will assume 30 fps \
                 until the producer sends metadata"
                    .to_string(),
            );
        }

        if self.session.max_peers == 0 {
            issues.push(
                "WARNING: session.max_peers is 0 — every offer will be rejected".to_string(),
            );
        }

        if self.ingest.video_queue == 0 || self.ingest.audio_queue == 0 {
            issues.push(
                "ERROR: ingest.video_queue and ingest.audio_queue must be at least 1".to_string(),
            );
        }

        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            issues.push(format!(
                "ERROR: log_level '{}' is not one of debug/info/warn/error",
                self.log_level
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        return Ok(GatewayConfig::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: GatewayConfig = toml::from_str(&contents)?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config TOML")]
    Parse(#[from] toml::de::Error),
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_stats_interval() -> u64 {
    5
}

fn default_socket_path() -> String {
    "/tmp/prism-ingest.sock".to_string()
}

fn default_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_fps() -> u32 {
    30
}

fn default_max_peers() -> u32 {
    16
}

fn default_video_queue() -> usize {
    120
}

fn default_audio_queue() -> usize {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}
