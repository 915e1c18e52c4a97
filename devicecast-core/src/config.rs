use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::frame::PixelLayout;
use crate::types::IceServer;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
    pub track: TrackConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Session negotiation and lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN servers handed to every peer connection, in order
    pub ice_servers: Vec<IceServer>,
    /// Maximum session age before the sweep reclaims it
    pub session_ttl_seconds: u64,
    /// Period of the standalone sweep task (0 = sweep only on offer creation)
    pub sweep_interval_seconds: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            session_ttl_seconds: 3600, // 1 hour
            sweep_interval_seconds: 60,
        }
    }
}

impl WebRtcConfig {
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sweep_interval_seconds))
        }
    }
}

/// Media track adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Pixel layout the transport encoder expects
    pub required_layout: PixelLayout,
    /// Placeholder frame size used while the source is failing
    pub fallback_width: u32,
    pub fallback_height: u32,
    /// Upper bound on a single frame fetch
    pub pull_timeout_ms: u64,
    /// Pull cadence of the transport pump
    pub frame_rate: u32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            required_layout: PixelLayout::Bgr24,
            fallback_width: 640,
            fallback_height: 480,
            pull_timeout_ms: 100,
            frame_rate: 30,
        }
    }
}

impl TrackConfig {
    #[must_use]
    pub const fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

/// Metadata broadcast loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Tick period (~30 Hz by default)
    pub period_ms: u64,
    /// Bounded wait for a stopping loop to exit
    pub stop_timeout_ms: u64,
    /// Capacity of the in-process event channel
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            period_ms: 33,
            stop_timeout_ms: 1000,
            channel_capacity: 64,
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> crate::Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // DEVICECAST_SERVER_HOST, DEVICECAST_BROADCAST_PERIOD_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("DEVICECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> crate::Result<Self> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values that would break the runtime.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (i, server) in self.webrtc.ice_servers.iter().enumerate() {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                errors.push(format!("webrtc.ice_servers[{i}] has an empty url"));
            }
            if server.username.is_some() != server.credential.is_some() {
                errors.push(format!(
                    "webrtc.ice_servers[{i}] must set both username and credential or neither"
                ));
            }
        }
        if self.webrtc.session_ttl_seconds == 0 {
            errors.push("webrtc.session_ttl_seconds must be greater than 0".to_string());
        }
        if self.track.fallback_width == 0 || self.track.fallback_height == 0 {
            errors.push("track fallback resolution must be non-zero".to_string());
        }
        if self.track.frame_rate == 0 {
            errors.push("track.frame_rate must be greater than 0".to_string());
        }
        if self.broadcast.period_ms == 0 {
            errors.push("broadcast.period_ms must be greater than 0".to_string());
        }
        if self.broadcast.channel_capacity == 0 {
            errors.push("broadcast.channel_capacity must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
