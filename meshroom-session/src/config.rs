//! Session configuration

use crate::error::{Error, Result};
use crate::media::MediaStream;
use crate::user::LocalUserData;
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Rendezvous endpoint used when none is configured
pub const DEFAULT_SERVER_ADDRESS: &str = "https://livelab.app:6643";

/// Reachability poll period used when none is configured
pub const DEFAULT_CONNECTIVITY_POLL_INTERVAL_MS: u64 = 500;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rendezvous service address
    pub server_address: String,
    /// Room to join; empty joins the service's default room
    pub room: String,
    /// Overrides merged over the built-in local user defaults
    pub local_user: LocalUserData,
    /// Opaque options forwarded to the connection transport
    pub connection_options: serde_json::Value,
    /// Publish without expecting remote media
    pub send_only: bool,
    /// Stream registered as the default local stream at startup
    #[serde(skip)]
    pub initial_stream: Option<MediaStream>,
    /// Video bandwidth ceiling in kbps
    pub video_bitrate_ceiling: Option<u32>,
    /// Audio bandwidth ceiling in kbps
    pub audio_bitrate_ceiling: Option<u32>,
    /// Reachability poll period
    pub connectivity_poll_interval_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            room: String::new(),
            local_user: LocalUserData::default(),
            connection_options: serde_json::Value::Object(serde_json::Map::new()),
            send_only: false,
            initial_stream: None,
            video_bitrate_ceiling: None,
            audio_bitrate_ceiling: None,
            connectivity_poll_interval_ms: DEFAULT_CONNECTIVITY_POLL_INTERVAL_MS,
            logging: LoggingConfig::default(),
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

impl SessionConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MESHROOM_ROOM, MESHROOM_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("MESHROOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Reject configurations the coordinator cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.server_address.trim().is_empty() {
            return Err(Error::Configuration("server_address must not be empty".to_string()));
        }
        url::Url::parse(&self.server_address).map_err(|e| {
            Error::Configuration(format!("invalid server_address {:?}: {e}", self.server_address))
        })?;

        if self.video_bitrate_ceiling == Some(0) {
            return Err(Error::Configuration("video_bitrate_ceiling must be positive".to_string()));
        }
        if self.audio_bitrate_ceiling == Some(0) {
            return Err(Error::Configuration("audio_bitrate_ceiling must be positive".to_string()));
        }
        if self.connectivity_poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "connectivity_poll_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.connection_options.is_object() || self.connection_options.is_null()) {
            return Err(Error::Configuration("connection_options must be an object".to_string()));
        }

        Ok(())
    }

    #[must_use]
    pub const fn connectivity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_poll_interval_ms)
    }

    /// Builder-style room selection
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Builder-style default stream selection
    #[must_use]
    pub fn with_initial_stream(mut self, stream: MediaStream) -> Self {
        self.initial_stream = Some(stream);
        self
    }
}
