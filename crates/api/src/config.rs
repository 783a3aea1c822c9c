//! Server configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! variables prefixed `MVCAM` with `__` between sections
//! (`MVCAM_CAMERA__JPEG_QUALITY=80`).

use std::path::Path;

use camera_control::CameraSettings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;

/// File read when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "camera.toml";

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub camera: CameraSettings,
    /// Limits for the capture routes
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub addr: String,
    /// Max tracing level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Emit JSON log lines instead of text
    pub log_json: bool,
    /// Encoded frames buffered per stream client
    pub stream_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            stream_queue: 4,
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `camera.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::from_sources(file, environment())
    }

    fn from_sources(
        file: File<config::FileSourceFile, config::FileFormat>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()
    }
}

/// `MVCAM_SECTION__KEY` variables
fn environment() -> Environment {
    Environment::with_prefix("MVCAM")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
