//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Binary name used when nothing else is configured
pub const DEFAULT_ENCODER_BINARY: &str = "ffmpeg";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoder binary configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Path or name of the ffmpeg binary
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Allow hardware encoders (NVENC/QSV/AMF) when detected
    #[serde(default = "default_hardware_encoding")]
    pub hardware_encoding: bool,
    /// Upper bound for the `-encoders` capability probe
    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from(DEFAULT_ENCODER_BINARY)
}

fn default_hardware_encoding() -> bool {
    true
}

fn default_detect_timeout_secs() -> u64 {
    10
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            hardware_encoding: default_hardware_encoding(),
            detect_timeout_secs: default_detect_timeout_secs(),
        }
    }
}

impl EncoderConfig {
    /// Resolve the binary that should actually be executed.
    ///
    /// When the configured binary is the bare default name, a bundled copy
    /// sitting next to the running executable takes precedence over `PATH`.
    pub fn resolve_binary(&self) -> PathBuf {
        if self.binary != Path::new(DEFAULT_ENCODER_BINARY) {
            return self.binary.clone();
        }

        let bundled = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(bundled_binary_name())));

        match bundled {
            Some(path) if path.is_file() => path,
            _ => self.binary.clone(),
        }
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }
}

fn bundled_binary_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        DEFAULT_ENCODER_BINARY
    }
}

/// Recording defaults used when a request does not specify them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingConfig {
    /// Default frame rate (must be one of the supported rates)
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Default quality preset key
    #[serde(default = "default_quality")]
    pub quality: String,
    /// Directory for finished recordings (platform video dir if None)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// DirectShow device used when system audio is requested
    #[serde(default = "default_system_audio_device")]
    pub system_audio_device: String,
}

fn default_framerate() -> u32 {
    60
}

fn default_quality() -> String {
    "balanced".to_string()
}

fn default_system_audio_device() -> String {
    "virtual-audio-capturer".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            framerate: default_framerate(),
            quality: default_quality(),
            output_dir: None,
            system_audio_device: default_system_audio_device(),
        }
    }
}

/// Timing knobs for the encoder process lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// How long a freshly spawned encoder must survive to count as started
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Wait after sending the quit byte before escalating
    #[serde(default = "default_graceful_stop_secs")]
    pub graceful_stop_secs: u64,
    /// Wait after the terminate signal before force killing
    #[serde(default = "default_terminate_secs")]
    pub terminate_secs: u64,
    /// Upper bound for the concat merge
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
}

fn default_settle_ms() -> u64 {
    500
}

fn default_graceful_stop_secs() -> u64 {
    10
}

fn default_terminate_secs() -> u64 {
    5
}

fn default_merge_timeout_secs() -> u64 {
    300
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            graceful_stop_secs: default_graceful_stop_secs(),
            terminate_secs: default_terminate_secs(),
            merge_timeout_secs: default_merge_timeout_secs(),
        }
    }
}

impl ProcessConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_secs)
    }

    pub fn terminate(&self) -> Duration {
        Duration::from_secs(self.terminate_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

/// Session scratch space configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionConfig {
    /// Base directory for per-session segment folders (OS temp dir if None)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn temp_base(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - NEOREC_FFMPEG_PATH -> encoder.binary
    /// - NEOREC_HARDWARE_ENCODING -> encoder.hardware_encoding
    /// - NEOREC_FRAMERATE -> recording.framerate
    /// - NEOREC_QUALITY -> recording.quality
    /// - NEOREC_TEMP_DIR -> session.temp_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("NEOREC_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.encoder.binary = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("NEOREC_HARDWARE_ENCODING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.hardware_encoding = true,
                "false" | "0" | "no" => self.encoder.hardware_encoding = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("NEOREC_FRAMERATE") {
            if let Ok(fps) = val.parse::<u32>() {
                self.recording.framerate = fps;
            }
        }

        if let Ok(val) = env::var("NEOREC_QUALITY") {
            if !val.trim().is_empty() {
                self.recording.quality = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("NEOREC_TEMP_DIR") {
            if !val.trim().is_empty() {
                self.session.temp_dir = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
