//! Console configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tether_core::{
    Endpoint, LinkOptions, MAX_FRAME_LENGTH, RouterConfig, SamplerConfig, SupervisorOptions,
};

/// Top-level configuration for the console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Controller samples out to the vehicle.
    pub uplink: UplinkConfig,
    /// Telemetry in from the vehicle, commands out.
    pub downlink: DownlinkConfig,
    pub media: MediaConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

/// Uplink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub host: String,
    pub port: u16,
    /// Samples per second.
    pub rate_hz: f64,
    /// Stick deadzone, fraction of full scale.
    pub deadzone: f64,
    pub connect_timeout_ms: u64,
}

/// Downlink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// How often the receive task re-checks for shutdown.
    pub read_timeout_ms: u64,
    /// Ask for every parameter right after connecting.
    pub request_snapshot_on_connect: bool,
    /// Messages kept per topic.
    pub history_capacity: usize,
    /// Arrivals used for the per-topic rate.
    pub rate_window: usize,
}

/// Media pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Stream to play or record.
    pub source: String,
    /// Recording destination; empty disables recording.
    pub record_path: String,
    pub grace_ms: u64,
    pub kill_ms: u64,
    pub probe_timeout_ms: u64,
}

/// Restart policy for pipelines that stop on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub max_restarts: u32,
    pub window_secs: u64,
    pub backoff_ms: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5555,
            rate_hz: 20.0,
            deadzone: 0.1,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9999,
            connect_timeout_ms: 5000,
            read_timeout_ms: 1000,
            request_snapshot_on_connect: true,
            history_capacity: 100,
            rate_window: 20,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            source: "rtsp://127.0.0.1:8554/stream".into(),
            record_path: String::new(),
            grace_ms: 3000,
            kill_ms: 2000,
            probe_timeout_ms: 5000,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window_secs: 60,
            backoff_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────

impl UplinkConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..LinkOptions::default()
        }
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            rate_hz: self.rate_hz,
            deadzone: self.deadzone,
            ..SamplerConfig::default()
        }
    }
}

impl DownlinkConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_frame_length: MAX_FRAME_LENGTH,
            ..LinkOptions::default()
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            history_capacity: self.history_capacity,
            rate_window: self.rate_window,
        }
    }
}

impl MediaConfig {
    pub fn supervisor(&self) -> SupervisorOptions {
        SupervisorOptions {
            grace: Duration::from_millis(self.grace_ms),
            kill: Duration::from_millis(self.kill_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }

    pub fn record_path(&self) -> Option<PathBuf> {
        (!self.record_path.trim().is_empty()).then(|| PathBuf::from(&self.record_path))
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where a loaded configuration came from.
///
/// Loading happens before logging is set up, so the outcome is kept
/// and reported with [`log`](Self::log) afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at the path; defaults.
    Missing(PathBuf),
    /// The file did not parse; defaults.
    Invalid { path: PathBuf, error: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::File(path) => tracing::info!("config loaded from {}", path.display()),
            Self::Missing(path) => tracing::info!("no config at {}; using defaults", path.display()),
            Self::Invalid { path, error } => {
                tracing::warn!("invalid config {}: {error}; using defaults", path.display())
            }
        }
    }
}

impl ConsoleConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return (Self::default(), ConfigSource::Missing(path.to_path_buf()));
        };
        match toml::from_str(&contents) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (
                Self::default(),
                ConfigSource::Invalid {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                },
            ),
        }
    }

    /// The defaults as TOML, for `--gen-config`.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
