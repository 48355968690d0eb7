//! Shared configuration for the pedalwire binary.
//!
//! One TOML file plus `PEDALWIRE_` environment overrides, and translation
//! into `pedalwire_core::AggregatorConfig` and the radio adapter configs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pedalwire_core::{AggregatorConfig, SessionPolicy};
use pedalwire_radio::{AntConfig, BleConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioSection,

    #[serde(default)]
    pub scan: ScanSection,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RadioSection {
    #[serde(default = "yes")]
    pub ble_enabled: bool,

    #[serde(default = "yes")]
    pub ant_enabled: bool,

    /// BLE connect + subscribe must finish within this.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// The ANT+ stick must report ready within this.
    #[serde(default = "default_ant_ready_timeout")]
    pub ant_ready_timeout_secs: u64,

    /// How long a filtered BLE scan may stay empty before widening.
    #[serde(default = "default_fallback_grace")]
    pub fallback_grace_secs: u64,

    #[serde(default = "default_wheel_circumference")]
    pub wheel_circumference_m: f64,
}

impl Default for RadioSection {
    fn default() -> Self {
        Self {
            ble_enabled: true,
            ant_enabled: true,
            handshake_timeout_secs: default_handshake_timeout(),
            ant_ready_timeout_secs: default_ant_ready_timeout(),
            fallback_grace_secs: default_fallback_grace(),
            wheel_circumference_m: default_wheel_circumference(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScanSection {
    #[serde(default = "default_scan_window")]
    pub window_secs: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            window_secs: default_scan_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSection {
    /// Start a session when a reading arrives and none is open. When
    /// false such readings are dropped and counted.
    #[serde(default = "yes")]
    pub auto_start: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { auto_start: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Outbound queue depth per WebSocket client.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            client_buffer: default_client_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogSection {
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn yes() -> bool {
    true
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_ant_ready_timeout() -> u64 {
    5
}
fn default_fallback_grace() -> u64 {
    5
}
fn default_wheel_circumference() -> f64 {
    pedalwire_radio::revolution::DEFAULT_WHEEL_CIRCUMFERENCE_M
}
fn default_scan_window() -> u64 {
    60
}
fn default_bind() -> String {
    "127.0.0.1:8787".into()
}
fn default_client_buffer() -> usize {
    pedalwire_core::fanout::DEFAULT_CLIENT_BUFFER
}
fn default_log_format() -> String {
    "text".into()
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let radio = &self.radio;
        for (field, value) in [
            ("radio.handshake_timeout_secs", radio.handshake_timeout_secs),
            ("radio.ant_ready_timeout_secs", radio.ant_ready_timeout_secs),
            ("radio.fallback_grace_secs", radio.fallback_grace_secs),
            ("scan.window_secs", self.scan.window_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if !radio.wheel_circumference_m.is_finite() || radio.wheel_circumference_m <= 0.0 {
            return Err(invalid(
                "radio.wheel_circumference_m",
                format!("{} is not a positive length", radio.wheel_circumference_m),
            ));
        }
        if self.server.client_buffer == 0 {
            return Err(invalid("server.client_buffer", "must be greater than zero"));
        }
        self.bind_addr()?;
        if !matches!(self.log.format.as_str(), "text" | "json") {
            return Err(invalid(
                "log.format",
                format!("expected \"text\" or \"json\", got {:?}", self.log.format),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|e| invalid("server.bind", format!("{:?}: {e}", self.server.bind)))
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            scan_window: Duration::from_secs(self.scan.window_secs),
            session_policy: if self.session.auto_start {
                SessionPolicy::AutoStart
            } else {
                SessionPolicy::Drop
            },
            ..AggregatorConfig::default()
        }
    }

    pub fn ble_config(&self) -> BleConfig {
        BleConfig {
            handshake_timeout: Duration::from_secs(self.radio.handshake_timeout_secs),
            fallback_grace: Duration::from_secs(self.radio.fallback_grace_secs),
            wheel_circumference_m: self.radio.wheel_circumference_m,
        }
    }

    pub fn ant_config(&self) -> AntConfig {
        AntConfig {
            ready_timeout: Duration::from_secs(self.radio.ant_ready_timeout_secs),
            wheel_circumference_m: self.radio.wheel_circumference_m,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "pedalwire", "pedalwire").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("pedalwire");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file + environment. A missing file means
/// defaults. `PEDALWIRE_RADIO__BLE_ENABLED=false` overrides
/// `[radio] ble_enabled`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PEDALWIRE_").split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config, returning a default if anything goes wrong.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    cfg.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.radio.handshake_timeout_secs, 10);
        assert_eq!(cfg.radio.ant_ready_timeout_secs, 5);
        assert_eq!(cfg.scan.window_secs, 60);
        assert!(cfg.session.auto_start);
        assert_eq!(cfg.server.bind, "127.0.0.1:8787");
        assert_eq!(cfg.radio.wheel_circumference_m, 2.1);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "[radio]\nant_enabled = false\nwheel_circumference_m = 2.096\n\n[session]\nauto_start = false\n",
        );
        let cfg = load_config_from(&path).unwrap();
        assert!(!cfg.radio.ant_enabled);
        assert!(cfg.radio.ble_enabled);
        assert_eq!(cfg.radio.wheel_circumference_m, 2.096);
        assert_eq!(cfg.aggregator_config().session_policy, SessionPolicy::Drop);
        assert_eq!(cfg.ant_config().wheel_circumference_m, 2.096);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[radio]\nhandshake_timeout_secs = 0\n");
        let err = load_config_from(&path).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { ref field, .. } if field == "radio.handshake_timeout_secs")
        );
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.bind = "localhost".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Validation { ref field, .. }) if field == "server.bind"
        ));
    }

    #[test]
    fn negative_circumference_is_rejected() {
        let mut cfg = Config::default();
        cfg.radio.wheel_circumference_m = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.scan.window_secs = 90;
        cfg.log.format = "json".into();
        save_config_to(&cfg, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.scan.window_secs, 90);
        assert_eq!(loaded.log.format, "json");
        assert_eq!(loaded.aggregator_config().scan_window, Duration::from_secs(90));
    }

    #[test]
    fn translation_uses_configured_timeouts() {
        let mut cfg = Config::default();
        cfg.radio.handshake_timeout_secs = 3;
        cfg.radio.fallback_grace_secs = 7;
        let ble = cfg.ble_config();
        assert_eq!(ble.handshake_timeout, Duration::from_secs(3));
        assert_eq!(ble.fallback_grace, Duration::from_secs(7));
    }
}
