//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use pedalwire_config::ConfigError;
use pedalwire_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Radios ───────────────────────────────────────────────────────

    #[error("No usable radio: {message}")]
    #[diagnostic(
        code(pedalwire::no_radio),
        help(
            "Check that Bluetooth is switched on and an ANT+ USB stick is plugged in.\n\
             To try pedalwire without hardware: pedalwire scan --simulate"
        )
    )]
    NoRadio { message: String },

    #[error("{transport} radio unavailable: {reason}")]
    #[diagnostic(code(pedalwire::radio_unavailable))]
    RadioUnavailable { transport: String, reason: String },

    #[error("Permission denied for {transport} radio")]
    #[diagnostic(
        code(pedalwire::permission_denied),
        help("Grant this user access to the radio (on Linux, membership in the `bluetooth` group).")
    )]
    PermissionDenied { transport: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    #[diagnostic(code(pedalwire::timeout))]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    // ── Devices & sessions ───────────────────────────────────────────

    #[error("Device '{identifier}' not found")]
    #[diagnostic(
        code(pedalwire::not_found),
        help("Run `pedalwire scan` to list devices in range.")
    )]
    DeviceNotFound { identifier: String },

    #[error("{message}")]
    #[diagnostic(code(pedalwire::session_state))]
    SessionState { message: String },

    // ── Server ───────────────────────────────────────────────────────

    #[error("Could not listen on {addr}")]
    #[diagnostic(
        code(pedalwire::bind_failed),
        help(
            "Another process may already use this port.\n\
             Try: pedalwire serve --bind 127.0.0.1:0"
        )
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(code(pedalwire::validation_failed))]
    Validation { field: String, reason: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(pedalwire::config_error),
        help("Check the config file at: {path}")
    )]
    Config { message: String, path: String },

    #[error("Config file already exists: {path}")]
    #[diagnostic(
        code(pedalwire::config_exists),
        help("Use `pedalwire config init --force` to overwrite it.")
    )]
    ConfigExists { path: String },

    // ── Output & general ─────────────────────────────────────────────

    #[error("Could not render output: {message}")]
    #[diagnostic(code(pedalwire::render_failed))]
    Render { message: String },

    #[error("IO error: {0}")]
    #[diagnostic(code(pedalwire::io))]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    #[diagnostic(code(pedalwire::error))]
    Other { message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoRadio { .. } | Self::RadioUnavailable { .. } | Self::Bind { .. } => {
                exit_code::CONNECTION
            }
            Self::PermissionDenied { .. } => exit_code::PERMISSION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::DeviceNotFound { .. } => exit_code::NOT_FOUND,
            Self::SessionState { .. } | Self::ConfigExists { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::Config { .. } => exit_code::USAGE,
            Self::Render { .. } | Self::Io(_) | Self::Other { .. } => exit_code::GENERAL,
        }
    }

    /// Attach the config path a loading failure came from.
    pub fn from_config(err: ConfigError, path: &Path) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::Io(e) => Self::Io(e),
            other => Self::Config {
                message: other.to_string(),
                path: path.display().to_string(),
            },
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NoTransportAvailable { message } => Self::NoRadio { message },
            CoreError::HardwareUnavailable { transport, reason } => Self::RadioUnavailable {
                transport: transport.label().into(),
                reason: reason.to_string(),
            },
            CoreError::PermissionDenied { transport } => Self::PermissionDenied {
                transport: transport.label().into(),
            },
            CoreError::Timeout {
                operation,
                timeout_secs,
            } => Self::Timeout {
                operation,
                timeout_secs,
            },
            CoreError::DeviceNotFound { identifier } => Self::DeviceNotFound { identifier },
            e @ (CoreError::SessionAlreadyActive { .. }
            | CoreError::NoActiveSession
            | CoreError::InvalidSessionState { .. }) => Self::SessionState {
                message: e.to_string(),
            },
            CoreError::InvalidRequest { message } => Self::Validation {
                field: "request".into(),
                reason: message,
            },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}
