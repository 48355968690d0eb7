// ── Core error types ──
//
// User-facing errors from pedalwire-core. Consumers never see raw radio
// backend failures; the `From<pedalwire_radio::Error>` impl translates
// them into domain variants.

use pedalwire_radio::{RadioUnavailable, Transport};
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Hardware errors ──────────────────────────────────────────────
    #[error("{} radio unavailable: {reason}", transport.label())]
    HardwareUnavailable {
        transport: Transport,
        reason: RadioUnavailable,
    },

    #[error("Permission denied for {} radio", transport.label())]
    PermissionDenied { transport: Transport },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Could not decode sensor frame: {message}")]
    ProtocolDecode { message: String },

    #[error("{} operation failed: {message}", transport.label())]
    TransportOperationFailed { transport: Transport, message: String },

    #[error("No radio available: {message}")]
    NoTransportAvailable { message: String },

    // ── Device errors ────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    // ── Session errors ───────────────────────────────────────────────
    #[error("A session is already in progress ({id})")]
    SessionAlreadyActive { id: Uuid },

    #[error("No session in progress")]
    NoActiveSession,

    #[error("Session is {actual}, expected {expected}")]
    InvalidSessionState {
        expected: &'static str,
        actual: String,
    },

    // ── Storage / configuration ──────────────────────────────────────
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code, used in control-surface responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HardwareUnavailable { .. } => "hardware_unavailable",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Timeout { .. } => "timeout",
            Self::ProtocolDecode { .. } => "protocol_decode",
            Self::TransportOperationFailed { .. } => "transport_operation_failed",
            Self::NoTransportAvailable { .. } => "no_transport_available",
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::SessionAlreadyActive { .. } => "session_already_active",
            Self::NoActiveSession => "no_active_session",
            Self::InvalidSessionState { .. } => "invalid_session_state",
            Self::Persistence { .. } => "persistence",
            Self::Config { .. } => "config",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Internal(_) => "internal",
        }
    }
}

// ── Conversion from radio-layer errors ───────────────────────────────

impl From<pedalwire_radio::Error> for CoreError {
    fn from(err: pedalwire_radio::Error) -> Self {
        use pedalwire_radio::Error as RadioError;

        match err {
            RadioError::Unavailable {
                transport,
                reason: RadioUnavailable::PermissionDenied,
            } => CoreError::PermissionDenied { transport },
            RadioError::Unavailable { transport, reason } => {
                CoreError::HardwareUnavailable { transport, reason }
            }
            RadioError::Timeout {
                operation,
                timeout_secs,
            } => CoreError::Timeout {
                operation: operation.into(),
                timeout_secs,
            },
            RadioError::Operation { transport, message } => {
                CoreError::TransportOperationFailed { transport, message }
            }
            RadioError::UnknownPeripheral(identifier) => CoreError::DeviceNotFound { identifier },
            RadioError::Decode(e) => CoreError::ProtocolDecode {
                message: e.to_string(),
            },
        }
    }
}
