use thiserror::Error;
use uuid::Uuid;

use crate::types::Transport;

/// Why a radio cannot be used right now.
///
/// Reported by a [`PermissionProbe`](crate::hal::PermissionProbe) before
/// scanning and by adapters when the hardware stops answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioUnavailable {
    NoRadioPresent,
    PermissionDenied,
    RadioDisabled,
    Unsupported,
    Timeout,
}

impl std::fmt::Display for RadioUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoRadioPresent => "no radio present",
            Self::PermissionDenied => "permission denied",
            Self::RadioDisabled => "radio disabled",
            Self::Unsupported => "operation not supported by the radio",
            Self::Timeout => "radio did not respond in time",
        };
        f.write_str(text)
    }
}

/// Top-level error type for the `pedalwire-radio` crate.
///
/// `pedalwire-core` maps these into its own `CoreError` taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Radio availability ──────────────────────────────────────────
    /// The radio is missing, blocked, or refused the operation.
    #[error("{transport} radio unavailable: {reason}")]
    Unavailable {
        transport: Transport,
        reason: RadioUnavailable,
    },

    /// A bounded wait (connect handshake, stick startup) ran out.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    // ── Hardware operations ─────────────────────────────────────────
    /// The backend rejected an operation for a reason other than availability.
    #[error("{transport} operation failed: {message}")]
    Operation { transport: Transport, message: String },

    /// Peripheral address was never seen by this adapter.
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    // ── Data ────────────────────────────────────────────────────────
    /// A frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn unavailable(transport: Transport, reason: RadioUnavailable) -> Self {
        Self::Unavailable { transport, reason }
    }

    /// The availability reason, if this error is an availability failure.
    pub fn unavailable_reason(&self) -> Option<RadioUnavailable> {
        match self {
            Self::Unavailable { reason, .. } => Some(*reason),
            Self::Timeout { .. } => Some(RadioUnavailable::Timeout),
            _ => None,
        }
    }
}

/// A measurement frame that does not match its profile layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{frame} frame truncated: need {needed} bytes, got {got}")]
    Truncated {
        frame: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("no decoder for characteristic {0}")]
    UnknownCharacteristic(Uuid),

    #[error("no ANT+ profile for device type {0}")]
    UnknownDeviceType(u8),
}
