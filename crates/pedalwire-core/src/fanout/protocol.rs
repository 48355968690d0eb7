// ── Control message wire format ──
//
// JSON text frames. Clients send `ClientMessage`s; the server answers each
// with a `Response` and pushes `Event`s for subscribed topics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResult};
use crate::error::CoreError;
use crate::model::{DeviceId, Topic, UnifiedEvent};

/// Client-chosen correlation id, echoed on the response.
pub type RequestId = serde_json::Value;

/// A message from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Subscribe {
        topic: Topic,
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    Unsubscribe {
        topic: Topic,
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    StartScanning {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    StopScanning {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    ConnectDevice {
        device_id: DeviceId,
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    DisconnectDevice {
        device_id: DeviceId,
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    StartSession {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    StopSession {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    PauseSession {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    ResumeSession {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
    GetStatus {
        #[serde(default)]
        request_id: Option<RequestId>,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Subscribe { request_id, .. }
            | Self::Unsubscribe { request_id, .. }
            | Self::StartScanning { request_id }
            | Self::StopScanning { request_id }
            | Self::ConnectDevice { request_id, .. }
            | Self::DisconnectDevice { request_id, .. }
            | Self::StartSession { request_id, .. }
            | Self::StopSession { request_id }
            | Self::PauseSession { request_id }
            | Self::ResumeSession { request_id }
            | Self::GetStatus { request_id } => request_id.as_ref(),
        }
    }

    /// The aggregator command this message maps to. `None` for
    /// subscription management, which never leaves the fanout.
    pub fn command(&self) -> Option<Command> {
        Some(match self {
            Self::Subscribe { .. } | Self::Unsubscribe { .. } => return None,
            Self::StartScanning { .. } => Command::StartScanning,
            Self::StopScanning { .. } => Command::StopScanning,
            Self::ConnectDevice { device_id, .. } => Command::ConnectDevice {
                id: device_id.clone(),
            },
            Self::DisconnectDevice { device_id, .. } => Command::DisconnectDevice {
                id: device_id.clone(),
            },
            Self::StartSession { name, .. } => Command::StartSession { name: name.clone() },
            Self::StopSession { .. } => Command::StopSession,
            Self::PauseSession { .. } => Command::PauseSession,
            Self::ResumeSession { .. } => Command::ResumeSession,
            Self::GetStatus { .. } => Command::GetStatus,
        })
    }
}

/// A message to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Response {
        request_id: Option<RequestId>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Event {
        topic: Topic,
        event: Arc<UnifiedEvent>,
    },
}

/// Machine-readable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}

impl ServerMessage {
    pub fn ok(request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::Response {
            request_id,
            success: true,
            message: Some(message.into()),
            error: None,
            data: None,
        }
    }

    pub fn failure(request_id: Option<RequestId>, err: &CoreError) -> Self {
        Self::Response {
            request_id,
            success: false,
            message: None,
            error: Some(ErrorBody::from(err)),
            data: None,
        }
    }

    /// Response for a command outcome.
    pub fn from_result(
        request_id: Option<RequestId>,
        result: Result<CommandResult, CoreError>,
    ) -> Self {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return Self::failure(request_id, &e),
        };
        let (message, data) = match outcome {
            CommandResult::Ok => ("ok", Ok(None)),
            CommandResult::Scan(report) => {
                let message = if report.already_scanning {
                    "already scanning"
                } else {
                    "scanning started"
                };
                (message, serde_json::to_value(report).map(Some))
            }
            CommandResult::Device(device) => ("device updated", serde_json::to_value(device).map(Some)),
            CommandResult::Session(session) => {
                ("session updated", serde_json::to_value(session).map(Some))
            }
            CommandResult::Status(status) => ("status", serde_json::to_value(status).map(Some)),
        };
        match data {
            Ok(data) => Self::Response {
                request_id,
                success: true,
                message: Some(message.to_owned()),
                error: None,
                data,
            },
            Err(e) => Self::failure(request_id, &CoreError::Internal(e.to_string())),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response { success: true, .. })
    }
}
