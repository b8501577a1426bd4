pub mod channel;

pub use channel::*;

use crate::sandbox::permissions::{Capability, CapabilityDetails, CapabilityRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from the supervisor into the isolated context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Render {
        code: String,
        #[serde(default)]
        props: Value,
    },
    UpdateProps {
        #[serde(default)]
        props: Value,
    },
    CapabilityResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostMessage {
    pub fn response(id: impl Into<String>, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => HostMessage::CapabilityResponse {
                id: id.into(),
                result: Some(result),
                error: None,
            },
            Err(error) => HostMessage::CapabilityResponse {
                id: id.into(),
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Which step of a render failed. Optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Compile,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ErrorPhase>,
}

/// Frames sent from the isolated context to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GuestMessage {
    Ready,
    Rendered,
    Error {
        error: ErrorPayload,
    },
    CapabilityRequest {
        id: String,
        capability: Capability,
        #[serde(default)]
        details: Value,
    },
}

impl GuestMessage {
    pub fn request(request: &CapabilityRequest) -> Self {
        GuestMessage::CapabilityRequest {
            id: request.id.clone(),
            capability: request.capability(),
            details: request.details.to_value(),
        }
    }
}

/// Decodes `capability`/`details` of a request frame into the typed request.
pub fn typed_request(
    id: String,
    capability: Capability,
    details: Value,
) -> Result<CapabilityRequest, IpcError> {
    let details = CapabilityDetails::from_value(capability, details).map_err(|e| {
        IpcError::MalformedFrame(format!("invalid {capability} details: {e}"))
    })?;
    Ok(CapabilityRequest::with_id(id, details))
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, IpcError> {
    serde_json::to_string(message).map_err(|e| IpcError::SerializationError(e.to_string()))
}

pub fn decode_host(frame: &str) -> Result<HostMessage, IpcError> {
    serde_json::from_str(frame).map_err(|e| IpcError::MalformedFrame(e.to_string()))
}

pub fn decode_guest(frame: &str) -> Result<GuestMessage, IpcError> {
    serde_json::from_str(frame).map_err(|e| IpcError::MalformedFrame(e.to_string()))
}

/// Recovers the request id from a capability frame that failed to decode.
pub fn salvage_request_id(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    if value.get("type")?.as_str()? != "capabilityRequest" {
        return None;
    }
    value.get("id")?.as_str().map(str::to_string)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Transport error: {0}")]
    Transport(String),
}
