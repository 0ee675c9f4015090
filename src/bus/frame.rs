//! Outer wire frame shared by the subprocess and WebSocket transports:
//! `{type: "message" | "api_call" | "api_response", payload, echo?}`.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Message,
    ApiCall,
    ApiResponse,
}

/// One frame on the duplex adapter channel. `echo` correlates an
/// `api_call` with its `api_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,
}

impl WireFrame {
    pub fn message(payload: serde_json::Value) -> Self {
        Self {
            kind: FrameKind::Message,
            payload,
            echo: None,
        }
    }

    pub fn api_call(action: &str, params: serde_json::Value, echo: String) -> Self {
        Self {
            kind: FrameKind::ApiCall,
            payload: serde_json::json!({"action": action, "params": params}),
            echo: Some(echo),
        }
    }

    pub fn api_response(payload: serde_json::Value, echo: String) -> Self {
        Self {
            kind: FrameKind::ApiResponse,
            payload,
            echo: Some(echo),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|error| BusError::BadEnvelope(format!("frame encode failed: {error}")).into())
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|error| BusError::BadEnvelope(format!("malformed frame: {error}")).into())
    }
}
