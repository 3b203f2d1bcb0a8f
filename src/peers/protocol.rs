//! Peer wire protocol
//!
//! One JSON object per websocket text frame.
//!
//! Server → peer frames carry a `command` discriminator:
//! - `req_component_info` - ask the peer to identify itself
//! - `report_checksums` - ask for the checksums of files the peer holds
//! - `file` - asset contents, `{path, data}` with base64 data
//! - `reset` / `restart`
//! - category envelopes built from actions
//!
//! Peer → server frames carry a `messageType` discriminator:
//! - `heartbeat`
//! - `component_info` - `{componentId, componentName, status}`
//! - `log-message` - `{level, msg}`
//! - `file_checksums` - `{files: {path: checksum}}`
//! - anything else is category specific

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::ComponentInfo;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerCommand {
    ReqComponentInfo,
    ReportChecksums,
    File { path: String, data: String },
    Reset,
    Restart,
}

impl ServerCommand {
    /// `file` frame carrying base64-encoded contents
    pub fn file(path: impl Into<String>, contents: &[u8]) -> Self {
        use base64::Engine;
        Self::File {
            path: path.into(),
            data: base64::engine::general_purpose::STANDARD.encode(contents),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Heartbeat,
    ComponentInfo(ComponentInfo),
    LogMessage { level: String, msg: String },
    FileChecksums { files: HashMap<String, String> },
    /// Category specific message, `body` without the `messageType` key
    Category {
        message_type: String,
        body: Map<String, Value>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string 'messageType'")]
    MissingMessageType,

    #[error("malformed '{message_type}' message: {source}")]
    Malformed {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PeerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut body: Map<String, Value> = serde_json::from_str(text)?;
        let message_type = match body.remove("messageType") {
            Some(Value::String(message_type)) => message_type,
            _ => return Err(ProtocolError::MissingMessageType),
        };

        match message_type.as_str() {
            "heartbeat" => Ok(Self::Heartbeat),
            "component_info" => serde_json::from_value(Value::Object(body))
                .map(Self::ComponentInfo)
                .map_err(|source| malformed(&message_type, source)),
            "log-message" => {
                let level = body
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let msg = match body.remove("msg") {
                    Some(Value::String(msg)) => msg,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(Self::LogMessage { level, msg })
            }
            "file_checksums" => {
                let files = body.remove("files").unwrap_or(Value::Object(Map::new()));
                serde_json::from_value(files)
                    .map(|files| Self::FileChecksums { files })
                    .map_err(|source| malformed(&message_type, source))
            }
            _ => Ok(Self::Category {
                message_type,
                body,
            }),
        }
    }
}

fn malformed(message_type: &str, source: serde_json::Error) -> ProtocolError {
    ProtocolError::Malformed {
        message_type: message_type.to_string(),
        source,
    }
}
