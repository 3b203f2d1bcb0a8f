//! Commands handled by the show itself
//!
//! The internal category has no connections; it always counts as exactly one
//! live instance.

use serde_json::Value;
use tracing::{info, warn};

use crate::opus::ActionTemplate;

#[derive(Debug, Clone, PartialEq)]
pub enum InternalCommand {
    Print(String),
    GotoNode(String),
    Nop,
    Unknown(String),
}

impl InternalCommand {
    pub fn from_action(action: &ActionTemplate) -> Self {
        match action.cmd.as_str() {
            "print" => Self::Print(
                action
                    .params
                    .get("text")
                    .map(|text| match text {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "<no text>".to_string()),
            ),
            "goto-node" => match action.params.get("node") {
                Some(Value::String(node)) => Self::GotoNode(node.clone()),
                Some(node) => Self::GotoNode(node.to_string()),
                None => Self::Unknown("goto-node without 'node'".to_string()),
            },
            "nop" => Self::Nop,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Log what this command does; returns the node to move to, if any
    pub fn run(self, action_id: &str) -> Option<String> {
        match self {
            Self::Print(text) => {
                info!(action_id, "{}", text);
                None
            }
            Self::GotoNode(node) => Some(node),
            Self::Nop => None,
            Self::Unknown(cmd) => {
                warn!(action_id, cmd = %cmd, "Unhandled internal command");
                None
            }
        }
    }
}
