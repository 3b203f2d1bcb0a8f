//! Component peers
//!
//! Physical and software components connect over websockets, one connection
//! per component instance, grouped by [`ComponentCategory`]. Each category
//! has one [`ComponentRegistry`] that tracks its connections, keeps their
//! assets in sync and fans commands out to them.

pub mod categories;
pub mod internal;
pub mod protocol;
pub mod registry;

pub use categories::{CategoryEffect, ComponentCategory};
pub use protocol::{PeerMessage, ProtocolError, ServerCommand};
pub use registry::{ComponentRegistry, ConnectionId};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::opus::ActionTemplate;

/// Self-reported identity of one component instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    pub component_id: String,
    #[serde(default)]
    pub component_name: String,
    #[serde(default)]
    pub status: String,
}

/// An event reported by a component, matched against opus triggers
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentEvent {
    pub target: String,
    pub event: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("connection to {peer} is closed")]
    ConnectionClosed { peer: String },

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{peer} rejected the command: {reason}")]
    Rejected { peer: String, reason: String },
}

/// Result of delivering one command to one peer
#[derive(Debug)]
pub struct PeerOutcome {
    /// Component ID, or the connection ID for peers that never registered
    pub peer: String,
    pub result: Result<(), DispatchError>,
}

impl PeerOutcome {
    pub fn ok(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            result: Ok(()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Something that executes actions for one component category
#[async_trait::async_trait]
pub trait ComponentHandler: Send + Sync {
    fn category(&self) -> ComponentCategory;

    fn can_handle(&self, target: &str) -> bool {
        self.category().handles_target(target)
    }

    /// Live instances; zero means actions for this category go unhandled
    async fn nof_instances(&self) -> usize;

    /// Deliver an action to every live instance
    async fn handle_action(&self, action: &ActionTemplate) -> Vec<PeerOutcome>;

    /// `None` when no component with that ID is registered
    async fn reset_component(&self, component_id: &str) -> Option<PeerOutcome>;

    async fn restart_component(&self, component_id: &str) -> Option<PeerOutcome>;

    async fn connected_components(&self) -> Vec<ComponentInfo>;
}
