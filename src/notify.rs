//! Operator notification hub
//!
//! Registries and the show loop publish [`OperatorNotification`]s here; every
//! connected operator UI holds its own receiver. Publishing never blocks and
//! never fails, even with no operator connected.
//!
//! Frames on the wire look like:
//!
//! ```json
//! {"messageType": "history", "data": ["11", "160"]}
//! {"messageType": "component-removed", "data": {"category": "media", "componentId": "screen-1"}}
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::peers::{ComponentCategory, ComponentInfo};

/// Pending notifications kept per slow operator before it starts lagging
const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "messageType", content = "data", rename_all = "kebab-case")]
pub enum OperatorNotification {
    /// Full history after any change, most recent node last
    History(Vec<String>),
    EffectAdded(Map<String, Value>),
    EffectChanged(Map<String, Value>),
    #[serde(rename_all = "camelCase")]
    EffectRemoved { entity_id: Value },
    #[serde(rename_all = "camelCase")]
    ComponentInfoUpdated {
        category: ComponentCategory,
        component_id: String,
        info: ComponentInfo,
    },
    #[serde(rename_all = "camelCase")]
    ComponentStateUpdated {
        category: ComponentCategory,
        component_id: String,
        state: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    ComponentRemoved {
        category: ComponentCategory,
        component_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LogMessage {
        timestamp: String,
        category: ComponentCategory,
        component_id: Option<String>,
        level: String,
        msg: String,
    },
}

/// Fan-out point for operator notifications
#[derive(Debug, Clone)]
pub struct OperatorHub {
    sender: broadcast::Sender<OperatorNotification>,
}

impl OperatorHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorNotification> {
        self.sender.subscribe()
    }

    pub fn broadcast(&self, notification: OperatorNotification) {
        // No operator connected is fine
        if self.sender.send(notification).is_err() {
            debug!("No operator listening, notification dropped");
        }
    }
}

impl Default for OperatorHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as RFC 3339
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_wire_format() {
        let frame = serde_json::to_value(OperatorNotification::History(vec!["11".into(), "160".into()])).unwrap();
        assert_eq!(frame, json!({"messageType": "history", "data": ["11", "160"]}));
    }

    #[test]
    fn test_component_removed_wire_format() {
        let frame = serde_json::to_value(OperatorNotification::ComponentRemoved {
            category: ComponentCategory::Media,
            component_id: "screen-1".into(),
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({"messageType": "component-removed", "data": {"category": "media", "componentId": "screen-1"}})
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let hub = OperatorHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.broadcast(OperatorNotification::History(vec!["1".into()]));

        assert_eq!(first.recv().await.unwrap(), OperatorNotification::History(vec!["1".into()]));
        assert_eq!(second.recv().await.unwrap(), OperatorNotification::History(vec!["1".into()]));
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        OperatorHub::new().broadcast(OperatorNotification::History(vec![]));
    }
}
