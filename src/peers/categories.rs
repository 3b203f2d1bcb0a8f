//! Component categories
//!
//! The set of categories is closed. Which target types a category serves,
//! whether it receives assets, how actions become wire envelopes and what its
//! category specific messages mean are all decided here.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::{info, warn};

use crate::notify::OperatorNotification;
use crate::opus::ActionTemplate;

/// Length of generated media entity IDs
const ENTITY_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentCategory {
    Internal,
    Media,
    Inventory,
    LedController,
    Raspberry,
    Myggcheck,
}

/// What a category specific peer message amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum CategoryEffect {
    /// Forward to operators as is
    Notify(OperatorNotification),
    /// Merge into the sending component's state
    StateUpdate(Map<String, Value>),
    /// Hand to the performance for trigger matching. Events carrying a
    /// `dedupe_key` fire at most once per connection.
    Event {
        event: String,
        params: Map<String, Value>,
        dedupe_key: Option<String>,
    },
    /// Nothing further to do
    Handled,
    Unknown,
}

impl ComponentCategory {
    pub const ALL: [ComponentCategory; 6] = [
        Self::Internal,
        Self::Media,
        Self::Inventory,
        Self::LedController,
        Self::Raspberry,
        Self::Myggcheck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Media => "media",
            Self::Inventory => "inventory",
            Self::LedController => "ledController",
            Self::Raspberry => "raspberry",
            Self::Myggcheck => "myggcheck",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.name() == name)
    }

    pub fn target_types(self) -> &'static [&'static str] {
        match self {
            Self::Internal => &["internal"],
            Self::Media => &["image", "video", "web", "audio"],
            Self::Inventory => &["inventory"],
            Self::LedController => &["ledController"],
            Self::Raspberry => &["raspberry"],
            Self::Myggcheck => &["myggcheck"],
        }
    }

    pub fn handles_target(self, target: &str) -> bool {
        self.target_types().contains(&target)
    }

    /// Category serving an action target
    pub fn for_target(target: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.handles_target(target))
    }

    /// Whether assets are pushed to peers of this category
    pub fn sync_assets(self) -> bool {
        matches!(self, Self::Media | Self::Inventory)
    }

    /// Whether remote peers connect for this category
    pub fn has_peers(self) -> bool {
        self != Self::Internal
    }

    /// Wire envelope for an action. `asset_paths` are the paths of the
    /// action's assets, in order.
    pub fn envelope(self, action: &ActionTemplate, asset_paths: &[String]) -> Value {
        let mut envelope = Map::new();
        envelope.insert("command".into(), json!(action.cmd));

        let mut params = action.params.clone();
        if self == Self::Media {
            if action.cmd == "create" && !params.contains_key("entityId") {
                params.insert("entityId".into(), json!(random_entity_id()));
            }
            envelope.insert(
                "entityId".into(),
                params.get("entityId").cloned().unwrap_or(Value::Null),
            );
        }

        envelope.insert("channel".into(), json!(1));
        envelope.insert("type".into(), json!(action.target));
        if self == Self::Media {
            envelope.insert(
                "asset".into(),
                asset_paths.first().map_or(Value::Null, |path| json!(path)),
            );
        }

        envelope.extend(params);
        Value::Object(envelope)
    }

    /// Interpret a category specific message from `component`
    pub fn interpret(self, component: &str, message_type: &str, body: Map<String, Value>) -> CategoryEffect {
        match (self, message_type) {
            (Self::Media, "effect-added") => CategoryEffect::Notify(OperatorNotification::EffectAdded(body)),
            (Self::Media, "effect-changed") => CategoryEffect::Notify(OperatorNotification::EffectChanged(body)),
            (Self::Media, "effect-removed") => CategoryEffect::Notify(OperatorNotification::EffectRemoved {
                entity_id: body.get("entityId").cloned().unwrap_or(Value::Null),
            }),
            (Self::Media, "cmd-error") => {
                let report = Value::Object(body);
                warn!(
                    category = %self,
                    component,
                    error = %report,
                    "Component reported a command error"
                );
                CategoryEffect::Handled
            }
            (Self::Inventory, "items" | "money" | "achievements") => {
                let mut partial = Map::new();
                partial.insert(
                    message_type.to_string(),
                    body.get(message_type).cloned().unwrap_or(Value::Null),
                );
                CategoryEffect::StateUpdate(partial)
            }
            (Self::Inventory, "achievement_reached") => {
                let dedupe_key = body
                    .get("name")
                    .map(|name| name.as_str().map_or_else(|| name.to_string(), str::to_string));
                CategoryEffect::Event {
                    event: message_type.to_string(),
                    params: body,
                    dedupe_key,
                }
            }
            (Self::Raspberry, "pong") => {
                info!(category = %self, component, "pong");
                CategoryEffect::Handled
            }
            _ => CategoryEffect::Unknown,
        }
    }
}

impl fmt::Display for ComponentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn random_entity_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ENTITY_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(target: &str, cmd: &str, params: Value) -> ActionTemplate {
        ActionTemplate {
            id: "a".into(),
            target: target.into(),
            cmd: cmd.into(),
            desc: None,
            assets: vec![],
            params: params.as_object().cloned().unwrap_or_default(),
            subactions: vec![],
        }
    }

    #[test]
    fn test_target_table() {
        assert_eq!(ComponentCategory::for_target("audio"), Some(ComponentCategory::Media));
        assert_eq!(ComponentCategory::for_target("web"), Some(ComponentCategory::Media));
        assert_eq!(ComponentCategory::for_target("internal"), Some(ComponentCategory::Internal));
        assert_eq!(
            ComponentCategory::for_target("ledController"),
            Some(ComponentCategory::LedController)
        );
        assert_eq!(ComponentCategory::for_target("smoke"), None);
    }

    #[test]
    fn test_names_round_trip_through_serde() {
        for category in ComponentCategory::ALL {
            let name = serde_json::to_value(category).unwrap();
            assert_eq!(name, json!(category.name()));
            assert_eq!(ComponentCategory::from_name(category.name()), Some(category));
        }
    }

    #[test]
    fn test_media_create_gets_entity_id() {
        let envelope = ComponentCategory::Media.envelope(&action("video", "create", json!({})), &["intro.mp4".into()]);
        let entity = envelope["entityId"].as_str().unwrap();
        assert_eq!(entity.len(), ENTITY_ID_LEN);
        assert!(entity.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(envelope["asset"], json!("intro.mp4"));
        assert_eq!(envelope["channel"], json!(1));
        assert_eq!(envelope["type"], json!("video"));
    }

    #[test]
    fn test_media_envelope_keeps_given_entity() {
        let envelope = ComponentCategory::Media.envelope(
            &action("audio", "stop", json!({"entityId": "rain", "fade": 2})),
            &[],
        );
        assert_eq!(
            envelope,
            json!({"command": "stop", "entityId": "rain", "channel": 1, "type": "audio", "asset": null, "fade": 2})
        );
    }

    #[test]
    fn test_plain_envelope() {
        let envelope = ComponentCategory::Inventory.envelope(&action("inventory", "add", json!({"item": "key"})), &[]);
        assert_eq!(
            envelope,
            json!({"command": "add", "channel": 1, "type": "inventory", "item": "key"})
        );
    }

    #[test]
    fn test_inventory_messages() {
        let body = json!({"money": 30}).as_object().cloned().unwrap();
        assert_eq!(
            ComponentCategory::Inventory.interpret("inv", "money", body),
            CategoryEffect::StateUpdate(json!({"money": 30}).as_object().cloned().unwrap())
        );

        let body = json!({"name": "explorer"}).as_object().cloned().unwrap();
        match ComponentCategory::Inventory.interpret("inv", "achievement_reached", body) {
            CategoryEffect::Event { event, dedupe_key, .. } => {
                assert_eq!(event, "achievement_reached");
                assert_eq!(dedupe_key.as_deref(), Some("explorer"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_media_effect_removed() {
        let body = json!({"entityId": "rain", "extra": 1}).as_object().cloned().unwrap();
        assert_eq!(
            ComponentCategory::Media.interpret("s1", "effect-removed", body),
            CategoryEffect::Notify(OperatorNotification::EffectRemoved { entity_id: json!("rain") })
        );
    }

    #[test]
    fn test_media_cmd_error_is_logged_only() {
        let body = json!({"cmd": "play", "error": "no such file"}).as_object().cloned().unwrap();
        assert_eq!(
            ComponentCategory::Media.interpret("s1", "cmd-error", body),
            CategoryEffect::Handled
        );
    }

    #[test]
    fn test_unknown_message() {
        assert_eq!(
            ComponentCategory::Myggcheck.interpret("m", "effect-added", Map::new()),
            CategoryEffect::Unknown
        );
    }
}
