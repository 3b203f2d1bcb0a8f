//! Operator UI shortcuts

use serde_json::Value;

use super::nodes::lift_actions;
use super::{OpusError, UiConfig, UiShortcut};

/// Normalized hotkey, e.g. `ctrl+shift+K`
pub fn shortcut_key(hotkey: &Value) -> Option<String> {
    let key = hotkey.get("key")?.as_str()?;
    let mut modifiers: Vec<&str> = hotkey
        .get("modifiers")
        .and_then(Value::as_array)
        .map(|mods| mods.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if modifiers.is_empty() {
        return Some(key.to_string());
    }

    modifiers.sort_unstable();
    let key = if modifiers.contains(&"shift") {
        key.to_uppercase()
    } else {
        key.to_string()
    };
    Some(format!("{}+{}", modifiers.join("+"), key))
}

/// Load the `ui` section, lifting inline shortcut actions
pub fn load_ui_config(
    raw: Option<&Value>,
) -> Result<(UiConfig, Vec<(String, Value)>), OpusError> {
    let mut inline_actions = Vec::new();
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok((UiConfig::default(), inline_actions));
    };

    let shortcuts = match raw.get("shortcuts") {
        None | Some(Value::Null) => return Ok((UiConfig::default(), inline_actions)),
        Some(Value::Array(shortcuts)) => shortcuts,
        Some(_) => return Err(OpusError::malformed("ui", "'shortcuts' must be a list")),
    };

    let mut parsed = Vec::with_capacity(shortcuts.len());
    for (i, shortcut) in shortcuts.iter().enumerate() {
        let context = format!("ui shortcut {i}");
        let title = shortcut
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| OpusError::missing(&context, "title"))?
            .to_string();
        let hotkey = shortcut.get("hotkey").and_then(shortcut_key);
        let actions = lift_actions(
            Some(shortcut.get("actions").ok_or_else(|| OpusError::missing(&context, "actions"))?),
            &context,
            |j| format!("ui_shortcut_{i}_action_{j}"),
            &mut inline_actions,
        )
        .map_err(|_| OpusError::malformed(&context, "illegal action type in shortcut"))?;

        parsed.push(UiShortcut {
            title,
            actions,
            hotkey,
        });
    }

    Ok((UiConfig { shortcuts: parsed }, inline_actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shortcut_key_plain() {
        assert_eq!(shortcut_key(&json!({"key": "x"})), Some("x".into()));
    }

    #[test]
    fn test_shortcut_key_sorted_modifiers_and_shift() {
        let hotkey = json!({"key": "k", "modifiers": ["shift", "ctrl"]});
        assert_eq!(shortcut_key(&hotkey), Some("ctrl+shift+K".into()));
    }

    #[test]
    fn test_load_shortcuts_with_inline_action() {
        let raw = json!({
            "shortcuts": [
                {"title": "Blackout", "hotkey": {"key": "b"}, "actions": ["lights_off", {"target": "internal", "cmd": "print"}]}
            ]
        });
        let (config, inline) = load_ui_config(Some(&raw)).unwrap();
        assert_eq!(config.shortcuts[0].title, "Blackout");
        assert_eq!(config.shortcuts[0].hotkey.as_deref(), Some("b"));
        assert_eq!(config.shortcuts[0].actions, vec!["lights_off", "ui_shortcut_0_action_1"]);
        assert_eq!(inline[0].0, "ui_shortcut_0_action_1");
    }

    #[test]
    fn test_illegal_shortcut_action() {
        let raw = json!({"shortcuts": [{"title": "Bad", "actions": [42]}]});
        assert!(load_ui_config(Some(&raw)).is_err());
    }

    #[test]
    fn test_absent_ui() {
        let (config, inline) = load_ui_config(None).unwrap();
        assert!(config.shortcuts.is_empty());
        assert!(inline.is_empty());
    }
}
