//! Event trigger matching

use serde_json::{Map, Value};

use crate::opus::{EventTrigger, ParamMatch};

/// Match a trigger pattern against a value.
///
/// `any` matches every present value, `a|b|c` matches any alternative, and
/// anything else must be equal. Non-string values compare by their JSON text.
pub fn pattern_matches(pattern: &str, value: Option<&Value>) -> bool {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return false;
    };
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if pattern == "any" {
        return true;
    }
    if pattern.contains('|') {
        return pattern.split('|').any(|alternative| alternative == text);
    }
    pattern == text
}

fn param_matches(rule: &ParamMatch, params: &Map<String, Value>) -> bool {
    pattern_matches(&rule.value, params.get(&rule.param)) != rule.invert
}

/// Whether a component event fires `trigger`
pub fn trigger_matches(
    trigger: &EventTrigger,
    target: &str,
    event: &str,
    params: &Map<String, Value>,
) -> bool {
    trigger.target == target
        && pattern_matches(&trigger.event, Some(&Value::String(event.to_string())))
        && trigger.params.iter().all(|rule| param_matches(rule, params))
}
