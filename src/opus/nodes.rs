//! Node loading
//!
//! Assigns line numbers, asks a [`ScriptLocator`] where nodes without explicit
//! coordinates sit in the script, and lifts inline actions out of nodes and
//! choices.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{Node, NodeChoice, NodeNext, OpusError};

/// Where a node was found in the script document
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeLocation {
    pub page: u32,
    /// Vertical position as a fraction of the page height
    pub location_on_page: f64,
}

/// Finds nodes in the reference script by line number
pub trait ScriptLocator: Send + Sync {
    /// `wanted` is sorted by line number. Nodes that cannot be found are
    /// simply left out of the result.
    fn locate(&self, script: &[u8], wanted: &[(String, u32)]) -> Vec<(String, NodeLocation)>;
}

/// Locator that never finds anything; positions stay unset
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlocatedScript;

impl ScriptLocator for UnlocatedScript {
    fn locate(&self, _script: &[u8], _wanted: &[(String, u32)]) -> Vec<(String, NodeLocation)> {
        Vec::new()
    }
}

/// Line number from the leading digits of a node ID, e.g. "13a" -> 13
pub fn leading_line_number(id: &str) -> Option<u32> {
    let digits: String = id.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Load nodes and return them with the inline actions they contained
pub fn load_nodes(
    raw: &Map<String, Value>,
    script: &[u8],
    locator: &dyn ScriptLocator,
) -> Result<(BTreeMap<String, Node>, Vec<(String, Value)>), OpusError> {
    let mut nodes = BTreeMap::new();
    let mut inline_actions = Vec::new();

    for (key, value) in raw {
        let node = build_node(key, value, &mut inline_actions)?;
        nodes.insert(key.clone(), node);
    }

    let unplaced: Vec<&String> = nodes
        .iter()
        .filter(|(_, node)| node.pdf_page.is_none() || node.pdf_location_on_page.is_none())
        .map(|(key, _)| key)
        .collect();

    if !unplaced.is_empty() {
        let offenders: Vec<String> = unplaced
            .iter()
            .filter(|key| nodes[key.as_str()].line_number.is_none())
            .map(|key| key.to_string())
            .collect();
        if !offenders.is_empty() {
            return Err(OpusError::MissingLineNumbers(offenders));
        }

        let mut wanted: Vec<(String, u32)> = unplaced
            .iter()
            .filter_map(|key| {
                nodes[key.as_str()]
                    .line_number
                    .map(|line| (key.to_string(), line))
            })
            .collect();
        wanted.sort_by_key(|(_, line)| *line);

        for (key, location) in locator.locate(script, &wanted) {
            if let Some(node) = nodes.get_mut(&key) {
                node.pdf_page = Some(location.page);
                node.pdf_location_on_page = Some(location.location_on_page);
            }
        }
    }

    Ok((nodes, inline_actions))
}

fn build_node(
    key: &str,
    value: &Value,
    inline_actions: &mut Vec<(String, Value)>,
) -> Result<Node, OpusError> {
    let context = format!("node '{key}'");
    let entry = value
        .as_object()
        .ok_or_else(|| OpusError::malformed(&context, "must be a mapping"))?;

    let line_number = match entry.get("lineNumber") {
        Some(line) => Some(
            line.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| OpusError::malformed(&context, "'lineNumber' must be a positive integer"))?,
        ),
        None => leading_line_number(key),
    };

    let next = match entry.get("next") {
        None | Some(Value::Null) => None,
        Some(Value::String(target)) => Some(NodeNext::Linear(target.clone())),
        Some(Value::Array(choices)) => {
            let mut parsed = Vec::with_capacity(choices.len());
            for (i, choice) in choices.iter().enumerate() {
                parsed.push(build_choice(key, i, choice, inline_actions)?);
            }
            Some(NodeNext::Choices(parsed))
        }
        Some(_) => {
            return Err(OpusError::malformed(
                &context,
                "'next' must be a node ID or a list of choices",
            ))
        }
    };

    let actions = lift_actions(
        entry.get("actions"),
        &context,
        |i| format!("{key}_action_{i}"),
        inline_actions,
    )?;

    Ok(Node {
        next,
        prompt: entry
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        pdf_page: entry
            .get("pdfPage")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        pdf_location_on_page: entry.get("pdfLocationOnPage").and_then(Value::as_f64),
        actions,
        line_number,
    })
}

fn build_choice(
    key: &str,
    index: usize,
    value: &Value,
    inline_actions: &mut Vec<(String, Value)>,
) -> Result<NodeChoice, OpusError> {
    let context = format!("node '{key}' choice {index}");
    let entry = value
        .as_object()
        .ok_or_else(|| OpusError::malformed(&context, "must be a mapping"))?;
    let node = entry
        .get("node")
        .and_then(Value::as_str)
        .ok_or_else(|| OpusError::missing(&context, "node"))?
        .to_string();
    let description = entry
        .get("description")
        .and_then(Value::as_str)
        .ok_or_else(|| OpusError::missing(&context, "description"))?
        .to_string();
    let actions = lift_actions(
        entry.get("actions"),
        &context,
        |j| format!("{key}_choice_{index}_action_{j}"),
        inline_actions,
    )?;
    Ok(NodeChoice {
        node,
        description,
        actions,
    })
}

/// Action ID list where inline definitions are replaced by generated IDs
pub(crate) fn lift_actions(
    value: Option<&Value>,
    context: &str,
    make_id: impl Fn(usize) -> String,
    inline_actions: &mut Vec<(String, Value)>,
) -> Result<Vec<String>, OpusError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => return Err(OpusError::malformed(context, "'actions' must be a list")),
    };

    let mut ids = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::String(id) => ids.push(id.clone()),
            Value::Object(_) | Value::Array(_) => {
                let id = make_id(i);
                inline_actions.push((id.clone(), item.clone()));
                ids.push(id);
            }
            _ => {
                return Err(OpusError::malformed(
                    context,
                    "actions must be IDs or inline definitions",
                ))
            }
        }
    }
    Ok(ids)
}
