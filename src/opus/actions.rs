//! Action expansion
//!
//! Raw action entries come in four shapes:
//!
//! - a mapping with `target`/`cmd`: a plain action
//! - a list: a pure composite, each element becomes a subaction `<key>_<n>`
//! - a mapping with both `actions` and `parameters`: a parametrized template,
//!   never an action on its own
//! - a mapping with `action` and `parameters`: an invocation of a template
//!
//! Inline asset definitions inside an action's `assets` list are lifted out
//! under `<action>_asset_<i>`.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::path::ValuePath;
use super::{ActionTemplate, OpusError};

/// Output of action expansion
#[derive(Debug, Default)]
pub struct CompiledActions {
    pub actions: BTreeMap<String, ActionTemplate>,
    /// Asset definitions lifted out of actions, in discovery order
    pub inline_assets: Vec<(String, Value)>,
}

/// Whether a raw entry is a parametrized template rather than an action
pub fn is_parametrized_template(value: &Value) -> bool {
    value.get("actions").is_some() && value.get("parameters").is_some()
}

/// Expand every raw action entry into a concrete [`ActionTemplate`]
pub fn compile_actions(raw: &Map<String, Value>) -> Result<CompiledActions, OpusError> {
    let mut compiler = ActionCompiler::new(raw);
    for key in raw.keys() {
        if compiler.templates.contains_key(key.as_str()) {
            continue;
        }
        compiler.resolve(key, key)?;
    }
    Ok(CompiledActions {
        actions: compiler.compiled,
        inline_assets: compiler.inline_assets,
    })
}

struct ActionCompiler<'a> {
    raw: &'a Map<String, Value>,
    templates: HashMap<&'a str, &'a Value>,
    compiled: BTreeMap<String, ActionTemplate>,
    in_progress: HashSet<String>,
    /// Next synthetic subaction index per prefix
    counters: HashMap<String, usize>,
    inline_assets: Vec<(String, Value)>,
}

impl<'a> ActionCompiler<'a> {
    fn new(raw: &'a Map<String, Value>) -> Self {
        let templates = raw
            .iter()
            .filter(|(_, value)| is_parametrized_template(value))
            .map(|(key, value)| (key.as_str(), value))
            .collect();
        Self {
            raw,
            templates,
            compiled: BTreeMap::new(),
            in_progress: HashSet::new(),
            counters: HashMap::new(),
            inline_assets: Vec::new(),
        }
    }

    /// Compiled action for `key`, compiling it on first use.
    ///
    /// `referrer` names the action that asked, for error reporting.
    fn resolve(&mut self, key: &str, referrer: &str) -> Result<ActionTemplate, OpusError> {
        if let Some(action) = self.compiled.get(key) {
            return Ok(action.clone());
        }
        if self.in_progress.contains(key) {
            return Err(OpusError::ActionCycle(key.to_string()));
        }
        let raw_map = self.raw;
        let raw = match raw_map.get(key) {
            Some(value) if !self.templates.contains_key(key) => value,
            _ => {
                return Err(OpusError::UnknownAction {
                    action: referrer.to_string(),
                    name: key.to_string(),
                })
            }
        };

        self.in_progress.insert(key.to_string());
        let action = self.compile_entry(key, raw)?;
        self.in_progress.remove(key);

        self.compiled.insert(key.to_string(), action.clone());
        Ok(action)
    }

    fn compile_entry(&mut self, key: &str, raw: &Value) -> Result<ActionTemplate, OpusError> {
        match raw {
            Value::Array(items) => {
                let subactions = self.compile_subactions(key, key, items)?;
                Ok(ActionTemplate::composite(key, subactions))
            }
            Value::Object(entry) if entry.contains_key("action") => self.instantiate(key, entry),
            Value::Object(_) => self.create_action(key, raw),
            _ => Err(OpusError::malformed(
                format!("action '{key}'"),
                "must be a mapping or a list",
            )),
        }
    }

    /// Subactions of a composite; synthetic IDs are `<prefix>_<n>`
    fn compile_subactions(
        &mut self,
        owner: &str,
        prefix: &str,
        items: &[Value],
    ) -> Result<Vec<ActionTemplate>, OpusError> {
        let mut index = self.counters.get(prefix).copied().unwrap_or(1);
        let mut subactions = Vec::with_capacity(items.len());
        for item in items {
            let subaction = match item {
                Value::String(name) => self.resolve(name, owner)?,
                Value::Object(_) => self.create_action(&format!("{prefix}_{index}"), item)?,
                _ => {
                    return Err(OpusError::malformed(
                        format!("action '{owner}'"),
                        "subactions must be names or mappings",
                    ))
                }
            };
            subactions.push(subaction);
            index += 1;
        }
        self.counters.insert(prefix.to_string(), index);
        Ok(subactions)
    }

    /// Fill a parametrized template with an invocation's parameters
    fn instantiate(
        &mut self,
        key: &str,
        invocation: &Map<String, Value>,
    ) -> Result<ActionTemplate, OpusError> {
        let template_name = invocation
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| OpusError::malformed(format!("action '{key}'"), "'action' must be a string"))?;
        let template = *self
            .templates
            .get(template_name)
            .ok_or_else(|| OpusError::UnknownTemplate(template_name.to_string()))?;

        let empty = Map::new();
        let supplied = invocation
            .get("parameters")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut actions = template["actions"].clone();
        if let Some(parameters) = template["parameters"].as_object() {
            for (parameter, rules) in parameters {
                let value = supplied.get(parameter).ok_or_else(|| OpusError::MissingParameter {
                    action: key.to_string(),
                    parameter: parameter.clone(),
                })?;
                actions = substitute(actions, parameter, value, rules)?;
            }
        }

        let items = actions.as_array().ok_or_else(|| {
            OpusError::malformed(
                format!("template '{template_name}'"),
                "'actions' must be a list",
            )
        })?;
        let subactions = self.compile_subactions(key, template_name, items)?;
        Ok(ActionTemplate::composite(key, subactions))
    }

    /// Build a plain action, lifting inline assets
    fn create_action(&mut self, key: &str, raw: &Value) -> Result<ActionTemplate, OpusError> {
        let context = format!("action '{key}'");
        let entry = raw
            .as_object()
            .ok_or_else(|| OpusError::malformed(&context, "must be a mapping"))?;

        let target = required_str(entry, "target", &context)?;
        let cmd = required_str(entry, "cmd", &context)?;
        let desc = entry.get("desc").and_then(Value::as_str).map(str::to_string);

        let mut assets = Vec::new();
        if let Some(listed) = entry.get("assets") {
            let listed = listed
                .as_array()
                .ok_or_else(|| OpusError::malformed(&context, "'assets' must be a list"))?;
            for (i, asset) in listed.iter().enumerate() {
                match asset {
                    Value::String(id) => assets.push(id.clone()),
                    Value::Object(_) => {
                        let id = format!("{key}_asset_{i}");
                        self.inline_assets.push((id.clone(), asset.clone()));
                        assets.push(id);
                    }
                    _ => {
                        return Err(OpusError::malformed(
                            &context,
                            "assets must be names or mappings",
                        ))
                    }
                }
            }
        }

        let params = match entry.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => return Err(OpusError::malformed(&context, "'params' must be a mapping")),
        };

        Ok(ActionTemplate {
            id: key.to_string(),
            target,
            cmd,
            desc,
            assets,
            params,
            subactions: Vec::new(),
        })
    }
}

/// Apply every substitution rule of one parameter to a template's action list
fn substitute(
    actions: Value,
    parameter: &str,
    value: &Value,
    rules: &Value,
) -> Result<Value, OpusError> {
    let placeholder = format!("${parameter}");
    let replacement = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let rules = rules.as_array().ok_or_else(|| {
        OpusError::malformed(format!("parameter '{parameter}'"), "must list its paths")
    })?;

    let mut actions = actions;
    for rule in rules {
        let raw_path = rule.get("path").and_then(Value::as_str).ok_or_else(|| {
            OpusError::missing(format!("parameter '{parameter}'"), "path")
        })?;
        let path = ValuePath::parse(raw_path)?;
        if path.find(&actions).is_empty() {
            return Err(OpusError::InvalidParameterPath {
                parameter: parameter.to_string(),
                path: raw_path.to_string(),
            });
        }
        actions = path.update(actions, |current| match current {
            Value::String(s) if s.contains(&placeholder) => {
                Value::String(s.replace(&placeholder, &replacement))
            }
            _ => value.clone(),
        });
    }
    Ok(actions)
}

fn required_str(entry: &Map<String, Value>, key: &str, context: &str) -> Result<String, OpusError> {
    match entry.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(OpusError::malformed(context, format!("'{key}' must be a string"))),
        None => Err(OpusError::missing(context, key)),
    }
}
