//! Opus - the compiled show definition
//!
//! An opus is built once from a YAML source document and then shared
//! read-only by the performance and every component registry.
//!
//! Compilation pipeline:
//! 1. Read the source and the mandatory `script` asset
//! 2. Load nodes: assign line numbers, locate them in the script, lift inline actions
//! 3. Load UI shortcuts, lifting their inline actions
//! 4. Expand actions (composites, parametrized templates, inline assets)
//! 5. Load assets and compute which target types use them
//! 6. Validate references between nodes, actions and assets

pub mod actions;
pub mod assets;
pub mod nodes;
pub mod path;
pub mod ui;
pub mod validate;

pub use nodes::{NodeLocation, ScriptLocator, UnlocatedScript};
pub use path::{PathError, ValuePath};
pub use validate::{validate_references, ValidationReport};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// ID of the asset holding the reference script
pub const SCRIPT_ASSET: &str = "script";

/// A named resource destined for one or more component categories
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asset {
    pub path: String,
    /// Raw bytes, absent for remote assets or when preloading is disabled
    #[serde(skip)]
    pub data: Option<Arc<[u8]>>,
    /// Content hash of `data`, present iff `data` is
    pub checksum: Option<String>,
    pub targets: BTreeSet<String>,
}

/// A command triggered by a node, a choice, a shortcut or a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: String,
    pub target: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Executed in order after the action's own effect
    #[serde(default)]
    pub subactions: Vec<ActionTemplate>,
}

impl ActionTemplate {
    /// A pure composite: no effect of its own, only subactions
    pub fn composite(id: impl Into<String>, subactions: Vec<ActionTemplate>) -> Self {
        let desc = subactions
            .iter()
            .map(ActionTemplate::description)
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            id: id.into(),
            target: "internal".to_string(),
            cmd: "nop".to_string(),
            desc: Some(desc),
            assets: Vec::new(),
            params: Map::new(),
            subactions,
        }
    }

    /// Explicit description, or one derived from target and command
    pub fn description(&self) -> String {
        if let Some(desc) = &self.desc {
            return desc.clone();
        }
        match self.params.get("entityId") {
            Some(Value::String(entity)) => format!("{}:{} {}", self.target, self.cmd, entity),
            Some(entity) => format!("{}:{} {}", self.target, self.cmd, entity),
            None => format!("{}:{}", self.target, self.cmd),
        }
    }
}

/// One branch leaving a choice node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChoice {
    pub node: String,
    pub description: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeNext {
    Linear(String),
    Choices(Vec<NodeChoice>),
}

/// A single position in the script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub next: Option<NodeNext>,
    pub prompt: String,
    pub pdf_page: Option<u32>,
    pub pdf_location_on_page: Option<f64>,
    #[serde(default)]
    pub actions: Vec<String>,
    pub line_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiShortcut {
    pub title: String,
    pub actions: Vec<String>,
    pub hotkey: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UiConfig {
    pub shortcuts: Vec<UiShortcut>,
}

/// A parameter condition on a component event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMatch {
    pub param: String,
    /// `any`, `a|b|c` alternatives, or an exact value
    pub value: String,
    #[serde(default)]
    pub invert: bool,
}

/// Fires actions when a component reports a matching event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub target: String,
    pub event: String,
    #[serde(default)]
    pub params: Vec<ParamMatch>,
    pub actions: Vec<String>,
}

/// Everything required for a performance
#[derive(Debug, Clone, PartialEq)]
pub struct Opus {
    pub nodes: BTreeMap<String, Node>,
    pub action_templates: BTreeMap<String, ActionTemplate>,
    pub assets: BTreeMap<String, Asset>,
    pub ui_config: UiConfig,
    pub triggers: Vec<EventTrigger>,
    pub start_node: String,
    pub script: Vec<u8>,
}

/// Load-time switches
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Read asset bytes and compute checksums for local assets
    pub read_asset_data: bool,
    /// Treat validation findings as fatal
    pub exit_on_validation_failure: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            read_asset_data: true,
            exit_on_validation_failure: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpusError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse opus: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{context} is missing required key '{key}'")]
    MissingKey { context: String, key: String },

    #[error("{context}: {reason}")]
    Malformed { context: String, reason: String },

    #[error("asset 'script' not found, it is required")]
    MissingScript,

    #[error("nodes without specified PDF locations must have IDs beginning with numbers, or a defined lineNumber. Offenders: {0:?}")]
    MissingLineNumbers(Vec<String>),

    #[error("could not find parametrized action template '{0}'")]
    UnknownTemplate(String),

    #[error("action '{action}' refers to unknown action '{name}'")]
    UnknownAction { action: String, name: String },

    #[error("action '{0}' is part of a reference cycle")]
    ActionCycle(String),

    #[error("action '{action}' does not supply parameter '{parameter}'")]
    MissingParameter { action: String, parameter: String },

    #[error("invalid path for parameter '{parameter}': {path}")]
    InvalidParameterPath { parameter: String, path: String },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("malformed opus:\n{0}")]
    Validation(ValidationReport),
}

impl OpusError {
    pub(crate) fn missing(context: impl Into<String>, key: &str) -> Self {
        Self::MissingKey {
            context: context.into(),
            key: key.to_string(),
        }
    }

    pub(crate) fn malformed(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

/// Load and validate an opus file
pub async fn load_opus(
    opus_path: &Path,
    options: &LoadOptions,
    locator: &dyn ScriptLocator,
) -> Result<Opus, OpusError> {
    let source = tokio::fs::read_to_string(opus_path)
        .await
        .map_err(|source| OpusError::Io {
            path: opus_path.to_path_buf(),
            source,
        })?;
    let base_dir = opus_path.parent().unwrap_or_else(|| Path::new("."));

    let opus = compile_opus(&source, base_dir, options, locator).await?;
    info!(
        path = %opus_path.display(),
        nodes = opus.nodes.len(),
        actions = opus.action_templates.len(),
        assets = opus.assets.len(),
        "Opus loaded"
    );
    Ok(opus)
}

/// Compile opus source text; asset paths resolve against `base_dir`
pub async fn compile_opus(
    source: &str,
    base_dir: &Path,
    options: &LoadOptions,
    locator: &dyn ScriptLocator,
) -> Result<Opus, OpusError> {
    let root: Value = serde_yaml::from_str(source)?;
    let root = root
        .as_object()
        .ok_or_else(|| OpusError::malformed("opus", "top level must be a mapping"))?;

    let declared_assets = object_at(root, "assets", "opus")?;
    let script_path = declared_assets
        .get(SCRIPT_ASSET)
        .ok_or(OpusError::MissingScript)?
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| OpusError::missing(format!("asset '{SCRIPT_ASSET}'"), "path"))?;
    let script = read_file(&base_dir.join(script_path)).await?;

    let (nodes, node_actions) = nodes::load_nodes(object_at(root, "nodes", "opus")?, &script, locator)?;
    let (ui_config, ui_actions) = ui::load_ui_config(root.get("ui"))?;

    let mut raw_actions = object_at(root, "action_templates", "opus")?.clone();
    raw_actions.extend(node_actions);
    raw_actions.extend(ui_actions);
    let compiled = actions::compile_actions(&raw_actions)?;

    // The script was read above; everything else is loaded here
    let mut raw_assets: Vec<(String, Value)> = declared_assets
        .iter()
        .filter(|(key, _)| key.as_str() != SCRIPT_ASSET)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    raw_assets.extend(compiled.inline_assets);
    let mut assets = assets::load_assets(
        raw_assets,
        &compiled.actions,
        base_dir,
        options.read_asset_data,
    )
    .await?;
    assets.insert(
        SCRIPT_ASSET.to_string(),
        assets::preloaded_asset(
            SCRIPT_ASSET,
            script_path.to_string(),
            &script,
            &compiled.actions,
            options.read_asset_data,
        ),
    );

    let triggers = match root.get("triggers") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| OpusError::malformed("triggers", e.to_string()))?,
    };

    let start_node = match root.get("startNode") {
        Some(Value::String(node)) => node.clone(),
        Some(_) => return Err(OpusError::malformed("opus", "'startNode' must be a string")),
        None => return Err(OpusError::missing("opus", "startNode")),
    };

    let opus = Opus {
        nodes,
        action_templates: compiled.actions,
        assets,
        ui_config,
        triggers,
        start_node,
        script,
    };

    let report = validate_references(&opus);
    if !report.is_clean() {
        error!("Malformed opus!\n{}", report);
        if options.exit_on_validation_failure {
            error!("Aborting!");
            return Err(OpusError::Validation(report));
        }
    }

    Ok(opus)
}

pub(crate) async fn read_file(path: &Path) -> Result<Vec<u8>, OpusError> {
    tokio::fs::read(path).await.map_err(|source| OpusError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn object_at<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<&'a Map<String, Value>, OpusError> {
    match map.get(key) {
        Some(Value::Object(inner)) => Ok(inner),
        Some(_) => Err(OpusError::malformed(context, format!("'{key}' must be a mapping"))),
        None => Err(OpusError::missing(context, key)),
    }
}
