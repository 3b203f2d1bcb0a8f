//! Reference validation
//!
//! Checks that nodes, assets and actions are referenced iff they exist, and
//! that no UI shortcut claims a hotkey the operator UI reserves. Every
//! finding is collected; nothing short-circuits.

use std::collections::BTreeSet;
use std::fmt;

use super::{ActionTemplate, NodeNext, Opus, SCRIPT_ASSET};

/// Hotkeys owned by the browser or by the operator UI itself
pub const DISALLOWED_HOTKEYS: &[&str] = &[
    "ctrl+t", "ctrl+n", "ctrl+w", "ctrl+r", // browser
    "a", "s", " ", "Up", "ArrowUp", "Down", "ArrowDown", "Enter", // operator UI
];

/// All reference mismatches found in an opus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub missing_nodes: BTreeSet<String>,
    pub orphaned_nodes: BTreeSet<String>,
    pub missing_assets: BTreeSet<String>,
    pub orphaned_assets: BTreeSet<String>,
    pub missing_actions: BTreeSet<String>,
    pub orphaned_actions: BTreeSet<String>,
    /// `title (hotkey)` of each offending shortcut
    pub disallowed_hotkeys: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_nodes.is_empty()
            && self.orphaned_nodes.is_empty()
            && self.missing_assets.is_empty()
            && self.orphaned_assets.is_empty()
            && self.missing_actions.is_empty()
            && self.orphaned_actions.is_empty()
            && self.disallowed_hotkeys.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections: [(&str, Vec<&str>); 7] = [
            ("References to nonexistent nodes", self.missing_nodes.iter().map(String::as_str).collect()),
            ("Nodes never referred to", self.orphaned_nodes.iter().map(String::as_str).collect()),
            ("References to nonexistent assets", self.missing_assets.iter().map(String::as_str).collect()),
            ("Assets never referred to", self.orphaned_assets.iter().map(String::as_str).collect()),
            ("References to nonexistent actions", self.missing_actions.iter().map(String::as_str).collect()),
            ("Actions never referred to", self.orphaned_actions.iter().map(String::as_str).collect()),
            ("Illegal hotkeys used", self.disallowed_hotkeys.iter().map(String::as_str).collect()),
        ];
        for (title, items) in sections.iter().filter(|(_, items)| !items.is_empty()) {
            writeln!(f, "{title}:")?;
            for item in items {
                writeln!(f, "  {item}")?;
            }
        }
        Ok(())
    }
}

/// Run every reference check against an opus
pub fn validate_references(opus: &Opus) -> ValidationReport {
    let mut report = ValidationReport::default();

    // Nodes
    let mut referred_nodes = BTreeSet::from([opus.start_node.clone()]);
    for node in opus.nodes.values() {
        match &node.next {
            Some(NodeNext::Linear(target)) => {
                referred_nodes.insert(target.clone());
            }
            Some(NodeNext::Choices(choices)) => {
                referred_nodes.extend(choices.iter().map(|c| c.node.clone()));
            }
            None => {}
        }
    }
    let actual_nodes: BTreeSet<String> = opus.nodes.keys().cloned().collect();
    report.missing_nodes = referred_nodes.difference(&actual_nodes).cloned().collect();
    report.orphaned_nodes = actual_nodes.difference(&referred_nodes).cloned().collect();

    // Actions
    let mut referred_actions = BTreeSet::new();
    let roots = opus
        .nodes
        .values()
        .flat_map(|node| {
            let choice_actions = match &node.next {
                Some(NodeNext::Choices(choices)) => {
                    choices.iter().flat_map(|c| c.actions.iter()).collect::<Vec<_>>()
                }
                _ => Vec::new(),
            };
            node.actions.iter().chain(choice_actions)
        })
        .chain(opus.ui_config.shortcuts.iter().flat_map(|s| s.actions.iter()))
        .chain(opus.triggers.iter().flat_map(|t| t.actions.iter()));
    for id in roots {
        match opus.action_templates.get(id) {
            Some(action) => refer_action(opus, action, &mut referred_actions),
            None => {
                referred_actions.insert(id.clone());
            }
        }
    }
    let actual_actions: BTreeSet<String> = opus.action_templates.keys().cloned().collect();
    report.missing_actions = referred_actions.difference(&actual_actions).cloned().collect();
    report.orphaned_actions = actual_actions.difference(&referred_actions).cloned().collect();

    // Assets
    let mut referred_assets = BTreeSet::from([SCRIPT_ASSET.to_string()]);
    for action in opus.action_templates.values() {
        collect_assets(action, &mut referred_assets);
    }
    let actual_assets: BTreeSet<String> = opus.assets.keys().cloned().collect();
    report.missing_assets = referred_assets.difference(&actual_assets).cloned().collect();
    report.orphaned_assets = actual_assets.difference(&referred_assets).cloned().collect();

    // Hotkeys
    report.disallowed_hotkeys = opus
        .ui_config
        .shortcuts
        .iter()
        .filter_map(|s| {
            let hotkey = s.hotkey.as_deref()?;
            DISALLOWED_HOTKEYS
                .contains(&hotkey)
                .then(|| format!("{} ({})", s.title, hotkey))
        })
        .collect();

    report
}

/// Mark an action referenced, following only subactions that exist in the
/// action table on their own; generated subactions are not revisited.
fn refer_action(opus: &Opus, action: &ActionTemplate, referred: &mut BTreeSet<String>) {
    if !referred.insert(action.id.clone()) {
        return;
    }
    for subaction in &action.subactions {
        if let Some(named) = opus.action_templates.get(&subaction.id) {
            refer_action(opus, named, referred);
        }
    }
}

fn collect_assets(action: &ActionTemplate, referred: &mut BTreeSet<String>) {
    referred.extend(action.assets.iter().cloned());
    for subaction in &action.subactions {
        collect_assets(subaction, referred);
    }
}
