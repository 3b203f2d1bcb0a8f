//! Performance - a show in progress
//!
//! Walks the node graph of an [`Opus`]. The current node is the last entry of
//! the history, which always holds at least the start node. Every change to
//! the history and every action to run is emitted as a [`PerformanceEvent`];
//! the performance itself never talks to components.

pub mod triggers;

pub use triggers::{pattern_matches, trigger_matches};

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::opus::{Node, NodeNext, Opus};

#[derive(Debug, Clone, PartialEq)]
pub enum PerformanceEvent {
    HistoryChanged(Vec<String>),
    RunAction(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PerformanceError {
    #[error("node '{0}' does not exist")]
    UnknownNode(String),

    #[error("node '{0}' is a choice point, choose a path instead")]
    ChoicePoint(String),

    #[error("node '{0}' has no next node")]
    EndOfScript(String),

    #[error("node '{0}' is not a choice point")]
    NotAChoicePoint(String),

    #[error("node '{node}' has {available} choices, {index} is out of range")]
    ChoiceOutOfRange {
        node: String,
        index: usize,
        available: usize,
    },
}

/// A planned move from the current node: the actions to fire on the way,
/// in order, then the node to append
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub actions: Vec<String>,
}

pub struct Performance {
    opus: Arc<Opus>,
    history: Vec<String>,
    events: mpsc::UnboundedSender<PerformanceEvent>,
}

impl Performance {
    pub fn new(opus: Arc<Opus>, events: mpsc::UnboundedSender<PerformanceEvent>) -> Self {
        let history = vec![opus.start_node.clone()];
        Self {
            opus,
            history,
            events,
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn current_node_id(&self) -> &str {
        // History is never empty
        self.history.last().map(String::as_str).unwrap_or_default()
    }

    fn current_node(&self) -> Result<&Node, PerformanceError> {
        let id = self.current_node_id();
        self.opus
            .nodes
            .get(id)
            .ok_or_else(|| PerformanceError::UnknownNode(id.to_string()))
    }

    /// Where following the current linear node leads
    pub fn next_transition(&self) -> Result<Transition, PerformanceError> {
        let current_id = self.current_node_id().to_string();
        let node = self.current_node()?;
        match &node.next {
            Some(NodeNext::Linear(next)) => Ok(Transition {
                from: current_id,
                to: next.clone(),
                actions: node.actions.clone(),
            }),
            Some(NodeNext::Choices(_)) => Err(PerformanceError::ChoicePoint(current_id)),
            None => Err(PerformanceError::EndOfScript(current_id)),
        }
    }

    /// Where branch `index` of the current choice point leads. The current
    /// node's actions come before the choice's actions.
    pub fn choice_transition(&self, index: usize) -> Result<Transition, PerformanceError> {
        let current_id = self.current_node_id().to_string();
        let node = self.current_node()?;
        let choices = match &node.next {
            Some(NodeNext::Choices(choices)) => choices,
            _ => return Err(PerformanceError::NotAChoicePoint(current_id)),
        };
        let choice = choices.get(index).ok_or(PerformanceError::ChoiceOutOfRange {
            node: current_id.clone(),
            index,
            available: choices.len(),
        })?;
        info!(node = %current_id, choice = %choice.description, "Path chosen");

        let mut actions = node.actions.clone();
        actions.extend(choice.actions.iter().cloned());
        Ok(Transition {
            from: current_id,
            to: choice.node.clone(),
            actions,
        })
    }

    /// Append a transition's target to the history. Its actions are the
    /// caller's to run, and must have finished before this is called.
    pub fn enter(&mut self, transition: Transition) {
        info!(from = %transition.from, to = %transition.to, "Next node");
        self.push(transition.to);
    }

    /// Follow a linear node to its successor
    pub fn next_node(&mut self, run_actions: bool) -> Result<(), PerformanceError> {
        let transition = self.next_transition()?;
        self.take(transition, run_actions);
        Ok(())
    }

    /// Step back one node; the start of the history is never removed
    pub fn prev_node(&mut self) {
        if self.history.len() > 1 {
            self.history.pop();
            info!(node = %self.current_node_id(), "Previous node");
        } else {
            debug!("Already at the first node");
        }
        self.emit_history();
    }

    /// Jump to any existing node
    pub fn goto_node(&mut self, node_id: &str) -> Result<(), PerformanceError> {
        if !self.opus.nodes.contains_key(node_id) {
            return Err(PerformanceError::UnknownNode(node_id.to_string()));
        }
        info!(node = %node_id, "Go to node");
        self.push(node_id.to_string());
        Ok(())
    }

    /// Take branch `index` of the current choice point
    pub fn choose_path(&mut self, index: usize, run_actions: bool) -> Result<(), PerformanceError> {
        let transition = self.choice_transition(index)?;
        self.take(transition, run_actions);
        Ok(())
    }

    /// Fire the current node's actions without moving
    pub fn run_actions(&mut self) -> Result<(), PerformanceError> {
        let actions = self.current_node()?.actions.clone();
        self.emit_actions(&actions);
        Ok(())
    }

    pub fn run_actions_by_id(&mut self, action_ids: &[String]) {
        self.emit_actions(action_ids);
    }

    /// Fire every trigger matching a component event; returns how many matched
    pub fn on_component_event(&mut self, target: &str, event: &str, params: &Map<String, Value>) -> usize {
        let opus = Arc::clone(&self.opus);
        let mut matched = 0;
        for trigger in opus
            .triggers
            .iter()
            .filter(|trigger| trigger_matches(trigger, target, event, params))
        {
            info!(category = target, event, actions = ?trigger.actions, "Trigger matched");
            self.emit_actions(&trigger.actions);
            matched += 1;
        }
        if matched == 0 {
            debug!(category = target, event, "No trigger matched");
        }
        matched
    }

    fn take(&mut self, transition: Transition, run_actions: bool) {
        if run_actions {
            self.emit_actions(&transition.actions);
        }
        self.enter(transition);
    }

    fn push(&mut self, node_id: String) {
        self.history.push(node_id);
        self.emit_history();
    }

    fn emit_history(&self) {
        self.emit(PerformanceEvent::HistoryChanged(self.history.clone()));
    }

    fn emit_actions(&self, action_ids: &[String]) {
        for id in action_ids {
            self.emit(PerformanceEvent::RunAction(id.clone()));
        }
    }

    fn emit(&self, event: PerformanceEvent) {
        if self.events.send(event).is_err() {
            debug!("Performance events dropped, no listener");
        }
    }
}
