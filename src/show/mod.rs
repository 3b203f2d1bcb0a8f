//! Show loop
//!
//! Owns the [`Performance`] and routes the actions it fires to component
//! handlers. Operator commands and component events arrive over channels and
//! are processed one at a time, each to completion (including every action
//! it causes) before the next is looked at.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::notify::{OperatorHub, OperatorNotification};
use crate::opus::{ActionTemplate, Opus};
use crate::peers::internal::InternalCommand;
use crate::peers::{ComponentCategory, ComponentEvent, ComponentHandler, DispatchError, PeerOutcome};
use crate::performance::{Performance, PerformanceEvent, Transition};

/// Peer name used in outcomes of internal commands
const INTERNAL_PEER: &str = "internal";

/// Commands accepted from operators
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "messageType", rename_all = "kebab-case")]
pub enum ShowCommand {
    #[serde(rename_all = "camelCase")]
    NextNode {
        #[serde(default = "default_true")]
        run_actions: bool,
    },
    PrevNode,
    GotoNode {
        node: String,
    },
    #[serde(rename_all = "camelCase")]
    ChoosePath {
        index: usize,
        #[serde(default = "default_true")]
        run_actions: bool,
    },
    RunActions,
    RunActionsById {
        actions: Vec<String>,
    },
    /// Ad hoc action not defined in the opus
    ComponentAction {
        target: String,
        cmd: String,
        #[serde(default)]
        assets: Vec<String>,
        #[serde(default)]
        params: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    ComponentReset {
        target: String,
        component_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ComponentRestart {
        target: String,
        component_id: String,
    },
}

fn default_true() -> bool {
    true
}

/// What happened when one action ran
#[derive(Debug)]
pub struct ActionReport {
    pub action_id: String,
    /// Whether any live component took the action
    pub handled: bool,
    pub outcomes: Vec<PeerOutcome>,
    pub subreports: Vec<ActionReport>,
}

impl ActionReport {
    fn unhandled(action_id: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            handled: false,
            outcomes: Vec::new(),
            subreports: Vec::new(),
        }
    }

    /// No peer failed, at any depth
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(PeerOutcome::is_ok) && self.subreports.iter().all(ActionReport::all_ok)
    }
}

pub struct Show {
    opus: Arc<Opus>,
    performance: Performance,
    performance_events: mpsc::UnboundedReceiver<PerformanceEvent>,
    handlers: Vec<Arc<dyn ComponentHandler>>,
    hub: OperatorHub,
    history: watch::Sender<Vec<String>>,
}

impl Show {
    pub fn new(opus: Arc<Opus>, handlers: Vec<Arc<dyn ComponentHandler>>, hub: OperatorHub) -> Self {
        let (events_tx, performance_events) = mpsc::unbounded_channel();
        let performance = Performance::new(Arc::clone(&opus), events_tx);
        let (history, _) = watch::channel(performance.history().to_vec());
        Self {
            opus,
            performance,
            performance_events,
            handlers,
            hub,
            history,
        }
    }

    /// Always holds the latest history
    pub fn history_watch(&self) -> watch::Receiver<Vec<String>> {
        self.history.subscribe()
    }

    pub fn performance(&self) -> &Performance {
        &self.performance
    }

    /// Process commands and component events until both sources close
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ShowCommand>,
        mut events: mpsc::UnboundedReceiver<ComponentEvent>,
    ) {
        info!(start_node = %self.opus.start_node, "Show started");
        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    self.handle_command(command).await;
                }
                Some(event) = events.recv() => {
                    self.handle_component_event(event).await;
                }
                else => break,
            }
        }
        info!("Show stopped");
    }

    pub async fn handle_command(&mut self, command: ShowCommand) -> Vec<ActionReport> {
        debug!(?command, "Show command");
        let result = match command {
            ShowCommand::NextNode { run_actions } => match self.performance.next_transition() {
                Ok(transition) => return self.take_transition(transition, run_actions).await,
                Err(e) => Err(e),
            },
            ShowCommand::PrevNode => {
                self.performance.prev_node();
                Ok(())
            }
            ShowCommand::GotoNode { node } => self.performance.goto_node(&node),
            ShowCommand::ChoosePath { index, run_actions } => match self.performance.choice_transition(index) {
                Ok(transition) => return self.take_transition(transition, run_actions).await,
                Err(e) => Err(e),
            },
            ShowCommand::RunActions => self.performance.run_actions(),
            ShowCommand::RunActionsById { actions } => {
                self.performance.run_actions_by_id(&actions);
                Ok(())
            }
            ShowCommand::ComponentAction {
                target,
                cmd,
                assets,
                params,
            } => {
                let action = ActionTemplate {
                    id: format!("component-action {target}:{cmd}"),
                    target,
                    cmd,
                    desc: None,
                    assets,
                    params,
                    subactions: Vec::new(),
                };
                let mut reports = vec![self.execute(&action).await];
                reports.extend(self.settle().await);
                return reports;
            }
            ShowCommand::ComponentReset {
                target,
                component_id,
            } => {
                self.component_command(&target, &component_id, false).await;
                Ok(())
            }
            ShowCommand::ComponentRestart {
                target,
                component_id,
            } => {
                self.component_command(&target, &component_id, true).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Command ignored");
        }
        self.settle().await
    }

    pub async fn handle_component_event(&mut self, event: ComponentEvent) -> Vec<ActionReport> {
        self.performance
            .on_component_event(&event.target, &event.event, &event.params);
        self.settle().await
    }

    /// Run the action with `action_id` and its subactions
    pub async fn execute_action(&mut self, action_id: &str) -> ActionReport {
        let opus = Arc::clone(&self.opus);
        match opus.action_templates.get(action_id) {
            Some(action) => self.execute(action).await,
            None => {
                error!(action_id, "Unknown action");
                ActionReport::unhandled(action_id)
            }
        }
    }

    /// Run a transition's actions to completion, then append its target. A
    /// node jumped to by one of the actions lands in the history first.
    async fn take_transition(&mut self, transition: Transition, run_actions: bool) -> Vec<ActionReport> {
        let mut reports = self.settle().await;
        if run_actions {
            for action_id in &transition.actions {
                reports.push(self.execute_action(action_id).await);
                reports.extend(self.settle().await);
            }
        }
        self.performance.enter(transition);
        reports.extend(self.settle().await);
        reports
    }

    /// Handle everything the performance emitted, including events emitted
    /// while doing so
    async fn settle(&mut self) -> Vec<ActionReport> {
        let mut reports = Vec::new();
        while let Ok(event) = self.performance_events.try_recv() {
            match event {
                PerformanceEvent::HistoryChanged(history) => {
                    self.history.send_replace(history.clone());
                    self.hub.broadcast(OperatorNotification::History(history));
                }
                PerformanceEvent::RunAction(action_id) => {
                    reports.push(self.execute_action(&action_id).await);
                }
            }
        }
        reports
    }

    /// Direct effect first, then subactions in order
    fn execute<'a>(&'a mut self, action: &'a ActionTemplate) -> BoxFuture<'a, ActionReport> {
        async move {
            info!(action_id = %action.id, desc = %action.description(), "Running action");
            let (handled, outcomes) = self.direct_effect(action).await;

            let mut subreports = Vec::with_capacity(action.subactions.len());
            for subaction in &action.subactions {
                subreports.push(self.execute(subaction).await);
            }

            ActionReport {
                action_id: action.id.clone(),
                handled,
                outcomes,
                subreports,
            }
        }
        .boxed()
    }

    async fn direct_effect(&mut self, action: &ActionTemplate) -> (bool, Vec<PeerOutcome>) {
        if ComponentCategory::Internal.handles_target(&action.target) {
            let outcome = match InternalCommand::from_action(action).run(&action.id) {
                Some(node) => match self.performance.goto_node(&node) {
                    Ok(()) => PeerOutcome::ok(INTERNAL_PEER),
                    Err(e) => {
                        error!(action_id = %action.id, error = %e, "goto-node failed");
                        PeerOutcome {
                            peer: INTERNAL_PEER.to_string(),
                            result: Err(DispatchError::Rejected {
                                peer: INTERNAL_PEER.to_string(),
                                reason: e.to_string(),
                            }),
                        }
                    }
                },
                None => PeerOutcome::ok(INTERNAL_PEER),
            };
            return (true, vec![outcome]);
        }

        let Some(handler) = self.handler_for(&action.target) else {
            warn!(action_id = %action.id, action_target = %action.target, "Unhandled action, no category serves this target");
            return (false, Vec::new());
        };
        if handler.nof_instances().await == 0 {
            warn!(action_id = %action.id, action_target = %action.target, "Unhandled action");
            return (false, Vec::new());
        }

        let outcomes = handler.handle_action(action).await;
        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                error!(action_id = %action.id, peer = %outcome.peer, error = %e, "Dispatch failed");
            }
        }
        (true, outcomes)
    }

    async fn component_command(&self, target: &str, component_id: &str, restart: bool) {
        let Some(handler) = self.handler_for(target) else {
            warn!(category = target, component_id, "No category for component command");
            return;
        };
        let outcome = if restart {
            handler.restart_component(component_id).await
        } else {
            handler.reset_component(component_id).await
        };
        match outcome.map(|o| o.result) {
            Some(Ok(())) => info!(category = target, component_id, restart, "Component command sent"),
            Some(Err(e)) => error!(category = target, component_id, error = %e, "Component command failed"),
            None => warn!(category = target, component_id, "Component not connected"),
        }
    }

    /// Handler serving a target type, or a category by name
    fn handler_for(&self, target: &str) -> Option<Arc<dyn ComponentHandler>> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(target) || h.category().name() == target)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opus::actions::compile_actions;
    use crate::opus::{Node, NodeNext, UiConfig};
    use crate::peers::ComponentInfo;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeHandler {
        category: ComponentCategory,
        instances: usize,
        failing_peer: Option<String>,
        received: Mutex<Vec<String>>,
    }

    impl FakeHandler {
        fn new(category: ComponentCategory, instances: usize) -> Self {
            Self {
                category,
                instances,
                failing_peer: None,
                received: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ComponentHandler for FakeHandler {
        fn category(&self) -> ComponentCategory {
            self.category
        }

        async fn nof_instances(&self) -> usize {
            self.instances
        }

        async fn handle_action(&self, action: &ActionTemplate) -> Vec<PeerOutcome> {
            self.received.lock().unwrap().push(action.id.clone());
            (0..self.instances)
                .map(|i| {
                    let peer = format!("peer-{i}");
                    if self.failing_peer.as_deref() == Some(peer.as_str()) {
                        PeerOutcome {
                            peer: peer.clone(),
                            result: Err(DispatchError::ConnectionClosed { peer }),
                        }
                    } else {
                        PeerOutcome::ok(peer)
                    }
                })
                .collect()
        }

        async fn reset_component(&self, component_id: &str) -> Option<PeerOutcome> {
            self.received.lock().unwrap().push(format!("reset {component_id}"));
            Some(PeerOutcome::ok(component_id))
        }

        async fn restart_component(&self, component_id: &str) -> Option<PeerOutcome> {
            self.received.lock().unwrap().push(format!("restart {component_id}"));
            Some(PeerOutcome::ok(component_id))
        }

        async fn connected_components(&self) -> Vec<ComponentInfo> {
            Vec::new()
        }
    }

    fn node(next: &str, actions: &[&str]) -> Node {
        Node {
            next: Some(NodeNext::Linear(next.into())),
            prompt: String::new(),
            pdf_page: None,
            pdf_location_on_page: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            line_number: None,
        }
    }

    fn opus(actions: Value) -> Arc<Opus> {
        let mut nodes = BTreeMap::new();
        nodes.insert("11".to_string(), node("160", &["door_1", "music"]));
        nodes.insert("160".to_string(), node("11", &[]));
        Arc::new(Opus {
            nodes,
            action_templates: compile_actions(actions.as_object().unwrap()).unwrap().actions,
            assets: BTreeMap::new(),
            ui_config: UiConfig::default(),
            triggers: vec![],
            start_node: "11".into(),
            script: vec![],
        })
    }

    fn standard_opus() -> Arc<Opus> {
        opus(json!({
            "door_1": [
                {"target": "internal", "cmd": "print", "params": {"text": "open"}},
                {"target": "internal", "cmd": "print", "params": {"text": "closed"}}
            ],
            "music": {"target": "audio", "cmd": "play", "params": {"entityId": "theme"}},
            "jump": {"target": "internal", "cmd": "goto-node", "params": {"node": "160"}}
        }))
    }

    #[tokio::test]
    async fn test_composite_runs_subactions_in_order() {
        let mut show = Show::new(standard_opus(), vec![], OperatorHub::new());
        let report = show.execute_action("door_1").await;

        assert!(report.handled);
        let ids: Vec<_> = report.subreports.iter().map(|r| r.action_id.as_str()).collect();
        assert_eq!(ids, vec!["door_1_1", "door_1_2"]);
        assert!(report.subreports.iter().all(|r| r.handled));
        assert!(report.all_ok());
    }

    #[tokio::test]
    async fn test_no_live_component_is_unhandled() {
        let media = Arc::new(FakeHandler::new(ComponentCategory::Media, 0));
        let mut show = Show::new(standard_opus(), vec![media.clone() as Arc<dyn ComponentHandler>], OperatorHub::new());

        let report = show.execute_action("music").await;
        assert!(!report.handled);
        assert!(media.received.lock().unwrap().is_empty());

        let report = show.execute_action("does_not_exist").await;
        assert!(!report.handled);
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_stop_broadcast() {
        let mut media = FakeHandler::new(ComponentCategory::Media, 2);
        media.failing_peer = Some("peer-0".into());
        let mut show = Show::new(standard_opus(), vec![Arc::new(media) as Arc<dyn ComponentHandler>], OperatorHub::new());

        let report = show.execute_action("music").await;
        assert!(report.handled);
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].is_ok());
        assert!(report.outcomes[1].is_ok());
        assert!(!report.all_ok());
    }

    #[tokio::test]
    async fn test_next_node_runs_node_actions() {
        let media = Arc::new(FakeHandler::new(ComponentCategory::Media, 1));
        let hub = OperatorHub::new();
        let mut notifications = hub.subscribe();
        let mut show = Show::new(standard_opus(), vec![media.clone() as Arc<dyn ComponentHandler>], hub);
        let history = show.history_watch();

        let reports = show
            .handle_command(ShowCommand::NextNode { run_actions: true })
            .await;

        let ids: Vec<_> = reports.iter().map(|r| r.action_id.as_str()).collect();
        assert_eq!(ids, vec!["door_1", "music"]);
        assert_eq!(*media.received.lock().unwrap(), vec!["music".to_string()]);
        assert_eq!(*history.borrow(), vec!["11".to_string(), "160".to_string()]);
        assert_eq!(
            notifications.recv().await.unwrap(),
            OperatorNotification::History(vec!["11".into(), "160".into()])
        );
    }

    #[tokio::test]
    async fn test_internal_goto_moves_performance() {
        let mut show = Show::new(standard_opus(), vec![], OperatorHub::new());
        let history = show.history_watch();

        let reports = show
            .handle_command(ShowCommand::RunActionsById { actions: vec!["jump".into()] })
            .await;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].all_ok());
        assert_eq!(show.performance().history(), ["11", "160"]);
        assert_eq!(*history.borrow(), vec!["11".to_string(), "160".to_string()]);
    }

    #[tokio::test]
    async fn test_jump_from_node_actions_lands_before_next_node() {
        let mut script = (*opus(json!({
            "far_jump": {"target": "internal", "cmd": "goto-node", "params": {"node": "1126"}}
        })))
        .clone();
        script.nodes.insert("11".into(), node("160", &["far_jump"]));
        script.nodes.insert("1126".into(), node("11", &[]));
        let hub = OperatorHub::new();
        let mut notifications = hub.subscribe();
        let mut show = Show::new(Arc::new(script), vec![], hub);

        let reports = show
            .handle_command(ShowCommand::NextNode { run_actions: true })
            .await;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].all_ok());
        assert_eq!(show.performance().history(), ["11", "1126", "160"]);
        assert_eq!(
            notifications.recv().await.unwrap(),
            OperatorNotification::History(vec!["11".into(), "1126".into()])
        );
        assert_eq!(
            notifications.recv().await.unwrap(),
            OperatorNotification::History(vec!["11".into(), "1126".into(), "160".into()])
        );
    }

    #[tokio::test]
    async fn test_invalid_command_changes_nothing() {
        let mut show = Show::new(standard_opus(), vec![], OperatorHub::new());
        let reports = show
            .handle_command(ShowCommand::ChoosePath { index: 0, run_actions: true })
            .await;
        assert!(reports.is_empty());
        assert_eq!(show.performance().history(), ["11"]);
    }

    #[tokio::test]
    async fn test_component_action_and_reset() {
        let leds = Arc::new(FakeHandler::new(ComponentCategory::LedController, 1));
        let mut show = Show::new(standard_opus(), vec![leds.clone() as Arc<dyn ComponentHandler>], OperatorHub::new());

        let reports = show
            .handle_command(ShowCommand::ComponentAction {
                target: "ledController".into(),
                cmd: "blink".into(),
                assets: vec![],
                params: Map::new(),
            })
            .await;
        assert!(reports[0].handled);

        show.handle_command(ShowCommand::ComponentReset {
            target: "ledController".into(),
            component_id: "strip".into(),
        })
        .await;

        let received = leds.received.lock().unwrap().clone();
        assert_eq!(received, vec!["component-action ledController:blink".to_string(), "reset strip".to_string()]);
    }

    #[tokio::test]
    async fn test_component_event_fires_trigger_actions() {
        let mut opus = (*standard_opus()).clone();
        opus.triggers = serde_json::from_value(json!([
            {"target": "inventory", "event": "achievement_reached", "actions": ["jump"]}
        ]))
        .unwrap();
        let mut show = Show::new(Arc::new(opus), vec![], OperatorHub::new());

        let reports = show
            .handle_component_event(ComponentEvent {
                target: "inventory".into(),
                event: "achievement_reached".into(),
                params: Map::new(),
            })
            .await;
        assert_eq!(reports[0].action_id, "jump");
        assert_eq!(show.performance().current_node_id(), "160");
    }

    #[test]
    fn test_operator_command_wire_format() {
        let command: ShowCommand = serde_json::from_str(r#"{"messageType": "next-node"}"#).unwrap();
        assert_eq!(command, ShowCommand::NextNode { run_actions: true });

        let command: ShowCommand =
            serde_json::from_str(r#"{"messageType": "choose-path", "index": 1, "runActions": false}"#).unwrap();
        assert_eq!(command, ShowCommand::ChoosePath { index: 1, run_actions: false });

        let command: ShowCommand = serde_json::from_str(
            r#"{"messageType": "component-restart", "target": "media", "componentId": "screen-1"}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            ShowCommand::ComponentRestart {
                target: "media".into(),
                component_id: "screen-1".into()
            }
        );

        assert!(serde_json::from_str::<ShowCommand>(r#"{"messageType": "explode"}"#).is_err());
    }
}
