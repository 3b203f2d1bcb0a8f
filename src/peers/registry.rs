//! Component registry
//!
//! One registry per [`ComponentCategory`]. It owns every live connection of
//! that category and the components registered over them.
//!
//! Connection lifecycle:
//! 1. Handshake: `req_component_info`, plus `report_checksums` when the
//!    category syncs assets
//! 2. Resource sync: assets whose checksum differs from the peer's report are
//!    sent as `file` frames
//! 3. Dispatch loop: frames are handled strictly in arrival order; a bad
//!    frame is logged and skipped
//! 4. Disconnect: the component is dropped and operators are told

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::categories::CategoryEffect;
use super::protocol::{PeerMessage, ServerCommand};
use super::{
    ComponentCategory, ComponentEvent, ComponentHandler, ComponentInfo, DispatchError, PeerOutcome,
};
use crate::notify::{now_rfc3339, OperatorHub, OperatorNotification};
use crate::opus::{ActionTemplate, Asset};

pub type ConnectionId = Uuid;

struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
    component_id: Option<String>,
    /// Deduplicated events already raised by this connection
    raised_events: HashSet<String>,
}

impl Connection {
    fn peer_name(&self) -> String {
        self.component_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    fn deliver(&self, message: Message) -> PeerOutcome {
        let peer = self.peer_name();
        match self.tx.send(message) {
            Ok(()) => PeerOutcome::ok(peer),
            Err(_) => PeerOutcome {
                peer: peer.clone(),
                result: Err(DispatchError::ConnectionClosed { peer }),
            },
        }
    }
}

struct RegisteredComponent {
    info: ComponentInfo,
    connection: ConnectionId,
    state: Map<String, Value>,
}

#[derive(Default)]
struct RegistryState {
    /// In connection order
    connections: Vec<Connection>,
    /// In registration order
    components: Vec<RegisteredComponent>,
}

impl RegistryState {
    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    fn component(&self, component_id: &str) -> Option<&RegisteredComponent> {
        self.components
            .iter()
            .find(|c| c.info.component_id == component_id)
    }
}

pub struct ComponentRegistry {
    category: ComponentCategory,
    assets: BTreeMap<String, Asset>,
    sync_assets: bool,
    state: RwLock<RegistryState>,
    hub: OperatorHub,
    events: mpsc::UnboundedSender<ComponentEvent>,
}

impl ComponentRegistry {
    /// `sync_assets` only takes effect for categories that receive assets
    pub fn new(
        category: ComponentCategory,
        assets: BTreeMap<String, Asset>,
        sync_assets: bool,
        hub: OperatorHub,
        events: mpsc::UnboundedSender<ComponentEvent>,
    ) -> Self {
        Self {
            category,
            assets,
            sync_assets: sync_assets && category.sync_assets(),
            state: RwLock::new(RegistryState::default()),
            hub,
            events,
        }
    }

    /// Assets whose targets intersect the category's target types
    pub fn select_assets(
        category: ComponentCategory,
        assets: &BTreeMap<String, Asset>,
    ) -> BTreeMap<String, Asset> {
        assets
            .iter()
            .filter(|(_, asset)| asset.targets.iter().any(|t| category.handles_target(t)))
            .map(|(id, asset)| (id.clone(), asset.clone()))
            .collect()
    }

    pub fn category(&self) -> ComponentCategory {
        self.category
    }

    pub fn assets(&self) -> &BTreeMap<String, Asset> {
        &self.assets
    }

    /// Serve one peer connection until it closes
    pub async fn handle_socket<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer: the connection's only path to the socket
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Peer socket closed while sending");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let connection = self.attach(tx).await;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(connection, &text).await,
                Ok(Message::Binary(_)) => {
                    warn!(category = %self.category, %connection, "Ignoring binary frame");
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(category = %self.category, %connection, error = %e, "Peer connection error");
                    break;
                }
            }
        }

        self.detach(connection).await;
    }

    /// Track a new connection and start its handshake
    pub async fn attach(&self, tx: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let connection = Connection {
            id: Uuid::new_v4(),
            tx,
            component_id: None,
            raised_events: HashSet::new(),
        };
        let id = connection.id;

        let mut handshake = vec![ServerCommand::ReqComponentInfo];
        if self.sync_assets {
            handshake.push(ServerCommand::ReportChecksums);
        }
        for command in &handshake {
            match encode(command) {
                Ok(message) => {
                    if let Err(e) = connection.deliver(message).result {
                        warn!(category = %self.category, connection = %id, error = %e, "Handshake failed");
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode handshake"),
            }
        }

        self.state.write().await.connections.push(connection);
        info!(category = %self.category, connection = %id, "Component connected");
        id
    }

    /// Handle one inbound text frame
    pub async fn handle_frame(&self, connection: ConnectionId, text: &str) {
        let message = match PeerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(category = %self.category, %connection, error = %e, "Ignoring malformed frame");
                return;
            }
        };

        match message {
            PeerMessage::Heartbeat => {}
            PeerMessage::ComponentInfo(info) => self.register(connection, info).await,
            PeerMessage::LogMessage { level, msg } => self.relay_log(connection, level, msg).await,
            PeerMessage::FileChecksums { files } => self.sync_files(connection, &files).await,
            PeerMessage::Category { message_type, body } => {
                self.handle_category_message(connection, &message_type, body)
                    .await
            }
        }
    }

    /// Forget a connection and the component registered over it
    pub async fn detach(&self, connection: ConnectionId) {
        let removed = {
            let mut state = self.state.write().await;
            let Some(position) = state.connections.iter().position(|c| c.id == connection) else {
                return;
            };
            let closed = state.connections.remove(position);
            match closed.component_id {
                Some(component_id) => {
                    let before = state.components.len();
                    state.components.retain(|c| {
                        !(c.info.component_id == component_id && c.connection == connection)
                    });
                    (state.components.len() < before).then_some(component_id)
                }
                None => None,
            }
        };

        info!(category = %self.category, %connection, component_id = ?removed, "Component disconnected");
        if let Some(component_id) = removed {
            self.hub.broadcast(OperatorNotification::ComponentRemoved {
                category: self.category,
                component_id,
            });
        }
    }

    async fn register(&self, connection: ConnectionId, info: ComponentInfo) {
        let renamed_from = {
            let mut state = self.state.write().await;
            let Some(conn) = state.connection_mut(connection) else {
                return;
            };
            let previous = conn.component_id.replace(info.component_id.clone());

            // A connection stands for one component; drop its old identity
            let renamed_from = previous.filter(|old| *old != info.component_id);
            if let Some(old) = &renamed_from {
                state
                    .components
                    .retain(|c| !(c.info.component_id == *old && c.connection == connection));
            }

            match state
                .components
                .iter_mut()
                .find(|c| c.info.component_id == info.component_id)
            {
                Some(existing) => {
                    existing.info = info.clone();
                    existing.connection = connection;
                }
                None => state.components.push(RegisteredComponent {
                    info: info.clone(),
                    connection,
                    state: Map::new(),
                }),
            }
            renamed_from
        };

        if let Some(old) = renamed_from {
            info!(category = %self.category, %connection, component_id = %old, "Component re-registered under a new ID");
            self.hub.broadcast(OperatorNotification::ComponentRemoved {
                category: self.category,
                component_id: old,
            });
        }
        info!(
            category = %self.category,
            %connection,
            component_id = %info.component_id,
            component_name = %info.component_name,
            "Component registered"
        );
        self.hub.broadcast(OperatorNotification::ComponentInfoUpdated {
            category: self.category,
            component_id: info.component_id.clone(),
            info,
        });
    }

    async fn relay_log(&self, connection: ConnectionId, level: String, msg: String) {
        let component_id = self.component_of(connection).await;
        let component = component_id.as_deref().unwrap_or("<unregistered>");
        match level.as_str() {
            "error" => error!(category = %self.category, component, "{}", msg),
            "warn" | "warning" => warn!(category = %self.category, component, "{}", msg),
            "debug" => debug!(category = %self.category, component, "{}", msg),
            _ => info!(category = %self.category, component, "{}", msg),
        }
        self.hub.broadcast(OperatorNotification::LogMessage {
            timestamp: now_rfc3339(),
            category: self.category,
            component_id,
            level,
            msg,
        });
    }

    /// `file` frames for every asset the peer lacks or holds a different
    /// version of
    pub fn files_to_send(&self, reported: &HashMap<String, String>) -> Vec<ServerCommand> {
        let mut files = Vec::new();
        for (id, asset) in &self.assets {
            let (Some(data), Some(checksum)) = (&asset.data, &asset.checksum) else {
                if crate::opus::assets::is_remote(&asset.path) {
                    debug!(asset = %id, path = %asset.path, "Remote asset, nothing to sync");
                } else {
                    warn!(asset = %id, path = %asset.path, "Asset has no preloaded content, not syncing");
                }
                continue;
            };
            if reported.get(&asset.path) == Some(checksum) {
                info!(asset = %id, path = %asset.path, "Asset already synced");
                continue;
            }
            files.push(ServerCommand::file(asset.path.clone(), data));
        }
        files
    }

    async fn sync_files(&self, connection: ConnectionId, reported: &HashMap<String, String>) {
        if !self.sync_assets {
            debug!(category = %self.category, %connection, "Asset sync disabled, ignoring checksums");
            return;
        }
        let files = self.files_to_send(reported);

        let state = self.state.read().await;
        let Some(conn) = state.connection(connection) else {
            return;
        };
        for file in &files {
            let message = match encode(file) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Failed to encode file frame");
                    continue;
                }
            };
            if let ServerCommand::File { path, .. } = file {
                info!(category = %self.category, peer = %conn.peer_name(), path = %path, "Sending asset");
            }
            if let Err(e) = conn.deliver(message).result {
                warn!(category = %self.category, error = %e, "Asset sync aborted");
                break;
            }
        }
    }

    async fn handle_category_message(
        &self,
        connection: ConnectionId,
        message_type: &str,
        body: Map<String, Value>,
    ) {
        let component_id = self.component_of(connection).await;
        let component = component_id
            .clone()
            .unwrap_or_else(|| connection.to_string());

        match self.category.interpret(&component, message_type, body) {
            CategoryEffect::Notify(notification) => self.hub.broadcast(notification),
            CategoryEffect::StateUpdate(partial) => match component_id {
                Some(component_id) => self.update_state(&component_id, partial).await,
                None => warn!(
                    category = %self.category,
                    %connection,
                    message_type,
                    "State update from unregistered connection"
                ),
            },
            CategoryEffect::Event {
                event,
                params,
                dedupe_key,
            } => {
                if let Some(key) = dedupe_key {
                    let mut state = self.state.write().await;
                    let Some(conn) = state.connection_mut(connection) else {
                        return;
                    };
                    if !conn.raised_events.insert(format!("{event}:{key}")) {
                        debug!(category = %self.category, component = %component, event = %event, key = %key, "Duplicate event ignored");
                        return;
                    }
                }
                info!(category = %self.category, component = %component, event = %event, "Component event");
                let event = ComponentEvent {
                    target: self.category.name().to_string(),
                    event,
                    params,
                };
                if self.events.send(event).is_err() {
                    warn!(category = %self.category, "Show is not running, component event dropped");
                }
            }
            CategoryEffect::Handled => {}
            CategoryEffect::Unknown => warn!(
                category = %self.category,
                component = %component,
                message_type,
                "Unknown message type"
            ),
        }
    }

    /// Merge a partial state map into a registered component's state
    pub async fn update_state(&self, component_id: &str, partial: Map<String, Value>) {
        let state = {
            let mut registry = self.state.write().await;
            let Some(component) = registry
                .components
                .iter_mut()
                .find(|c| c.info.component_id == component_id)
            else {
                warn!(category = %self.category, component_id, "State update for unknown component");
                return;
            };
            component.state.extend(partial);
            component.state.clone()
        };

        self.hub.broadcast(OperatorNotification::ComponentStateUpdated {
            category: self.category,
            component_id: component_id.to_string(),
            state,
        });
    }

    pub async fn component_state(&self, component_id: &str) -> Option<Map<String, Value>> {
        let state = self.state.read().await;
        let component = state.component(component_id);
        if component.is_none() {
            debug!(category = %self.category, component_id, "State requested for unknown component");
        }
        component.map(|c| c.state.clone())
    }

    /// Send a command to every registered component, in registration order.
    /// Connections that never identified themselves are skipped.
    pub async fn send_command<T: Serialize + ?Sized>(&self, command: &T) -> Vec<PeerOutcome> {
        let message = match encode(command) {
            Ok(message) => message,
            Err(e) => {
                return vec![PeerOutcome {
                    peer: self.category.name().to_string(),
                    result: Err(e),
                }]
            }
        };
        let state = self.state.read().await;
        state
            .components
            .iter()
            .filter_map(|component| state.connection(component.connection))
            .map(|conn| conn.deliver(message.clone()))
            .collect()
    }

    /// Send a command to one registered component; `None` if it is not
    /// registered
    pub async fn send_command_to<T: Serialize + ?Sized>(
        &self,
        component_id: &str,
        command: &T,
    ) -> Option<PeerOutcome> {
        let state = self.state.read().await;
        let Some(conn) = state
            .component(component_id)
            .and_then(|component| state.connection(component.connection))
        else {
            warn!(category = %self.category, component_id, "No such component");
            return None;
        };
        Some(match encode(command) {
            Ok(message) => conn.deliver(message),
            Err(e) => PeerOutcome {
                peer: component_id.to_string(),
                result: Err(e),
            },
        })
    }

    pub async fn nof_instances(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn has_component(&self, component_id: &str) -> bool {
        self.state.read().await.component(component_id).is_some()
    }

    /// Registered components in registration order
    pub async fn get_connected_clients(&self) -> Vec<ComponentInfo> {
        self.state
            .read()
            .await
            .components
            .iter()
            .map(|c| c.info.clone())
            .collect()
    }

    async fn component_of(&self, connection: ConnectionId) -> Option<String> {
        self.state
            .read()
            .await
            .connection(connection)
            .and_then(|c| c.component_id.clone())
    }
}

#[async_trait::async_trait]
impl ComponentHandler for ComponentRegistry {
    fn category(&self) -> ComponentCategory {
        self.category
    }

    async fn nof_instances(&self) -> usize {
        ComponentRegistry::nof_instances(self).await
    }

    async fn handle_action(&self, action: &ActionTemplate) -> Vec<PeerOutcome> {
        let asset_paths: Vec<String> = action
            .assets
            .iter()
            .filter_map(|id| self.assets.get(id).map(|asset| asset.path.clone()))
            .collect();
        let envelope = self.category.envelope(action, &asset_paths);
        debug!(category = %self.category, action_id = %action.id, %envelope, "Dispatching action");
        self.send_command(&envelope).await
    }

    async fn reset_component(&self, component_id: &str) -> Option<PeerOutcome> {
        self.send_command_to(component_id, &ServerCommand::Reset).await
    }

    async fn restart_component(&self, component_id: &str) -> Option<PeerOutcome> {
        self.send_command_to(component_id, &ServerCommand::Restart).await
    }

    async fn connected_components(&self) -> Vec<ComponentInfo> {
        self.get_connected_clients().await
    }
}

fn encode<T: Serialize + ?Sized>(command: &T) -> Result<Message, DispatchError> {
    Ok(Message::Text(serde_json::to_string(command)?.into()))
}
