//! Stagehand - show-control runtime for live performances
//!
//! A stage manager follows a script, advancing through cues and branching at
//! choices, while networked components (media players, inventory screens,
//! LED controllers, Raspberry Pis) carry out the actions tied to each cue.
//!
//! ## Parts
//!
//! - **Opus**: compiles the YAML show definition into nodes, actions and assets
//! - **Performance**: cue history and navigation, trigger matching
//! - **Peers**: per-category registries of connected components
//! - **Show**: the single task that owns the performance and executes actions
//! - **Server**: websocket endpoints for components and operators

pub mod config;
pub mod notify;
pub mod opus;
pub mod peers;
pub mod performance;
pub mod server;
pub mod show;

pub use config::Config;
pub use opus::{load_opus, LoadOptions, Opus, OpusError};
pub use show::{Show, ShowCommand};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use notify::OperatorHub;
use peers::{ComponentCategory, ComponentHandler, ComponentRegistry};
use server::{Endpoints, OperatorEndpoint, Server};

/// Operator commands waiting for the show loop
const COMMAND_QUEUE: usize = 64;

/// A running show: server and show loop
pub struct Stagehand {
    local_addr: SocketAddr,
    commands: mpsc::Sender<ShowCommand>,
    history: watch::Receiver<Vec<String>>,
    hub: OperatorHub,
    registries: BTreeMap<ComponentCategory, Arc<ComponentRegistry>>,
    server: JoinHandle<()>,
    show: JoinHandle<()>,
}

impl Stagehand {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a command as if an operator had sent it
    pub fn commands(&self) -> mpsc::Sender<ShowCommand> {
        self.commands.clone()
    }

    pub fn history(&self) -> watch::Receiver<Vec<String>> {
        self.history.clone()
    }

    pub fn hub(&self) -> &OperatorHub {
        &self.hub
    }

    pub fn registry(&self, category: ComponentCategory) -> Option<&Arc<ComponentRegistry>> {
        self.registries.get(&category)
    }

    /// Run until the server stops
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let result = self.server.await;
        self.show.abort();
        result
    }

    pub fn shutdown(self) {
        self.server.abort();
        self.show.abort();
    }
}

/// Start the registries, the show loop and the websocket server
pub async fn launch(opus: Arc<Opus>, config: &Config) -> std::io::Result<Stagehand> {
    let hub = OperatorHub::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let registries: BTreeMap<_, _> = ComponentCategory::ALL
        .into_iter()
        .filter(|category| category.has_peers() && config.is_enabled(*category))
        .map(|category| {
            let assets = ComponentRegistry::select_assets(category, &opus.assets);
            info!(%category, assets = assets.len(), "Starting component registry");
            let registry = ComponentRegistry::new(
                category,
                assets,
                config.opus.sync_assets,
                hub.clone(),
                events_tx.clone(),
            );
            (category, Arc::new(registry))
        })
        .collect();
    let handlers: Vec<Arc<dyn ComponentHandler>> = registries
        .values()
        .map(|registry| Arc::clone(registry) as Arc<dyn ComponentHandler>)
        .collect();

    let show = Show::new(Arc::clone(&opus), handlers.clone(), hub.clone());
    let history = show.history_watch();
    let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE);

    let operator = OperatorEndpoint::new(
        Arc::clone(&opus),
        history.clone(),
        commands.clone(),
        hub.clone(),
        handlers,
    );
    let server = Server::bind(config.server.listen, Endpoints::new(registries.clone(), operator)).await?;
    let local_addr = server.local_addr()?;

    let show = tokio::spawn(show.run(commands_rx, events_rx));
    let server = tokio::spawn(server.run());

    Ok(Stagehand {
        local_addr,
        commands,
        history,
        hub,
        registries,
        server,
        show,
    })
}
