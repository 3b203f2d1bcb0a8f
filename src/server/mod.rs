//! Websocket server
//!
//! One listener serves every endpoint, picked by request path:
//! - `/operator` - operator UI, see [`operator`]
//! - `/<category>` - component peers of an enabled category, e.g. `/media`
//!
//! Any other path is refused during the handshake with 404.

pub mod operator;

pub use operator::OperatorEndpoint;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::peers::{ComponentCategory, ComponentRegistry};

pub const OPERATOR_PATH: &str = "/operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Operator,
    Component(ComponentCategory),
}

/// Everything a connection can be routed to
#[derive(Clone)]
pub struct Endpoints {
    registries: Arc<BTreeMap<ComponentCategory, Arc<ComponentRegistry>>>,
    operator: Arc<OperatorEndpoint>,
}

impl Endpoints {
    pub fn new(
        registries: BTreeMap<ComponentCategory, Arc<ComponentRegistry>>,
        operator: OperatorEndpoint,
    ) -> Self {
        Self {
            registries: Arc::new(registries),
            operator: Arc::new(operator),
        }
    }

    pub fn route(&self, path: &str) -> Option<Route> {
        if path == OPERATOR_PATH {
            return Some(Route::Operator);
        }
        let name = path.strip_prefix('/')?;
        ComponentCategory::from_name(name)
            .filter(|category| self.registries.contains_key(category))
            .map(Route::Component)
    }
}

pub struct Server {
    listener: TcpListener,
    endpoints: Endpoints,
}

impl Server {
    pub async fn bind(addr: SocketAddr, endpoints: Endpoints) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, endpoints })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Websocket server listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let endpoints = self.endpoints.clone();
                    tokio::spawn(handle_connection(stream, peer, endpoints));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, endpoints: Endpoints) {
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match endpoints.route(path) {
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some(format!("no endpoint at {path}")));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "Websocket handshake refused");
            return;
        }
    };

    match route {
        Some(Route::Operator) => endpoints.operator.handle_socket(ws).await,
        Some(Route::Component(category)) => {
            if let Some(registry) = endpoints.registries.get(&category) {
                debug!(%peer, %category, "Routing to component registry");
                registry.handle_socket(ws).await;
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::OperatorHub;
    use crate::opus::{Opus, UiConfig};
    use tokio::sync::{mpsc, watch};

    fn endpoints(categories: &[ComponentCategory]) -> Endpoints {
        let hub = OperatorHub::new();
        let (events, _) = mpsc::unbounded_channel();
        let registries = categories
            .iter()
            .map(|&category| {
                let registry =
                    ComponentRegistry::new(category, BTreeMap::new(), true, hub.clone(), events.clone());
                (category, Arc::new(registry))
            })
            .collect();
        let opus = Opus {
            nodes: BTreeMap::new(),
            action_templates: BTreeMap::new(),
            assets: BTreeMap::new(),
            ui_config: UiConfig::default(),
            triggers: vec![],
            start_node: "1".into(),
            script: vec![],
        };
        let (_, history) = watch::channel(vec![]);
        let (commands, _) = mpsc::channel(1);
        let operator = OperatorEndpoint::new(Arc::new(opus), history, commands, hub, vec![]);
        Endpoints::new(registries, operator)
    }

    #[test]
    fn test_routes() {
        let endpoints = endpoints(&[ComponentCategory::Media]);
        assert_eq!(endpoints.route("/operator"), Some(Route::Operator));
        assert_eq!(
            endpoints.route("/media"),
            Some(Route::Component(ComponentCategory::Media))
        );
        // Known category but not enabled
        assert_eq!(endpoints.route("/inventory"), None);
        assert_eq!(endpoints.route("/nope"), None);
        assert_eq!(endpoints.route("/"), None);
    }
}
