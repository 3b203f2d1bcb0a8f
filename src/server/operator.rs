//! Operator endpoint
//!
//! ## Protocol
//!
//! Connect: `ws://<host>:8001/operator`
//!
//! On connect the server sends, in order: `nodes`, `history`, `script`
//! (PDF data URL), `components` and `shortcuts`. After that every operator
//! notification is forwarded as it happens.
//!
//! Messages (operator → server) are [`ShowCommand`]s:
//!
//! ```json
//! {"messageType": "next-node", "runActions": true}
//! {"messageType": "choose-path", "index": 1}
//! {"messageType": "component-reset", "target": "media", "componentId": "screen-1"}
//! ```

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::notify::OperatorHub;
use crate::opus::{Node, Opus, UiShortcut};
use crate::peers::{ComponentHandler, ComponentInfo};
use crate::show::ShowCommand;

/// Initial state sent to a newly connected operator
#[derive(Debug, Serialize)]
#[serde(tag = "messageType", content = "data", rename_all = "kebab-case")]
enum Handshake<'a> {
    Nodes(&'a BTreeMap<String, Node>),
    History(Vec<String>),
    Script(String),
    Components(BTreeMap<&'static str, Vec<ComponentInfo>>),
    Shortcuts(&'a [UiShortcut]),
}

#[derive(Debug, thiserror::Error)]
enum OperatorError {
    #[error(transparent)]
    Socket(#[from] tungstenite::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct OperatorEndpoint {
    opus: Arc<Opus>,
    history: watch::Receiver<Vec<String>>,
    commands: mpsc::Sender<ShowCommand>,
    hub: OperatorHub,
    handlers: Vec<Arc<dyn ComponentHandler>>,
}

impl OperatorEndpoint {
    pub fn new(
        opus: Arc<Opus>,
        history: watch::Receiver<Vec<String>>,
        commands: mpsc::Sender<ShowCommand>,
        hub: OperatorHub,
        handlers: Vec<Arc<dyn ComponentHandler>>,
    ) -> Self {
        Self {
            opus,
            history,
            commands,
            hub,
            handlers,
        }
    }

    /// Serve one operator connection until it closes
    pub async fn handle_socket<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("Operator connected");
        match self.serve(ws).await {
            Ok(()) => info!("Operator disconnected"),
            Err(e) => warn!(error = %e, "Operator connection closed with error"),
        }
    }

    async fn serve<S>(&self, ws: WebSocketStream<S>) -> Result<(), OperatorError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        // Subscribe first so nothing falls between the handshake and the feed
        let mut notifications = self.hub.subscribe();
        for frame in self.handshake_frames().await? {
            sink.send(frame).await?;
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ShowCommand>(&text) {
                            Ok(command) => {
                                debug!(?command, "Operator command");
                                if self.commands.send(command).await.is_err() {
                                    warn!("Show is not running");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, text = %text, "Ignoring malformed operator frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                notification = notifications.recv() => match notification {
                    Ok(notification) => sink.send(encode(&notification)?).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Operator lagging, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn handshake_frames(&self) -> Result<Vec<Message>, serde_json::Error> {
        let mut components = BTreeMap::new();
        for handler in &self.handlers {
            components.insert(handler.category().name(), handler.connected_components().await);
        }
        let history = self.history.borrow().clone();
        let script = format!(
            "data:application/pdf;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.opus.script)
        );

        [
            Handshake::Nodes(&self.opus.nodes),
            Handshake::History(history),
            Handshake::Script(script),
            Handshake::Components(components),
            Handshake::Shortcuts(&self.opus.ui_config.shortcuts),
        ]
        .iter()
        .map(encode)
        .collect()
    }
}

fn encode<T: Serialize>(frame: &T) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(frame)?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opus::UiConfig;
    use serde_json::{json, Value};

    fn endpoint() -> OperatorEndpoint {
        let opus = Opus {
            nodes: BTreeMap::new(),
            action_templates: BTreeMap::new(),
            assets: BTreeMap::new(),
            ui_config: UiConfig {
                shortcuts: vec![UiShortcut {
                    title: "Blackout".into(),
                    actions: vec!["lights_off".into()],
                    hotkey: Some("b".into()),
                }],
            },
            triggers: vec![],
            start_node: "1".into(),
            script: b"%PDF".to_vec(),
        };
        let (_history_tx, history) = watch::channel(vec!["1".to_string()]);
        let (commands, _) = mpsc::channel(1);
        OperatorEndpoint::new(Arc::new(opus), history, commands, OperatorHub::new(), vec![])
    }

    #[tokio::test]
    async fn test_handshake_order_and_contents() {
        let frames: Vec<Value> = endpoint()
            .handshake_frames()
            .await
            .unwrap()
            .iter()
            .map(|m| serde_json::from_str(m.to_text().unwrap()).unwrap())
            .collect();

        let types: Vec<_> = frames.iter().map(|f| f["messageType"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["nodes", "history", "script", "components", "shortcuts"]);
        assert_eq!(frames[1]["data"], json!(["1"]));
        assert_eq!(frames[2]["data"], json!("data:application/pdf;base64,JVBERg=="));
        assert_eq!(frames[4]["data"][0]["title"], json!("Blackout"));
    }
}
