//! Solana WebSocket push feed (`logsSubscribe` with a `mentions` filter).
//!
//! The RPC accepts one address per `mentions` filter, so a subscription to N
//! addresses is N `logsSubscribe` requests. Replacing the set unsubscribes
//! everything first.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::watcher::error::WatchError;
use crate::watcher::feed::{PushConnector, PushSession};
use crate::watcher::types::PushedActivity;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct LogsPubsub {
    ws_url: String,
    commitment: String,
}

impl LogsPubsub {
    pub fn new(ws_url: impl Into<String>, commitment: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            commitment: commitment.into(),
        }
    }
}

#[async_trait]
impl PushConnector for LogsPubsub {
    async fn connect(&self) -> Result<Box<dyn PushSession>, WatchError> {
        let (ws, _response) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| WatchError::Transport(format!("failed connecting to {}: {e}", self.ws_url)))?;
        info!(ws_url = %self.ws_url, "websocket connected");
        Ok(Box::new(LogsSession {
            ws,
            commitment: self.commitment.clone(),
            book: SubscriptionBook::default(),
        }))
    }
}

/// What a text frame means for the session.
#[derive(Debug, PartialEq)]
enum Handled {
    Activity(PushedActivity),
    /// A subscription from a replaced set was acknowledged; cancel it.
    Cancel(u64),
    Nothing,
}

/// Request and subscription ids of one connection.
#[derive(Debug, Default)]
struct SubscriptionBook {
    next_id: u64,
    /// Request id → address, until the ack arrives.
    pending: HashMap<u64, String>,
    /// Requests from a replaced set whose ack has not arrived yet.
    stale: HashSet<u64>,
    /// Subscription id → address.
    active: HashMap<u64, String>,
}

impl SubscriptionBook {
    fn request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Begin replacing the set. Returns the live subscriptions to cancel now;
    /// requests still in flight are cancelled when their ack arrives.
    fn replace(&mut self) -> Vec<u64> {
        self.stale.extend(self.pending.drain().map(|(id, _)| id));
        self.active.drain().map(|(subscription, _)| subscription).collect()
    }

    fn requested(&mut self, id: u64, address: &str) {
        self.pending.insert(id, address.to_string());
    }

    fn handle_text(&mut self, text: &str) -> Handled {
        let Some(inbound) = parse_inbound(text) else {
            return Handled::Nothing;
        };
        match inbound {
            Inbound::Ack { id, subscription } => {
                if let Some(address) = self.pending.remove(&id) {
                    debug!(address = %address, subscription, "logsSubscribe acknowledged");
                    self.active.insert(subscription, address);
                    Handled::Nothing
                } else if self.stale.remove(&id) {
                    debug!(subscription, "ack for a replaced subscription, cancelling");
                    Handled::Cancel(subscription)
                } else {
                    Handled::Nothing
                }
            }
            Inbound::Error { id, message } => {
                let address = id.and_then(|id| {
                    self.stale.remove(&id);
                    self.pending.remove(&id)
                });
                warn!(address = ?address, error = %message, "websocket request rejected");
                Handled::Nothing
            }
            Inbound::Logs { subscription, signature, logs, raw } => {
                let Some(address) = self.active.get(&subscription) else {
                    debug!(subscription, "notification for an inactive subscription dropped");
                    return Handled::Nothing;
                };
                Handled::Activity(PushedActivity {
                    id: signature,
                    addresses: vec![address.clone()],
                    logs,
                    timestamp: Utc::now(),
                    raw,
                })
            }
        }
    }
}

struct LogsSession {
    ws: WsStream,
    commitment: String,
    book: SubscriptionBook,
}

impl LogsSession {
    async fn send_json(&mut self, request: Value) -> Result<(), WatchError> {
        self.ws
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| WatchError::Transport(format!("websocket send failed: {e}")))
    }

    async fn unsubscribe(&mut self, subscription: u64) -> Result<(), WatchError> {
        let id = self.book.request_id();
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "logsUnsubscribe",
            "params": [subscription]
        }))
        .await
    }
}

#[async_trait]
impl PushSession for LogsSession {
    async fn subscribe(&mut self, addresses: &[String]) -> Result<(), WatchError> {
        for subscription in self.book.replace() {
            self.unsubscribe(subscription).await?;
        }

        for address in addresses {
            let id = self.book.request_id();
            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "logsSubscribe",
                "params": [
                    {"mentions": [address]},
                    {"commitment": self.commitment}
                ]
            });
            self.send_json(request).await?;
            self.book.requested(id, address);
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), WatchError> {
        self.ws
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| WatchError::Transport(format!("websocket ping failed: {e}")))
    }

    async fn next_activity(&mut self) -> Option<Result<PushedActivity, WatchError>> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(WatchError::Transport(format!("websocket error: {e}")))),
            };
            match message {
                Message::Text(text) => match self.book.handle_text(&text) {
                    Handled::Activity(activity) => return Some(Ok(activity)),
                    Handled::Cancel(subscription) => {
                        if let Err(e) = self.unsubscribe(subscription).await {
                            return Some(Err(e));
                        }
                    }
                    Handled::Nothing => {}
                },
                Message::Close(frame) => {
                    warn!(?frame, "websocket closed by upstream");
                    return None;
                }
                // tungstenite answers pings itself
                _ => {}
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Ack { id: u64, subscription: u64 },
    Error { id: Option<u64>, message: String },
    Logs {
        subscription: u64,
        signature: String,
        logs: Vec<String>,
        raw: Value,
    },
}

fn parse_inbound(text: &str) -> Option<Inbound> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "skipping non-JSON websocket message");
            return None;
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Some(Inbound::Error {
            id: value.get("id").and_then(Value::as_u64),
            message,
        });
    }

    if let (Some(id), Some(result)) = (value.get("id").and_then(Value::as_u64), value.get("result")) {
        // logsUnsubscribe acks carry a boolean result
        return result
            .as_u64()
            .map(|subscription| Inbound::Ack { id, subscription });
    }

    if value.get("method").and_then(Value::as_str) != Some("logsNotification") {
        return None;
    }

    let params = value.get("params")?;
    let subscription = params.get("subscription")?.as_u64()?;
    let event = params.get("result")?.get("value")?;
    let signature = event.get("signature")?.as_str()?.to_string();
    let logs = event
        .get("logs")
        .and_then(Value::as_array)
        .map(|lines| lines.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    Some(Inbound::Logs {
        subscription,
        signature,
        logs,
        raw: event.clone(),
    })
}
