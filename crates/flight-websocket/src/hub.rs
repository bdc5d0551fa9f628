//! WebSocket connection hub
//!
//! Tracks every live observer connection, its operator identity and its
//! flight subscriptions, and fans server messages out to them.

use crate::error::{WsError, WsResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flight_core::{Broadcaster, ClientMessage, OperatorId, ServerMessage, SessionId};
use flight_metrics::MetricsCollector;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue depth per connection
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Decides whether an operator may observe a flight
#[async_trait]
pub trait FlightAccess: Send + Sync {
    async fn can_observe(&self, operator_id: &OperatorId, flight_id: &SessionId) -> bool;
}

/// State for a connected client
#[derive(Debug)]
struct ClientState {
    operator_id: OperatorId,
    subscriptions: HashSet<SessionId>,
    tx: mpsc::Sender<ServerMessage>,
    connected_at: DateTime<Utc>,
}

/// WebSocket connection hub
pub struct WebSocketHub {
    clients: DashMap<Uuid, ClientState>,
    access: Arc<dyn FlightAccess>,
    client_buffer: usize,
    /// Messages queued for delivery
    sent: AtomicU64,
    /// Messages dropped because a connection's queue was full or closed
    dropped: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WebSocketHub {
    pub fn new(access: Arc<dyn FlightAccess>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            clients: DashMap::new(),
            access,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn with_client_buffer(mut self, capacity: usize) -> Self {
        self.client_buffer = capacity.max(1);
        self
    }

    /// Register an authenticated connection and return its outbound queue
    pub fn register_client(&self, client_id: Uuid, operator_id: OperatorId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.client_buffer);
        let state = ClientState {
            operator_id,
            subscriptions: HashSet::new(),
            tx,
            connected_at: Utc::now(),
        };

        self.clients.insert(client_id, state);
        info!(client_id = %client_id, total = self.clients.len(), "Client registered");
        self.update_gauge();
        rx
    }

    pub fn unregister_client(&self, client_id: Uuid) {
        if let Some((_, state)) = self.clients.remove(&client_id) {
            let connected_s = (Utc::now() - state.connected_at).num_seconds();
            info!(
                client_id = %client_id,
                operator_id = %state.operator_id,
                connected_s,
                remaining = self.clients.len(),
                "Client unregistered"
            );
        }
        self.update_gauge();
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_client_connected(&self, client_id: Uuid) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Connections currently subscribed to `flight_id`
    pub fn subscriber_count(&self, flight_id: &SessionId) -> usize {
        self.clients
            .iter()
            .filter(|c| c.subscriptions.contains(flight_id))
            .count()
    }

    pub fn message_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe a connection to a flight its operator owns
    pub async fn subscribe(&self, client_id: Uuid, flight_id: SessionId) -> WsResult<()> {
        let operator_id = self
            .clients
            .get(&client_id)
            .map(|c| c.operator_id.clone())
            .ok_or_else(|| WsError::ClientNotFound(client_id.to_string()))?;

        // No map guard may be held across this await
        if !self.access.can_observe(&operator_id, &flight_id).await {
            debug!(client_id = %client_id, flight_id = %flight_id, "Subscription denied");
            return Err(WsError::AccessDenied);
        }

        let mut client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| WsError::ClientNotFound(client_id.to_string()))?;
        client.subscriptions.insert(flight_id);
        debug!(client_id = %client_id, flight_id = %flight_id, "Client subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: Uuid, flight_id: &SessionId) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.subscriptions.remove(flight_id);
            debug!(client_id = %client_id, flight_id = %flight_id, "Client unsubscribed");
        }
    }

    /// Handle one text frame from a client and return the direct reply
    pub async fn handle_text(&self, client_id: Uuid, text: &str) -> ServerMessage {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(reply) => return reply,
        };

        match message {
            ClientMessage::Subscribe { flight_id } => match self.subscribe(client_id, flight_id).await {
                Ok(()) => ServerMessage::Subscribed { flight_id },
                Err(e) => ServerMessage::error(e.to_string()),
            },
            ClientMessage::Unsubscribe { flight_id } => {
                self.unsubscribe(client_id, &flight_id);
                ServerMessage::Unsubscribed { flight_id }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Non-blocking enqueue. A full or closed queue drops the message.
    fn deliver(&self, client_id: &Uuid, client: &ClientState, message: ServerMessage) -> bool {
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %client_id, "Client queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id = %client_id, "Client queue closed, message dropped");
                false
            }
        }
    }

    fn fan_out<F>(&self, message: ServerMessage, mut wants: F) -> usize
    where
        F: FnMut(&ClientState) -> bool,
    {
        let mut sent = 0;
        let mut dropped = 0;
        for entry in self.clients.iter() {
            if !wants(entry.value()) {
                continue;
            }
            if self.deliver(entry.key(), entry.value(), message.clone()) {
                sent += 1;
            } else {
                dropped += 1;
            }
        }

        self.sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_ws_delivery(sent, dropped);
        }
        sent
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_ws_connections(self.clients.len() as i64);
        }
    }
}

impl Broadcaster for WebSocketHub {
    fn send_to_flight(&self, flight_id: &SessionId, message: ServerMessage) -> usize {
        self.fan_out(message, |c| c.subscriptions.contains(flight_id))
    }

    fn send_to_operator(&self, operator_id: &OperatorId, message: ServerMessage) -> usize {
        self.fan_out(message, |c| &c.operator_id == operator_id)
    }
}

fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ServerMessage::error("Invalid message format"))?;

    match value.get("type").and_then(|t| t.as_str()) {
        Some("subscribe" | "unsubscribe" | "ping") => {}
        _ => return Err(ServerMessage::error("Unknown message type")),
    }

    serde_json::from_value(value).map_err(|e| ServerMessage::error(format!("Invalid message format: {e}")))
}

// ============================================================================
// TESTS
// ============================================================================
