//! Gateway orchestration.
//!
//! Wires broker lifecycle events to the connection registry, turns request
//! publishes into backend executions, and routes backend pushes (broadcast,
//! notify, channel membership, administrative close) back out through the
//! broker.
//!
//! The registry and the channel table live behind one mutex so that lookups
//! and mutations stay atomic with respect to each other. The lock is never
//! held across a backend call.

use crate::acl::TopicPolicy;
use crate::backend::{BackendRouter, ConnectionDescriptor, ConnectionId, Request, Response};
use crate::broker::{Broker, BrokerClient, BrokerHooks, SessionId};
use crate::channels::ChannelTable;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::mqtt::ParsedPublish;
use crate::registry::{Completion, ConnectionRegistry, ConnectionState};
use crate::routing::{FanOut, RoutingStrategy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reason given to the broker when the backend closes a connection.
pub const CLOSED_ON_REQUEST: &str = "CLOSEDONREQUEST";

// ============================================================================
// Backend → Gateway messages
// ============================================================================

/// Push a payload to every subscriber of the given channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub payload: Value,
    pub channels: Vec<String>,
}

/// Push a payload to one connection, once per channel label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub connection_id: ConnectionId,
    pub payload: Value,
    pub channels: Vec<String>,
}

/// Channel join/leave request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMembership {
    pub id: ConnectionId,
    pub channel: String,
}

/// Operations the backend may invoke on the gateway.
///
/// Delivery methods return the number of successful deliveries.
pub trait GatewayApi: Send + Sync {
    fn broadcast(&self, message: &Broadcast) -> usize;

    fn notify(&self, message: &Notification) -> usize;

    fn join_channel(&self, membership: &ChannelMembership);

    fn leave_channel(&self, membership: &ChannelMembership);

    fn disconnect(&self, connection_id: &ConnectionId);
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Default)]
struct GatewayState {
    registry: ConnectionRegistry,
    channels: ChannelTable,
}

/// MQTT protocol gateway
pub struct Gateway {
    routing: Arc<RoutingStrategy>,
    policy: TopicPolicy,
    log_packets: bool,
    backend: Arc<dyn BackendRouter>,
    broker: Arc<dyn Broker>,
    state: Arc<Mutex<GatewayState>>,
}

impl Gateway {
    /// Create a gateway; fails if the configuration is incomplete.
    pub fn new(
        config: &GatewayConfig,
        backend: Arc<dyn BackendRouter>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        config.validate()?;

        let routing = RoutingStrategy::from_config(&config.routing);
        let policy = TopicPolicy::new(routing.clone(), config.allow_pub_sub);

        Ok(Self {
            routing: Arc::new(routing),
            policy,
            log_packets: config.general.log_packets,
            backend,
            broker,
            state: Arc::new(Mutex::new(GatewayState::default())),
        })
    }

    pub fn routing(&self) -> &RoutingStrategy {
        &self.routing
    }

    /// Track a freshly accepted client before any of its traffic is seen.
    ///
    /// Returns false when the session is already tracked.
    pub fn on_accept(&self, client: Arc<dyn BrokerClient>) -> bool {
        let session = client.session_id();
        let tracked = self.state.lock().registry.begin(client);
        if !tracked {
            warn!(session = %session, "Session already tracked, ignoring connect");
        }
        tracked
    }

    /// Track and register a client in one step.
    pub async fn on_connect(&self, client: Arc<dyn BrokerClient>) {
        if self.on_accept(Arc::clone(&client)) {
            self.register(client).await;
        }
    }

    /// Register an accepted client with the backend.
    ///
    /// A rejected registration closes the client. A client that disconnected
    /// before or during registration ends up fully deregistered.
    pub async fn register(&self, client: Arc<dyn BrokerClient>) {
        let session = client.session_id();

        let state = self.state.lock().registry.state(session);
        match state {
            Some(ConnectionState::Unregistered) => {}
            Some(ConnectionState::Closing) => {
                self.state.lock().registry.abort(session);
                debug!(session = %session, "Client left before registration started");
                return;
            }
            Some(ConnectionState::Registered) | None => return,
        }

        let descriptor = ConnectionDescriptor::new(client.remote_addr());
        let connection = match self.backend.new_connection(descriptor).await {
            Ok(connection) => connection,
            Err(e) => {
                self.state.lock().registry.abort(session);
                error!(
                    session = %session,
                    client_id = %client.client_id(),
                    error = %e,
                    "Unable to register new connection"
                );
                client.close(None);
                return;
            }
        };

        let completion = self
            .state
            .lock()
            .registry
            .complete(session, connection.clone());

        match completion {
            Completion::Registered => {
                info!(
                    session = %session,
                    client_id = %client.client_id(),
                    connection_id = %connection.id,
                    "Connection registered"
                );
            }
            Completion::Abandoned => {
                info!(
                    session = %session,
                    connection_id = %connection.id,
                    "Client left before registration completed, releasing"
                );
                self.backend.remove_connection(&connection).await;
            }
        }
    }

    /// Deregister a client. Safe to call more than once per disconnect.
    pub async fn on_disconnect(&self, client: &dyn BrokerClient) {
        let session = client.session_id();

        let released = {
            let mut state = self.state.lock();
            let released = state.registry.begin_close(session);
            if let Some(connection) = &released {
                state.channels.leave_all(&connection.id);
            }
            released
        };

        let Some(connection) = released else {
            return;
        };

        self.backend.remove_connection(&connection).await;
        self.state.lock().registry.finish_close(session);

        info!(
            session = %session,
            connection_id = %connection.id,
            "Connection released"
        );
    }

    /// Handle a publish delivered by the broker.
    ///
    /// Returns the in-flight execution when the publish became a backend
    /// request; `None` when it was ignored or dropped.
    pub fn on_message(
        &self,
        packet: &ParsedPublish,
        client: &Arc<dyn BrokerClient>,
    ) -> Option<JoinHandle<()>> {
        if self.log_packets {
            debug!(
                client_id = %client.client_id(),
                topic = %packet.topic,
                size = packet.payload.len(),
                "Inbound publish"
            );
        }

        if !self.routing.is_request_target(&packet.topic) {
            return None;
        }

        let request = match self.decode_request(packet, client.session_id()) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(
                    session = %client.session_id(),
                    "Request from unregistered session ignored"
                );
                return None;
            }
            Err(e) => {
                warn!(
                    client_id = %client.client_id(),
                    error = %e,
                    "Dropping malformed request"
                );
                return None;
            }
        };

        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let routing = Arc::clone(&self.routing);

        Some(tokio::spawn(async move {
            let connection_id = request.context.connection_id.clone();
            let response = backend.execute(request).await;
            deliver_response(&state, &routing, &connection_id, &response);
        }))
    }

    /// Build the backend request for a publish from a live session.
    pub fn decode_request(
        &self,
        packet: &ParsedPublish,
        session: SessionId,
    ) -> Result<Option<Request>> {
        let connection_id = self.state.lock().registry.resolve(session).cloned();
        let Some(connection_id) = connection_id else {
            return Ok(None);
        };

        let body: Value = serde_json::from_slice(&packet.payload)?;
        Ok(Some(Request::new(body, connection_id)))
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.live_count()
    }

    /// Backend id of a live session.
    pub fn resolve(&self, session: SessionId) -> Option<ConnectionId> {
        self.state.lock().registry.resolve(session).cloned()
    }

    pub fn connection_state(&self, session: SessionId) -> Option<ConnectionState> {
        self.state.lock().registry.state(session)
    }

    pub fn channel_members(&self, channel: &str) -> Vec<ConnectionId> {
        self.state.lock().channels.members_of(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    fn client_for(&self, id: &ConnectionId) -> Option<Arc<dyn BrokerClient>> {
        self.state.lock().registry.resolve_by_id(id).cloned()
    }

    fn fan_out_to_members(&self, channel: &str, payload: &[u8]) -> usize {
        let targets: Vec<Arc<dyn BrokerClient>> = {
            let state = self.state.lock();
            state
                .channels
                .members_of(channel)
                .iter()
                .filter_map(|id| state.registry.resolve_by_id(id).cloned())
                .collect()
        };

        targets
            .iter()
            .filter(|client| deliver(client.as_ref(), channel, payload))
            .count()
    }
}

fn serialize(payload: &Value) -> Option<Vec<u8>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to serialize payload");
            None
        }
    }
}

fn deliver(client: &dyn BrokerClient, topic: &str, payload: &[u8]) -> bool {
    match client.forward(topic, payload) {
        Ok(()) => true,
        Err(e) => {
            debug!(
                session = %client.session_id(),
                topic = %topic,
                error = %e,
                "Failed to forward to client"
            );
            false
        }
    }
}

fn deliver_response(
    state: &Mutex<GatewayState>,
    routing: &RoutingStrategy,
    connection_id: &ConnectionId,
    response: &Response,
) -> bool {
    let client = state.lock().registry.resolve_by_id(connection_id).cloned();
    let Some(client) = client else {
        debug!(
            connection_id = %connection_id,
            "Connection gone before response, dropping"
        );
        return false;
    };

    let Some(payload) = serialize(&response.content) else {
        return false;
    };

    let topic = routing.resolve_response_target(response);
    deliver(client.as_ref(), &topic, &payload)
}

impl GatewayApi for Gateway {
    fn broadcast(&self, message: &Broadcast) -> usize {
        let Some(payload) = serialize(&message.payload) else {
            return 0;
        };

        match self.routing.fan_out() {
            FanOut::BrokerTopic => message
                .channels
                .iter()
                .filter(|channel| match self.broker.publish(channel, &payload) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Broadcast publish failed");
                        false
                    }
                })
                .count(),
            FanOut::ChannelMembers => message
                .channels
                .iter()
                .map(|channel| self.fan_out_to_members(channel, &payload))
                .sum(),
        }
    }

    fn notify(&self, message: &Notification) -> usize {
        let Some(client) = self.client_for(&message.connection_id) else {
            debug!(
                connection_id = %message.connection_id,
                "Notification for unknown connection skipped"
            );
            return 0;
        };

        let Some(payload) = serialize(&message.payload) else {
            return 0;
        };

        message
            .channels
            .iter()
            .filter(|channel| deliver(client.as_ref(), channel, &payload))
            .count()
    }

    fn join_channel(&self, membership: &ChannelMembership) {
        if self.routing.fan_out() == FanOut::BrokerTopic {
            // Topic subscriptions are handled by the broker itself
            return;
        }

        let mut state = self.state.lock();
        if !state.registry.is_live(&membership.id) {
            debug!(connection_id = %membership.id, "Join from unknown connection ignored");
            return;
        }
        if state.channels.join(&membership.id, &membership.channel) {
            debug!(
                connection_id = %membership.id,
                channel = %membership.channel,
                "Joined channel"
            );
        }
    }

    fn leave_channel(&self, membership: &ChannelMembership) {
        if self.routing.fan_out() == FanOut::BrokerTopic {
            return;
        }

        let mut state = self.state.lock();
        if !state.registry.is_live(&membership.id) {
            return;
        }
        if state.channels.leave(&membership.id, &membership.channel) {
            debug!(
                connection_id = %membership.id,
                channel = %membership.channel,
                "Left channel"
            );
        }
    }

    fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some(client) = self.client_for(connection_id) {
            info!(connection_id = %connection_id, "Closing connection on backend request");
            client.close(Some(CLOSED_ON_REQUEST));
        }
    }
}

#[async_trait]
impl BrokerHooks for Gateway {
    fn client_accepted(&self, client: Arc<dyn BrokerClient>) {
        self.on_accept(client);
    }

    async fn client_connected(&self, client: Arc<dyn BrokerClient>) {
        self.register(client).await;
    }

    async fn client_disconnecting(&self, client: Arc<dyn BrokerClient>) {
        self.on_disconnect(client.as_ref()).await;
    }

    async fn client_disconnected(&self, client: Arc<dyn BrokerClient>) {
        self.on_disconnect(client.as_ref()).await;
    }

    async fn published(&self, packet: ParsedPublish, client: Arc<dyn BrokerClient>) {
        // Executions run detached; responses arrive in completion order
        let _ = self.on_message(&packet, &client);
    }

    fn authorize_publish(&self, client: &dyn BrokerClient, topic: &str, _payload: &[u8]) -> bool {
        let allowed = self.policy.authorize_publish(client.client_id(), topic);
        if !allowed {
            info!(client_id = %client.client_id(), topic = %topic, "PUBLISH denied by topic policy");
        }
        allowed
    }

    fn authorize_subscribe(&self, client: &dyn BrokerClient, topic: &str) -> bool {
        let allowed = self.policy.authorize_subscribe(client.client_id(), topic);
        if !allowed {
            info!(client_id = %client.client_id(), topic = %topic, "SUBSCRIBE denied by topic policy");
        }
        allowed
    }
}
