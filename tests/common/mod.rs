//! Recording collaborators for gateway tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mqtt_protocol_gateway::backend::{
    BackendRouter, ClientConnection, ConnectionDescriptor, ConnectionId, Request, Response,
};
use mqtt_protocol_gateway::broker::{Broker, BrokerClient, SessionId};
use mqtt_protocol_gateway::config::{GatewayConfig, ResponseCorrelation, RoutingConfig};
use mqtt_protocol_gateway::{Gateway, GatewayError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Broker side
// ============================================================================

/// Client that records what it is sent.
pub struct MockClient {
    session: SessionId,
    client_id: String,
    pub forwarded: Mutex<Vec<(String, Vec<u8>)>>,
    pub closed: Mutex<Vec<Option<String>>>,
    pub fail_forward: AtomicBool,
}

impl MockClient {
    pub fn new(session: u64) -> Arc<Self> {
        Arc::new(Self {
            session: SessionId(session),
            client_id: format!("client-{}", session),
            forwarded: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            fail_forward: AtomicBool::new(false),
        })
    }

    /// Forwarded messages with payloads decoded as JSON.
    pub fn received(&self) -> Vec<(String, Value)> {
        self.forwarded
            .lock()
            .iter()
            .map(|(topic, payload)| {
                let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
                (topic.clone(), value)
            })
            .collect()
    }

    pub fn close_reasons(&self) -> Vec<Option<String>> {
        self.closed.lock().clone()
    }
}

impl BrokerClient for MockClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn remote_addr(&self) -> String {
        format!("10.0.0.{}:50000", self.session.0)
    }

    fn forward(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(GatewayError::Delivery("socket gone".to_string()));
        }
        self.forwarded.lock().push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn close(&self, reason: Option<&str>) {
        self.closed.lock().push(reason.map(str::to_string));
    }
}

/// Broker that records topic publishes.
#[derive(Default)]
pub struct MockBroker {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockBroker {
    pub fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl Broker for MockBroker {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published.lock().push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Backend side
// ============================================================================

/// Backend that mints sequential ids and echoes request bodies.
///
/// A body carrying `"delayMs"` delays its response by that long.
#[derive(Default)]
pub struct MockBackend {
    next_id: AtomicU64,
    pub reject: AtomicBool,
    pub registered: Mutex<Vec<ClientConnection>>,
    pub removed: Mutex<Vec<ConnectionId>>,
    pub executed: Mutex<Vec<Request>>,
    registration_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold every registration until the returned handle is notified.
    pub fn gate_registrations(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.registration_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn removed_ids(&self) -> Vec<ConnectionId> {
        self.removed.lock().clone()
    }

    pub fn executed_bodies(&self) -> Vec<Value> {
        self.executed.lock().iter().map(|r| r.body.clone()).collect()
    }
}

#[async_trait]
impl BackendRouter for MockBackend {
    async fn new_connection(&self, descriptor: ConnectionDescriptor) -> Result<ClientConnection> {
        let gate = self.registration_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.reject.load(Ordering::SeqCst) {
            return Err(GatewayError::Registration("backend refused".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = ClientConnection::new(ConnectionId::new(format!("conn-{}", n)), descriptor);
        self.registered.lock().push(connection.clone());
        Ok(connection)
    }

    async fn remove_connection(&self, connection: &ClientConnection) {
        self.removed.lock().push(connection.id.clone());
    }

    async fn execute(&self, request: Request) -> Response {
        self.executed.lock().push(request.clone());

        if let Some(ms) = request.body.get("delayMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let request_id = request.request_id().map(str::to_string);
        let response = Response::ok(request.body);
        match request_id {
            Some(id) => response.with_request_id(id),
            None => response,
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub backend: Arc<MockBackend>,
    pub broker: Arc<MockBroker>,
}

impl Harness {
    pub fn new(config: GatewayConfig) -> Self {
        let backend = MockBackend::new();
        let broker = Arc::new(MockBroker::default());
        let gateway = Gateway::new(&config, backend.clone(), broker.clone())
            .expect("valid test configuration");

        Self {
            gateway: Arc::new(gateway),
            backend,
            broker,
        }
    }

    /// Connect a client and return it once registered.
    pub async fn connect(&self, session: u64) -> Arc<MockClient> {
        let client = MockClient::new(session);
        self.gateway.on_connect(client.clone()).await;
        client
    }

    pub fn id_of(&self, client: &MockClient) -> ConnectionId {
        self.gateway
            .resolve(client.session_id())
            .expect("client is registered")
    }
}

pub fn topic_config(correlation: ResponseCorrelation) -> GatewayConfig {
    GatewayConfig {
        routing: RoutingConfig::Topics {
            request_topic: "req".to_string(),
            response_topic: "resp".to_string(),
            correlation,
        },
        ..GatewayConfig::default()
    }
}

pub fn room_config() -> GatewayConfig {
    GatewayConfig {
        routing: RoutingConfig::Rooms {
            room: "lobby".to_string(),
            response_room: "lobby-response".to_string(),
            correlation: ResponseCorrelation::Fixed,
        },
        ..GatewayConfig::default()
    }
}
