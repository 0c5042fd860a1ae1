//! Loopback backend router
//!
//! Answers every request with its own body. Lets the gateway run standalone.

use super::{BackendRouter, ClientConnection, ConnectionDescriptor, ConnectionId, Request, Response};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Backend that echoes requests back to their sender
#[derive(Debug, Default)]
pub struct LoopbackRouter {
    connections: DashMap<ConnectionId, ClientConnection>,
}

impl LoopbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connection identities currently minted
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl BackendRouter for LoopbackRouter {
    async fn new_connection(&self, descriptor: ConnectionDescriptor) -> Result<ClientConnection> {
        let id = ConnectionId::new(Uuid::new_v4().to_string());
        let connection = ClientConnection::new(id.clone(), descriptor);
        self.connections.insert(id, connection.clone());
        debug!(connection_id = %connection.id, "Loopback connection created");
        Ok(connection)
    }

    async fn remove_connection(&self, connection: &ClientConnection) {
        if self.connections.remove(&connection.id).is_some() {
            debug!(connection_id = %connection.id, "Loopback connection removed");
        }
    }

    async fn execute(&self, request: Request) -> Response {
        if !self.connections.contains_key(&request.context.connection_id) {
            return Response::error(401, "unknown connection");
        }

        let request_id = request.request_id().map(str::to_string);
        let response = Response::ok(request.body);
        match request_id {
            Some(id) => response.with_request_id(id),
            None => response,
        }
    }
}
