//! Backend router contract
//!
//! The gateway only needs three things from the application behind it:
//! mint a connection identity, release it, and execute a request.

mod loopback;

pub use loopback::LoopbackRouter;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol tag attached to every connection and request from this gateway.
pub const PROTOCOL: &str = "mqtt";

/// Backend-assigned opaque connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What the backend is told about a new client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    pub protocol: String,
    pub ips: Vec<String>,
}

impl ConnectionDescriptor {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            ips: vec![remote_addr.into()],
        }
    }
}

/// Connection context returned by the backend on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub protocol: String,
    pub ips: Vec<String>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, descriptor: ConnectionDescriptor) -> Self {
        Self {
            id,
            protocol: descriptor.protocol,
            ips: descriptor.ips,
        }
    }
}

/// Identity a request executes under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    pub protocol: String,
}

/// Request submitted to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Decoded client payload
    pub body: Value,
    pub context: RequestContext,
}

impl Request {
    pub fn new(body: Value, connection_id: ConnectionId) -> Self {
        Self {
            body,
            context: RequestContext {
                connection_id,
                protocol: PROTOCOL.to_string(),
            },
        }
    }

    /// `requestId` field of the body, if the client supplied one.
    pub fn request_id(&self) -> Option<&str> {
        self.body.get("requestId").and_then(Value::as_str)
    }
}

/// Response produced by the backend.
///
/// Application-level failures are ordinary responses with an error status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Body forwarded to the client
    pub content: Value,
}

impl Response {
    pub fn ok(content: Value) -> Self {
        Self {
            status: 200,
            request_id: None,
            content,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            request_id: None,
            content: serde_json::json!({
                "status": status,
                "error": { "message": message.into() },
            }),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Application router the gateway drives.
#[async_trait]
pub trait BackendRouter: Send + Sync {
    /// Mint a connection identity for a freshly accepted client.
    async fn new_connection(&self, descriptor: ConnectionDescriptor) -> Result<ClientConnection>;

    /// Release a connection identity.
    async fn remove_connection(&self, connection: &ClientConnection);

    /// Execute a request; the future resolves exactly once.
    async fn execute(&self, request: Request) -> Response;
}
