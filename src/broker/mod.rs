//! Broker collaborator contract
//!
//! The gateway consumes the broker through these traits: lifecycle hooks in,
//! publish/forward/close out. [`EmbeddedBroker`] is the TCP implementation
//! shipped with the binary.
//!
//! Per session the hooks arrive as `client_accepted`, then
//! `client_connected` (spawned) racing the session's traffic, then
//! `client_disconnecting` and `client_disconnected`.

mod embedded;

pub use embedded::{EmbeddedBroker, Session};

use crate::error::Result;
use crate::mqtt::ParsedPublish;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Broker-side key of one client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Broker-wide outbound primitive.
pub trait Broker: Send + Sync {
    /// Publish to a topic; the broker fans out to its subscribers.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// One connected client as seen through the broker.
pub trait BrokerClient: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// MQTT client identifier from CONNECT
    fn client_id(&self) -> &str;

    /// Peer address of the socket
    fn remote_addr(&self) -> String;

    /// Deliver a message to this client only, at QoS 0.
    fn forward(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Close the underlying socket.
    fn close(&self, reason: Option<&str>);
}

/// Events and authorization callbacks the broker raises.
#[async_trait]
pub trait BrokerHooks: Send + Sync {
    /// Raised inline once CONNECT is accepted, before the session reads
    /// another packet. Anything that must be visible to a disconnect
    /// belongs here rather than in `client_connected`.
    fn client_accepted(&self, client: Arc<dyn BrokerClient>);

    /// Raised concurrently with the session after `client_accepted`.
    async fn client_connected(&self, client: Arc<dyn BrokerClient>);

    async fn client_disconnecting(&self, client: Arc<dyn BrokerClient>);

    async fn client_disconnected(&self, client: Arc<dyn BrokerClient>);

    async fn published(&self, packet: ParsedPublish, client: Arc<dyn BrokerClient>);

    fn authorize_publish(&self, client: &dyn BrokerClient, topic: &str, payload: &[u8]) -> bool;

    fn authorize_subscribe(&self, client: &dyn BrokerClient, topic: &str) -> bool;
}
