//! MQTT Protocol Gateway
//!
//! Bridges MQTT clients to a request/response backend:
//!
//! - **Registration**: every broker session gets a backend connection identity
//! - **Requests**: publishes on the request topic (or room) are decoded and
//!   executed by the backend; responses go back to the sender only
//! - **Pushes**: the backend can broadcast to channels, notify a single
//!   connection, manage room membership and close connections
//! - **Topic policy**: reserved names are protected from client traffic
//!
//! # Architecture
//!
//! The [`broker::EmbeddedBroker`] accepts MQTT 3.1.1 clients over TCP and
//! raises lifecycle hooks. The [`Gateway`] implements those hooks, keeps the
//! [`registry::ConnectionRegistry`] and [`channels::ChannelTable`], and talks to
//! a [`backend::BackendRouter`].
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "port": 1883,
//!   "allow-pub-sub": false,
//!   "routing": {
//!     "mode": "topics",
//!     "request-topic": "gateway/request",
//!     "response-topic": "gateway/response",
//!     "correlation": "per-request"
//!   },
//!   "general": {
//!     "log-packets": false
//!   }
//! }
//! ```

pub mod acl;
pub mod backend;
pub mod broker;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mqtt;
pub mod registry;
pub mod routing;

// Re-export main types
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Broadcast, ChannelMembership, Gateway, GatewayApi, Notification};
