//! Topic access control module
//!
//! Keeps clients from publishing into the channel the backend answers on,
//! from listening on the channel the backend reads requests from, and from
//! using wildcard filters to reach either.

mod policy;
mod rules;

pub use policy::TopicPolicy;
pub use rules::{AclDecision, AclRequest, MqttAction};
