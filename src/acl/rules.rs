//! ACL request and decision types

use serde::{Deserialize, Serialize};

/// Broker operation being authorized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MqttAction {
    Publish,
    Subscribe,
}

/// ACL evaluation request
#[derive(Debug, Clone)]
pub struct AclRequest<'a> {
    /// MQTT client identifier (for logging only)
    pub client_id: &'a str,
    /// Topic or topic filter being accessed
    pub topic: &'a str,
    /// Action being performed
    pub action: MqttAction,
}

/// Result of ACL evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDecision {
    /// Whether access is allowed
    pub allowed: bool,
    /// Reason for the decision
    pub reason: &'static str,
}

impl AclDecision {
    pub fn allow(reason: &'static str) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    pub fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// `#` and `+` are reserved by the transport
pub fn contains_wildcard(topic: &str) -> bool {
    topic.contains('#') || topic.contains('+')
}
