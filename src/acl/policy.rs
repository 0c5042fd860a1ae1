//! Topic authorization policy

use crate::routing::RoutingStrategy;
use tracing::debug;

use super::rules::{contains_wildcard, AclDecision, AclRequest, MqttAction};

/// Topic policy - decides publish/subscribe rights against the reserved topics
///
/// * the request topic is publish-only: nobody but the gateway listens to it
/// * the response topic is subscribe-only: nobody but the gateway writes to it
#[derive(Debug, Clone)]
pub struct TopicPolicy {
    routing: RoutingStrategy,
    allow_pub_sub: bool,
}

impl TopicPolicy {
    pub fn new(routing: RoutingStrategy, allow_pub_sub: bool) -> Self {
        Self {
            routing,
            allow_pub_sub,
        }
    }

    /// Evaluate an ACL request
    pub fn evaluate(&self, request: &AclRequest<'_>) -> AclDecision {
        let decision = match request.action {
            MqttAction::Publish => self.evaluate_publish(request.topic),
            MqttAction::Subscribe => self.evaluate_subscribe(request.topic),
        };

        debug!(
            client_id = %request.client_id,
            topic = %request.topic,
            action = ?request.action,
            allowed = decision.allowed,
            reason = decision.reason,
            "Topic policy evaluated"
        );

        decision
    }

    fn evaluate_publish(&self, topic: &str) -> AclDecision {
        if !self.allow_pub_sub {
            return if self.routing.is_request_target(topic) {
                AclDecision::allow("request topic")
            } else {
                AclDecision::deny("pub/sub disabled, only the request topic is writable")
            };
        }

        if self.routing.is_response_target(topic) {
            AclDecision::deny("response topic is subscribe-only")
        } else if contains_wildcard(topic) {
            AclDecision::deny("wildcards are not allowed")
        } else {
            AclDecision::allow("pub/sub enabled")
        }
    }

    fn evaluate_subscribe(&self, topic: &str) -> AclDecision {
        if self.routing.is_request_target(topic) {
            AclDecision::deny("request topic is publish-only")
        } else if contains_wildcard(topic) {
            AclDecision::deny("wildcards are not allowed")
        } else {
            AclDecision::allow("subscribable topic")
        }
    }

    /// Check if a topic can be published to
    pub fn authorize_publish(&self, client_id: &str, topic: &str) -> bool {
        self.evaluate(&AclRequest {
            client_id,
            topic,
            action: MqttAction::Publish,
        })
        .allowed
    }

    /// Check if a topic filter can be subscribed to
    pub fn authorize_subscribe(&self, client_id: &str, topic: &str) -> bool {
        self.evaluate(&AclRequest {
            client_id,
            topic,
            action: MqttAction::Subscribe,
        })
        .allowed
    }
}
