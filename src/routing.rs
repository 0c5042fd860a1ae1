//! Request/response routing strategy.
//!
//! Resolved once from [`RoutingConfig`] so the gateway never branches on
//! configuration shape while handling traffic.

use crate::backend::Response;
use crate::config::{ResponseCorrelation, RoutingConfig};

/// How pushes from the backend reach clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Publish once on the broker topic and let the broker fan out.
    BrokerTopic,
    /// Forward individually to each member of the named channel.
    ChannelMembers,
}

/// Routing strategy for one gateway instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingStrategy {
    TopicBased {
        request_topic: String,
        response_topic: String,
        correlation: ResponseCorrelation,
    },
    RoomBased {
        room: String,
        response_room: String,
        correlation: ResponseCorrelation,
    },
}

impl RoutingStrategy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        match config.clone() {
            RoutingConfig::Topics {
                request_topic,
                response_topic,
                correlation,
            } => Self::TopicBased {
                request_topic,
                response_topic,
                correlation,
            },
            RoutingConfig::Rooms {
                room,
                response_room,
                correlation,
            } => Self::RoomBased {
                room,
                response_room,
                correlation,
            },
        }
    }

    /// Topic (or room) clients publish requests on.
    pub fn request_target(&self) -> &str {
        match self {
            Self::TopicBased { request_topic, .. } => request_topic,
            Self::RoomBased { room, .. } => room,
        }
    }

    /// Base topic (or room) responses are delivered on.
    pub fn response_base(&self) -> &str {
        match self {
            Self::TopicBased { response_topic, .. } => response_topic,
            Self::RoomBased { response_room, .. } => response_room,
        }
    }

    pub fn correlation(&self) -> ResponseCorrelation {
        match self {
            Self::TopicBased { correlation, .. } | Self::RoomBased { correlation, .. } => {
                *correlation
            }
        }
    }

    pub fn fan_out(&self) -> FanOut {
        match self {
            Self::TopicBased { .. } => FanOut::BrokerTopic,
            Self::RoomBased { .. } => FanOut::ChannelMembers,
        }
    }

    /// Whether an inbound publish is a request for the backend.
    pub fn is_request_target(&self, topic: &str) -> bool {
        topic == self.request_target()
    }

    /// Whether a topic is one the backend answers on.
    ///
    /// With per-request correlation this covers every `<base>/<id>` topic too.
    pub fn is_response_target(&self, topic: &str) -> bool {
        let base = self.response_base();
        if topic == base {
            return true;
        }
        self.correlation() == ResponseCorrelation::PerRequest
            && topic.len() > base.len() + 1
            && topic.starts_with(base)
            && topic.as_bytes()[base.len()] == b'/'
    }

    /// Topic a given response must be forwarded on.
    pub fn resolve_response_target(&self, response: &Response) -> String {
        let base = self.response_base();
        match (self.correlation(), response.request_id.as_deref()) {
            (ResponseCorrelation::PerRequest, Some(id)) if !id.is_empty() => {
                format!("{}/{}", base, id)
            }
            _ => base.to_string(),
        }
    }
}

impl From<&RoutingConfig> for RoutingStrategy {
    fn from(config: &RoutingConfig) -> Self {
        Self::from_config(config)
    }
}
