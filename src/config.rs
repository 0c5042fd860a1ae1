//! Configuration types for the MQTT protocol gateway
//!
//! Provides JSON-serializable configuration for the listener, the routing
//! strategy (topic pairs or rooms) and general runtime switches.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};

/// MQTT Protocol Gateway Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GatewayConfig {
    /// Listen port for the embedded broker
    pub port: u16,

    /// Listen address for the embedded broker
    pub bind_address: String,

    /// Let clients publish/subscribe between themselves on non-reserved topics
    pub allow_pub_sub: bool,

    /// Request/response routing
    pub routing: RoutingConfig,

    /// General settings
    pub general: GeneralConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            bind_address: "0.0.0.0".to_string(),
            allow_pub_sub: false,
            routing: RoutingConfig::default(),
            general: GeneralConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Check that every required option is present and usable.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(GatewayError::Configuration("port is required".to_string()));
        }

        let (request, response) = self.routing.reserved_names();
        let (request_key, response_key) = match self.routing {
            RoutingConfig::Topics { .. } => ("request-topic", "response-topic"),
            RoutingConfig::Rooms { .. } => ("room", "response-room"),
        };

        for (key, name) in [(request_key, request), (response_key, response)] {
            if name.is_empty() {
                return Err(GatewayError::Configuration(format!("{} is required", key)));
            }
            if name.contains('#') || name.contains('+') {
                return Err(GatewayError::Configuration(format!(
                    "{} must not contain wildcards: {}",
                    key, name
                )));
            }
        }

        if request == response {
            return Err(GatewayError::Configuration(format!(
                "{} and {} must differ",
                request_key, response_key
            )));
        }

        if self.general.client_buffer == 0 {
            return Err(GatewayError::Configuration(
                "client-buffer must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string the embedded broker binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

// ============================================================================
// Routing Configuration
// ============================================================================

/// Which names carry requests and responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum RoutingConfig {
    /// A request topic and a response topic; backend pushes use broker topics
    #[serde(rename_all = "kebab-case")]
    Topics {
        request_topic: String,
        response_topic: String,
        #[serde(default)]
        correlation: ResponseCorrelation,
    },

    /// A shared room; backend pushes fan out over the channel membership table
    #[serde(rename_all = "kebab-case")]
    Rooms {
        room: String,
        response_room: String,
        #[serde(default)]
        correlation: ResponseCorrelation,
    },
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self::Topics {
            request_topic: default_request_topic(),
            response_topic: default_response_topic(),
            correlation: ResponseCorrelation::default(),
        }
    }
}

impl RoutingConfig {
    /// (request name, response name)
    pub fn reserved_names(&self) -> (&str, &str) {
        match self {
            Self::Topics {
                request_topic,
                response_topic,
                ..
            } => (request_topic, response_topic),
            Self::Rooms {
                room,
                response_room,
                ..
            } => (room, response_room),
        }
    }

    pub fn correlation(&self) -> ResponseCorrelation {
        match self {
            Self::Topics { correlation, .. } | Self::Rooms { correlation, .. } => *correlation,
        }
    }
}

/// How a response finds its way back to the requester
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseCorrelation {
    /// Every response goes out on the configured response topic
    #[default]
    Fixed,
    /// Responses go out on `<response-topic>/<requestId>`
    PerRequest,
}

// ============================================================================
// General Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneralConfig {
    /// Log all inbound publishes (verbose)
    pub log_packets: bool,

    /// Largest MQTT frame accepted by the embedded broker (bytes)
    pub max_packet_size: usize,

    /// Outbound queue depth per client session
    pub client_buffer: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_packets: false,
            max_packet_size: default_max_packet_size(),
            client_buffer: default_client_buffer(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_request_topic() -> String {
    "gateway/request".to_string()
}

fn default_response_topic() -> String {
    "gateway/response".to_string()
}

fn default_max_packet_size() -> usize {
    268_435_455 // MQTT 3.1.1 maximum remaining length
}

fn default_client_buffer() -> usize {
    1024
}
