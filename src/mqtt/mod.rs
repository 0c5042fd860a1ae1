//! MQTT protocol handling module
//!
//! Packet framing and codec for the embedded broker, plus topic filter matching.

mod parser;
mod topic;

pub use parser::{
    encode_connack, encode_pingresp, encode_puback, encode_pubcomp, encode_publish,
    encode_pubrec, encode_suback, encode_unsuback, frame_length, parse_packet, MqttPacket,
    MqttPacketType, ParsedConnect, ParsedPublish, ParsedSubscribe, ParsedUnsubscribe,
    Subscription,
};
pub use topic::TopicMatcher;
