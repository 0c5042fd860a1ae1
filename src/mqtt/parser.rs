//! MQTT packet framing, parsing and encoding
//!
//! Wraps the mqttrs codec: frames are cut from the socket buffer by their
//! remaining-length header, decoded into owned packets, and replies are
//! encoded back into byte vectors ready for the session queue.

use crate::error::{GatewayError, Result};
use mqttrs::{
    decode_slice, encode_slice, Connack, ConnectReturnCode, Packet, Pid, Protocol, Publish, QoS,
    QosPid, Suback, SubscribeReturnCodes,
};

/// Parsed MQTT packet with owned fields
#[derive(Debug, Clone)]
pub enum MqttPacket {
    Connect(ParsedConnect),
    Publish(ParsedPublish),
    Pubrel(u16),
    Subscribe(ParsedSubscribe),
    Unsubscribe(ParsedUnsubscribe),
    PingReq,
    Disconnect,
    Other(MqttPacketType),
}

/// MQTT packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacketType {
    Connack,
    Puback,
    Pubrec,
    Pubcomp,
    Suback,
    Unsuback,
    Pingresp,
}

/// Parsed CONNECT packet
#[derive(Debug, Clone)]
pub struct ParsedConnect {
    /// Protocol version (3 = 3.1, 4 = 3.1.1)
    pub protocol_version: u8,
    pub client_id: String,
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    pub username: Option<String>,
}

/// Parsed PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier (for QoS > 0)
    pub packet_id: Option<u16>,
}

impl ParsedPublish {
    /// QoS 0 publish, as delivered by the broker to the gateway
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }
}

/// Parsed SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedSubscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// A single subscription in a SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: u8,
}

/// Parsed UNSUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedUnsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Length of the first complete frame in `buf`, if one has fully arrived
pub fn frame_length(buf: &[u8], max_packet_size: usize) -> Result<Option<usize>> {
    let mut remaining = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            if remaining > max_packet_size {
                return Err(GatewayError::Protocol(format!(
                    "packet of {} bytes exceeds limit {}",
                    remaining, max_packet_size
                )));
            }
            let total = 1 + (i + 1) + remaining;
            return Ok((buf.len() >= total).then_some(total));
        }
        multiplier *= 128;
    }

    if buf.len() >= 5 {
        Err(GatewayError::Protocol("malformed remaining length".to_string()))
    } else {
        Ok(None)
    }
}

/// Parse one complete MQTT frame
pub fn parse_packet(data: &[u8]) -> Result<MqttPacket> {
    let packet = decode_slice(data)
        .map_err(|e| GatewayError::Protocol(format!("failed to decode packet: {:?}", e)))?
        .ok_or_else(|| GatewayError::Protocol("incomplete packet".to_string()))?;

    let parsed = match packet {
        Packet::Connect(connect) => MqttPacket::Connect(ParsedConnect {
            protocol_version: match connect.protocol {
                Protocol::MQTT311 => 4,
                Protocol::MQIsdp => 3,
            },
            client_id: connect.client_id.to_string(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            username: connect.username.map(|s| s.to_string()),
        }),

        Packet::Publish(publish) => {
            let (qos, packet_id) = match publish.qospid {
                QosPid::AtMostOnce => (0, None),
                QosPid::AtLeastOnce(pid) => (1, Some(pid.get())),
                QosPid::ExactlyOnce(pid) => (2, Some(pid.get())),
            };

            MqttPacket::Publish(ParsedPublish {
                topic: publish.topic_name.to_string(),
                payload: publish.payload.to_vec(),
                qos,
                retain: publish.retain,
                dup: publish.dup,
                packet_id,
            })
        }

        Packet::Pubrel(pid) => MqttPacket::Pubrel(pid.get()),

        Packet::Subscribe(subscribe) => MqttPacket::Subscribe(ParsedSubscribe {
            packet_id: subscribe.pid.get(),
            subscriptions: subscribe
                .topics
                .iter()
                .map(|t| Subscription {
                    topic_filter: t.topic_path.to_string(),
                    qos: qos_to_u8(t.qos),
                })
                .collect(),
        }),

        Packet::Unsubscribe(unsub) => MqttPacket::Unsubscribe(ParsedUnsubscribe {
            packet_id: unsub.pid.get(),
            topics: unsub.topics.iter().map(|t| t.to_string()).collect(),
        }),

        Packet::Pingreq => MqttPacket::PingReq,
        Packet::Disconnect => MqttPacket::Disconnect,

        Packet::Connack(_) => MqttPacket::Other(MqttPacketType::Connack),
        Packet::Puback(_) => MqttPacket::Other(MqttPacketType::Puback),
        Packet::Pubrec(_) => MqttPacket::Other(MqttPacketType::Pubrec),
        Packet::Pubcomp(_) => MqttPacket::Other(MqttPacketType::Pubcomp),
        Packet::Suback(_) => MqttPacket::Other(MqttPacketType::Suback),
        Packet::Unsuback(_) => MqttPacket::Other(MqttPacketType::Unsuback),
        Packet::Pingresp => MqttPacket::Other(MqttPacketType::Pingresp),
    };

    Ok(parsed)
}

fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn pid(packet_id: u16) -> Result<Pid> {
    Pid::try_from(packet_id)
        .map_err(|e| GatewayError::Protocol(format!("invalid packet id {}: {:?}", packet_id, e)))
}

fn encode(packet: &Packet<'_>, capacity: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; capacity];
    let len = encode_slice(packet, &mut buf)
        .map_err(|e| GatewayError::Protocol(format!("failed to encode packet: {:?}", e)))?;
    buf.truncate(len);
    Ok(buf)
}

/// CONNACK accepting the session, or refusing its client identifier
pub fn encode_connack(accepted: bool) -> Result<Vec<u8>> {
    let code = if accepted {
        ConnectReturnCode::Accepted
    } else {
        ConnectReturnCode::RefusedIdentifierRejected
    };
    encode(
        &Packet::Connack(Connack {
            session_present: false,
            code,
        }),
        4,
    )
}

/// QoS 0 PUBLISH
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let packet = Packet::Publish(Publish {
        dup: false,
        qospid: QosPid::AtMostOnce,
        retain: false,
        topic_name: topic,
        payload,
    });
    // fixed header (<= 5) + topic length prefix + topic + payload
    encode(&packet, 5 + 2 + topic.len() + payload.len())
}

pub fn encode_puback(packet_id: u16) -> Result<Vec<u8>> {
    encode(&Packet::Puback(pid(packet_id)?), 4)
}

pub fn encode_pubrec(packet_id: u16) -> Result<Vec<u8>> {
    encode(&Packet::Pubrec(pid(packet_id)?), 4)
}

pub fn encode_pubcomp(packet_id: u16) -> Result<Vec<u8>> {
    encode(&Packet::Pubcomp(pid(packet_id)?), 4)
}

/// SUBACK; `None` marks a refused filter
pub fn encode_suback(packet_id: u16, granted: &[Option<u8>]) -> Result<Vec<u8>> {
    let return_codes = granted
        .iter()
        .map(|g| match g {
            Some(0) => SubscribeReturnCodes::Success(QoS::AtMostOnce),
            Some(1) => SubscribeReturnCodes::Success(QoS::AtLeastOnce),
            Some(_) => SubscribeReturnCodes::Success(QoS::ExactlyOnce),
            None => SubscribeReturnCodes::Failure,
        })
        .collect();
    encode(
        &Packet::Suback(Suback {
            pid: pid(packet_id)?,
            return_codes,
        }),
        5 + 2 + granted.len(),
    )
}

pub fn encode_unsuback(packet_id: u16) -> Result<Vec<u8>> {
    encode(&Packet::Unsuback(pid(packet_id)?), 4)
}

pub fn encode_pingresp() -> Result<Vec<u8>> {
    encode(&Packet::Pingresp, 2)
}
