// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded broker wire protocol (MQTT 3.1.1).
//!
//! Only the subset a telemetry sink needs is modelled: connection setup,
//! publishes at any QoS with their acknowledgements, subscription requests
//! (always refused), keepalive and disconnect. Client-side packets are
//! encodable too so tests can speak the protocol.
//!
//! Wire format:
//! ```text
//! +-----------+-----------+------------------------+-------------------+
//! | type (4b) | flags (4b)| remaining length (1-4B)| variable + payload|
//! +-----------+-----------+------------------------+-------------------+
//! ```

use thiserror::Error;

/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// CONNACK return code: connection accepted.
pub const CONNACK_ACCEPTED: u8 = 0x00;
/// CONNACK return code: unacceptable protocol version.
pub const CONNACK_UNACCEPTABLE_PROTOCOL: u8 = 0x01;
/// SUBACK return code: subscription refused.
pub const SUBACK_FAILURE: u8 = 0x80;

mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PUBREC: u8 = 5;
    pub const PUBREL: u8 = 6;
    pub const PUBCOMP: u8 = 7;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

use packet_type::*;

/// Protocol errors. Each one ends the affected connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed mid-packet")]
    UnexpectedEof,

    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("invalid flags {flags:#06b} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{field} is {len} bytes, longer than a u16 length prefix allows")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("{packet} has {extra} trailing bytes")]
    TrailingBytes { packet: &'static str, extra: usize },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unsupported protocol {name:?} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },

    #[error("invalid QoS {0}")]
    InvalidQos(u8),

    #[error("reserved CONNECT flag set")]
    ReservedFlag,

    #[error("SUBSCRIBE/UNSUBSCRIBE without topic filters")]
    EmptyFilterList,

    #[error("{packet} not allowed while {state}")]
    UnexpectedPacket {
        packet: &'static str,
        state: &'static str,
    },
}

/// Delivery guarantee requested on a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

/// Last-will message declared on CONNECT. Parsed, never delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// 4 for "MQTT" (3.1.1), 3 for "MQIsdp" (3.1).
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// MQTT 3.1.1 connect with a clean session and a 60 s keepalive.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Publish {
    /// QoS 0 publish.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = (qos != QoS::AtMostOnce).then_some(packet_id);
        self
    }
}

/// One control packet, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish(Publish),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Packet kind name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::ConnAck { .. } => "CONNACK",
            Self::Publish(_) => "PUBLISH",
            Self::PubAck { .. } => "PUBACK",
            Self::PubRec { .. } => "PUBREC",
            Self::PubRel { .. } => "PUBREL",
            Self::PubComp { .. } => "PUBCOMP",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubAck { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubAck { .. } => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Decode one packet from its first header byte and its body (the
    /// `remaining length` bytes that follow the fixed header).
    pub fn decode(header: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let flags = header & 0x0F;
        let mut r = Reader::new(body);

        let packet = match header >> 4 {
            CONNECT => {
                expect_flags("CONNECT", flags, 0)?;
                Self::Connect(decode_connect(&mut r)?)
            }
            CONNACK => {
                expect_flags("CONNACK", flags, 0)?;
                let ack_flags = r.u8("CONNACK")?;
                let return_code = r.u8("CONNACK")?;
                Self::ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    return_code,
                }
            }
            PUBLISH => Self::Publish(decode_publish(flags, &mut r)?),
            PUBACK => {
                expect_flags("PUBACK", flags, 0)?;
                Self::PubAck {
                    packet_id: r.u16("PUBACK")?,
                }
            }
            PUBREC => {
                expect_flags("PUBREC", flags, 0)?;
                Self::PubRec {
                    packet_id: r.u16("PUBREC")?,
                }
            }
            PUBREL => {
                expect_flags("PUBREL", flags, 0b0010)?;
                Self::PubRel {
                    packet_id: r.u16("PUBREL")?,
                }
            }
            PUBCOMP => {
                expect_flags("PUBCOMP", flags, 0)?;
                Self::PubComp {
                    packet_id: r.u16("PUBCOMP")?,
                }
            }
            SUBSCRIBE => {
                expect_flags("SUBSCRIBE", flags, 0b0010)?;
                let packet_id = r.u16("SUBSCRIBE")?;
                let mut filters = Vec::new();
                while !r.is_empty() {
                    let filter = r.string("SUBSCRIBE topic filter")?;
                    let qos = QoS::from_u8(r.u8("SUBSCRIBE requested QoS")?)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(ProtocolError::EmptyFilterList);
                }
                Self::Subscribe { packet_id, filters }
            }
            SUBACK => {
                expect_flags("SUBACK", flags, 0)?;
                let packet_id = r.u16("SUBACK")?;
                Self::SubAck {
                    packet_id,
                    return_codes: r.rest().to_vec(),
                }
            }
            UNSUBSCRIBE => {
                expect_flags("UNSUBSCRIBE", flags, 0b0010)?;
                let packet_id = r.u16("UNSUBSCRIBE")?;
                let mut filters = Vec::new();
                while !r.is_empty() {
                    filters.push(r.string("UNSUBSCRIBE topic filter")?);
                }
                if filters.is_empty() {
                    return Err(ProtocolError::EmptyFilterList);
                }
                Self::Unsubscribe { packet_id, filters }
            }
            UNSUBACK => {
                expect_flags("UNSUBACK", flags, 0)?;
                Self::UnsubAck {
                    packet_id: r.u16("UNSUBACK")?,
                }
            }
            PINGREQ => {
                expect_flags("PINGREQ", flags, 0)?;
                Self::PingReq
            }
            PINGRESP => {
                expect_flags("PINGRESP", flags, 0)?;
                Self::PingResp
            }
            DISCONNECT => {
                expect_flags("DISCONNECT", flags, 0)?;
                Self::Disconnect
            }
            other => return Err(ProtocolError::InvalidPacketType(other)),
        };

        r.finish(packet.name())?;
        Ok(packet)
    }

    /// Encode the packet, fixed header included.
    ///
    /// Fails if a length-prefixed field or the whole body exceeds what the
    /// wire format can carry.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();

        let header = match self {
            Self::Connect(connect) => {
                encode_connect(connect, &mut body)?;
                CONNECT << 4
            }
            Self::ConnAck {
                session_present,
                return_code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*return_code);
                CONNACK << 4
            }
            Self::Publish(publish) => {
                put_string(&mut body, "PUBLISH topic", &publish.topic)?;
                if let Some(packet_id) = publish.packet_id {
                    body.extend_from_slice(&packet_id.to_be_bytes());
                }
                body.extend_from_slice(&publish.payload);
                (PUBLISH << 4)
                    | (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Self::PubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                PUBACK << 4
            }
            Self::PubRec { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                PUBREC << 4
            }
            Self::PubRel { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                (PUBREL << 4) | 0b0010
            }
            Self::PubComp { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                PUBCOMP << 4
            }
            Self::Subscribe { packet_id, filters } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (filter, qos) in filters {
                    put_string(&mut body, "SUBSCRIBE filter", filter)?;
                    body.push(*qos as u8);
                }
                (SUBSCRIBE << 4) | 0b0010
            }
            Self::SubAck {
                packet_id,
                return_codes,
            } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                body.extend_from_slice(return_codes);
                SUBACK << 4
            }
            Self::Unsubscribe { packet_id, filters } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for filter in filters {
                    put_string(&mut body, "UNSUBSCRIBE filter", filter)?;
                }
                (UNSUBSCRIBE << 4) | 0b0010
            }
            Self::UnsubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                UNSUBACK << 4
            }
            Self::PingReq => PINGREQ << 4,
            Self::PingResp => PINGRESP << 4,
            Self::Disconnect => DISCONNECT << 4,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::PacketTooLarge {
                size: body.len(),
                max: MAX_REMAINING_LENGTH,
            });
        }

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(header);
        encode_remaining_length(body.len(), &mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Decode the remaining-length varint at the start of `buf`.
///
/// Returns `(value, bytes consumed)`, or `Ok(None)` if `buf` ends before the
/// varint does.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(ProtocolError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

/// Append the remaining-length varint for `len` (at most 4 bytes).
pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    debug_assert!(len <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn expect_flags(packet: &'static str, flags: u8, expected: u8) -> Result<(), ProtocolError> {
    if flags == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFlags { packet, flags })
    }
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Connect, ProtocolError> {
    let name = r.string("CONNECT protocol name")?;
    let level = r.u8("CONNECT protocol level")?;
    match (name.as_str(), level) {
        ("MQTT", 4) | ("MQIsdp", 3) => {}
        _ => return Err(ProtocolError::UnsupportedProtocol { name, level }),
    }

    let flags = r.u8("CONNECT flags")?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::ReservedFlag);
    }
    let keep_alive = r.u16("CONNECT keep alive")?;
    let client_id = r.string("CONNECT client id")?;

    let will = if flags & 0x04 != 0 {
        let qos = QoS::from_u8((flags >> 3) & 0x03)?;
        let topic = r.string("CONNECT will topic")?;
        let message = r.binary("CONNECT will message")?.to_vec();
        Some(LastWill {
            topic,
            message,
            qos,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if flags & 0x80 != 0 {
        Some(r.string("CONNECT username")?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(r.binary("CONNECT password")?.to_vec())
    } else {
        None
    };

    Ok(Connect {
        protocol_level: level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn encode_connect(connect: &Connect, body: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let name = if connect.protocol_level == 3 { "MQIsdp" } else { "MQTT" };
    put_string(body, "protocol name", name)?;
    body.push(connect.protocol_level);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    put_string(body, "client id", &connect.client_id)?;
    if let Some(will) = &connect.will {
        put_string(body, "will topic", &will.topic)?;
        put_binary(body, "will message", &will.message)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, "user name", username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, "password", password)?;
    }
    Ok(())
}

fn decode_publish(flags: u8, r: &mut Reader<'_>) -> Result<Publish, ProtocolError> {
    let qos = QoS::from_u8((flags >> 1) & 0x03)?;
    let topic = r.string("PUBLISH topic")?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(r.u16("PUBLISH packet id")?),
    };
    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: r.rest().to_vec(),
    })
}

fn put_string(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    put_binary(out, field, value.as_bytes())
}

fn put_binary(out: &mut Vec<u8>, field: &'static str, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated(what));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn binary(&mut self, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        std::str::from_utf8(self.binary(what)?)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn finish(&self, packet: &'static str) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes {
                packet,
                extra: self.buf.len(),
            })
        }
    }
}
