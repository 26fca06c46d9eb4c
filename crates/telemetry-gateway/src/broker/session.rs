// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection broker state machine.
//!
//! ```text
//! AwaitingConnect --CONNECT--> Connected --DISCONNECT--> Closed
//!        |                         |
//!        +------ protocol error ---+-----------------> Closed
//! ```
//!
//! The session performs no I/O. The connection driver feeds it decoded
//! packets and writes back whatever reply it returns; once the session is
//! `Closed` the driver drops the stream.

use super::protocol::{
    Packet, ProtocolError, QoS, CONNACK_ACCEPTED, CONNACK_UNACCEPTABLE_PROTOCOL, SUBACK_FAILURE,
};
use crate::envelope::Normalizer;
use crate::error::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ids handed to clients that connect with an empty client identifier.
static NEXT_ASSIGNED_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of one broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingConnect,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingConnect => "awaiting connect",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

/// State machine for one broker client.
pub struct Session {
    state: ConnectionState,
    client_id: Option<String>,
    normalizer: Arc<Normalizer>,
}

impl Session {
    pub fn new(normalizer: Arc<Normalizer>) -> Self {
        Self {
            state: ConnectionState::AwaitingConnect,
            client_id: None,
            normalizer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Identifier declared by the client on CONNECT.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Handle one decoded packet.
    ///
    /// Returns the reply to send, if any. An error means the connection must
    /// be torn down; pass it to [`Session::on_error`].
    pub fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>, ProtocolError> {
        match self.state {
            ConnectionState::Closed => {
                debug!(packet = packet.name(), "Ignoring packet on closed session");
                Ok(None)
            }
            ConnectionState::AwaitingConnect => match packet {
                Packet::Connect(connect) => {
                    let client_id = if connect.client_id.is_empty() {
                        format!("auto-{}", NEXT_ASSIGNED_ID.fetch_add(1, Ordering::Relaxed))
                    } else {
                        connect.client_id
                    };
                    info!(
                        client_id = %client_id,
                        keep_alive = connect.keep_alive,
                        "Client connected"
                    );
                    self.client_id = Some(client_id);
                    self.state = ConnectionState::Connected;
                    Ok(Some(Packet::ConnAck {
                        session_present: false,
                        return_code: CONNACK_ACCEPTED,
                    }))
                }
                other => Err(self.unexpected(&other)),
            },
            ConnectionState::Connected => self.on_connected(packet),
        }
    }

    fn on_connected(&mut self, packet: Packet) -> Result<Option<Packet>, ProtocolError> {
        match packet {
            Packet::Publish(publish) => {
                self.normalizer.stats().record_received(Transport::Broker);
                // Topic is accepted but not used: everything goes to the one upstream topic.
                if let Err(e) = self.normalizer.ingest_bytes(&publish.payload) {
                    warn!(
                        client_id = self.client_id.as_deref().unwrap_or_default(),
                        topic = %publish.topic,
                        error = %e,
                        "Dropping publish"
                    );
                }
                Ok(match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => Some(Packet::PubAck { packet_id }),
                    (QoS::ExactlyOnce, Some(packet_id)) => Some(Packet::PubRec { packet_id }),
                    _ => None,
                })
            }
            Packet::PubRel { packet_id } => Ok(Some(Packet::PubComp { packet_id })),
            Packet::PingReq => Ok(Some(Packet::PingResp)),
            Packet::Subscribe { packet_id, filters } => {
                debug!(filters = filters.len(), "Refusing subscription");
                Ok(Some(Packet::SubAck {
                    packet_id,
                    return_codes: vec![SUBACK_FAILURE; filters.len()],
                }))
            }
            Packet::Unsubscribe { packet_id, .. } => Ok(Some(Packet::UnsubAck { packet_id })),
            Packet::Disconnect => {
                info!(
                    client_id = self.client_id.as_deref().unwrap_or_default(),
                    "Client disconnected"
                );
                self.state = ConnectionState::Closed;
                Ok(None)
            }
            // Acks for publishes this broker never sends.
            Packet::PubAck { .. } | Packet::PubRec { .. } | Packet::PubComp { .. } => {
                debug!(packet = packet.name(), "Ignoring stray acknowledgement");
                Ok(None)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    /// Stream or protocol fault: log, close, and return a last packet to send
    /// before dropping the stream, if the protocol calls for one.
    pub fn on_error(&mut self, error: ProtocolError) -> Option<Packet> {
        let was = self.state;
        self.state = ConnectionState::Closed;
        warn!(
            client_id = self.client_id.as_deref().unwrap_or_default(),
            state = was.as_str(),
            error = %error,
            "Closing broker connection"
        );

        match (was, error) {
            (ConnectionState::AwaitingConnect, ProtocolError::UnsupportedProtocol { .. }) => {
                Some(Packet::ConnAck {
                    session_present: false,
                    return_code: CONNACK_UNACCEPTABLE_PROTOCOL,
                })
            }
            _ => None,
        }
    }

    /// The peer closed the stream without DISCONNECT.
    pub fn on_stream_closed(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(
                client_id = self.client_id.as_deref().unwrap_or_default(),
                "Connection closed by peer"
            );
            self.state = ConnectionState::Closed;
        }
    }

    fn unexpected(&self, packet: &Packet) -> ProtocolError {
        ProtocolError::UnexpectedPacket {
            packet: packet.name(),
            state: self.state.as_str(),
        }
    }
}
