// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded broker listener.
//!
//! Accepts MQTT clients and runs one [`Session`] per connection on its own
//! task. The listener keeps no per-connection state.

use crate::envelope::Normalizer;
use crate::error::{GatewayError, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod protocol;
pub mod session;

pub use connection::ClientConnection;
pub use protocol::{Packet, ProtocolError};
pub use session::{ConnectionState, Session};

/// Embedded broker endpoint.
pub struct BrokerListener {
    listener: TcpListener,
    max_packet_size: usize,
    normalizer: Arc<Normalizer>,
}

impl BrokerListener {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        max_packet_size: usize,
        normalizer: Arc<Normalizer>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::fatal(Transport::Broker, e))?;

        Ok(Self {
            listener,
            max_packet_size,
            normalizer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        if let Ok(addr) = self.local_addr() {
            info!("MQTT broker listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New broker connection from {}", peer_addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("set_nodelay failed for {}: {}", peer_addr, e);
                            }

                            let conn = ClientConnection::new(stream, self.max_packet_size);
                            let normalizer = self.normalizer.clone();
                            let shutdown = shutdown.child_token();
                            tokio::spawn(serve_connection(conn, peer_addr, normalizer, shutdown));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("MQTT broker shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Drive one client connection until it closes.
///
/// Packets are handled strictly in arrival order, so publishes from one
/// connection reach the upstream publisher in the order they were sent.
pub async fn serve_connection<S>(
    mut conn: ClientConnection<S>,
    peer_addr: SocketAddr,
    normalizer: Arc<Normalizer>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stats = normalizer.stats().clone();
    stats.record_connection_opened();
    let mut session = Session::new(normalizer);

    while !session.is_closed() {
        let result = tokio::select! {
            result = conn.read_packet() => result,
            _ = shutdown.cancelled() => {
                debug!("Connection handler shutting down: {}", peer_addr);
                break;
            }
        };

        match result {
            Ok(Some(packet)) => match session.on_packet(packet) {
                Ok(Some(reply)) => {
                    if let Err(e) = conn.write_packet(&reply).await {
                        session.on_error(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if let Some(reply) = session.on_error(e) {
                        if let Err(e) = conn.write_packet(&reply).await {
                            debug!("Failed to send final {} to {}: {}", reply.name(), peer_addr, e);
                        }
                    }
                }
            },
            Ok(None) => session.on_stream_closed(),
            Err(e) => {
                session.on_error(e);
            }
        }
    }

    if let Err(e) = conn.shutdown().await {
        debug!("Shutdown error for {}: {}", peer_addr, e);
    }
    stats.record_connection_closed();

    match session.client_id() {
        Some(client_id) => info!("Connection closed: {} ({})", peer_addr, client_id),
        None => warn!("Connection closed before CONNECT: {}", peer_addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::{Connect, Publish};
    use crate::envelope::BrokerTopic;
    use crate::identity::DeviceIdentity;
    use crate::upstream::MemoryUpstream;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    fn normalizer() -> (Arc<Normalizer>, Arc<MemoryUpstream>) {
        let upstream = Arc::new(MemoryUpstream::new());
        let normalizer = Arc::new(Normalizer::new(
            Arc::new(DeviceIdentity::new("d-host1")),
            BrokerTopic::new("data2", "acct"),
            upstream.clone(),
        ));
        (normalizer, upstream)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_serve_connection_full_exchange() {
        let (normalizer, upstream) = normalizer();
        let (client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            ClientConnection::new(server, 1024),
            peer(),
            normalizer.clone(),
            CancellationToken::new(),
        ));

        let mut client = ClientConnection::new(client, 1024);
        client
            .write_packet(&Packet::Connect(Connect::new("dev-1")))
            .await
            .unwrap();
        assert!(matches!(
            client.read_packet().await.unwrap(),
            Some(Packet::ConnAck { return_code: 0, .. })
        ));

        client
            .write_packet(&Packet::Publish(Publish::new("x", br#"{"n":1}"#.to_vec())))
            .await
            .unwrap();
        client.write_packet(&Packet::PingReq).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap(), Some(Packet::PingResp));

        client.write_packet(&Packet::Disconnect).await.unwrap();
        task.await.unwrap();

        assert_eq!(upstream.published().len(), 1);
        let stats = normalizer.stats().snapshot();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.connections_active, 0);
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let (normalizer, upstream) = normalizer();
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            ClientConnection::new(server, 1024),
            peer(),
            normalizer,
            CancellationToken::new(),
        ));

        // Packet type 0 is reserved.
        client.write_all(&[0x00, 0x00]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(upstream.published().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_connection() {
        let (normalizer, _) = normalizer();
        let (_client, server) = duplex(4096);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_connection(
            ClientConnection::new(server, 1024),
            peer(),
            normalizer,
            shutdown.clone(),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_bind_and_stop() {
        let (normalizer, _) = normalizer();
        let listener = BrokerListener::bind("127.0.0.1:0".parse().unwrap(), 1024, normalizer)
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.run(shutdown.clone()));
        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let (normalizer, _) = normalizer();
        let first = BrokerListener::bind("127.0.0.1:0".parse().unwrap(), 1024, normalizer.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let second = BrokerListener::bind(addr, 1024, normalizer).await;
        assert!(matches!(
            second,
            Err(GatewayError::TransportFatal {
                transport: Transport::Broker,
                ..
            })
        ));
    }
}
