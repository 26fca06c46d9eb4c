// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram endpoint.
//!
//! One JSON document per datagram. Bad datagrams are logged and dropped;
//! there is no reply channel.

use crate::envelope::Normalizer;
use crate::error::{GatewayError, IngestError, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bound datagram endpoint.
pub struct DatagramListener {
    socket: UdpSocket,
    max_datagram_size: usize,
    normalizer: Arc<Normalizer>,
}

impl DatagramListener {
    pub async fn bind(
        addr: SocketAddr,
        max_datagram_size: usize,
        normalizer: Arc<Normalizer>,
    ) -> Result<Self, GatewayError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| GatewayError::fatal(Transport::Datagram, e))?;
        Ok(Self {
            socket,
            max_datagram_size,
            normalizer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until `shutdown` is cancelled or the socket fails.
    ///
    /// A socket error is fatal for this listener only; it is not restarted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        if let Ok(addr) = self.local_addr() {
            info!("Starting UDP server on {}", addr);
        }

        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer_addr)) => {
                            info!("UDP message from {}", peer_addr);
                            if let Err(e) = self.handle_datagram(&buf[..len]) {
                                error!("Error on udp from {}: {}", peer_addr, e);
                            }
                        }
                        Err(e) => {
                            error!("UDP socket error: {}", e);
                            return Err(GatewayError::fatal(Transport::Datagram, e));
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("UDP server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8]) -> Result<(), IngestError> {
        self.normalizer.stats().record_received(Transport::Datagram);
        if datagram.is_empty() {
            self.normalizer.stats().record_rejected();
            return Err(IngestError::InvalidPayload("empty datagram"));
        }
        self.normalizer.ingest_bytes(datagram)
    }
}
