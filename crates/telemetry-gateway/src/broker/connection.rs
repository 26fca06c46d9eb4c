// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet framing over a broker client stream.

use super::protocol::{decode_remaining_length, Packet, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// A connected broker client's byte stream.
pub struct ClientConnection<S = TcpStream> {
    stream: BufStream<S>,
    max_packet_size: usize,
    read_buffer: Vec<u8>,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream. `max_packet_size` bounds a whole packet, fixed header included.
    pub fn new(stream: S, max_packet_size: usize) -> Self {
        Self {
            stream: BufStream::new(stream),
            max_packet_size,
            read_buffer: Vec::with_capacity(1024),
        }
    }

    /// Read one packet.
    ///
    /// Returns `Ok(None)` if the peer closed the stream between packets.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let header = match self.stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Remaining length, one byte at a time (at most 4).
        let mut len_buf = [0u8; 4];
        let mut used = 0;
        let remaining = loop {
            if used == len_buf.len() {
                return Err(ProtocolError::MalformedRemainingLength);
            }
            len_buf[used] = self.read_byte().await?;
            used += 1;
            if let Some((len, _)) = decode_remaining_length(&len_buf[..used])? {
                break len;
            }
        };

        let size = 1 + used + remaining;
        if size > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        self.read_buffer.clear();
        self.read_buffer.resize(remaining, 0);
        self.stream
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(eof_mid_packet)?;

        Packet::decode(header, &self.read_buffer).map(Some)
    }

    /// Write one packet and flush it.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ProtocolError> {
        self.stream.write_all(&packet.encode()?).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shutdown the connection.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        self.stream.read_u8().await.map_err(eof_mid_packet)
    }
}

fn eof_mid_packet(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(e)
    }
}
