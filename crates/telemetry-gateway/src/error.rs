// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy.
//!
//! `IngestError` is always recovered where it happens (error status, dropped
//! datagram, connection left open). `ProtocolError` ends one broker
//! connection. `GatewayError::TransportFatal` ends one listener.

use crate::config::ConfigError;
use crate::upstream::UpstreamError;
use std::fmt;
use thiserror::Error;

/// Inbound transport a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// `PUT /` request endpoint.
    Rest,
    /// Connectionless datagram endpoint.
    Datagram,
    /// Embedded MQTT broker endpoint.
    Broker,
}

impl Transport {
    /// Short lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Datagram => "udp",
            Self::Broker => "mqtt",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message failures. Never terminate a listener or a connection.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Top-level gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{transport} listener failed: {source}")]
    TransportFatal {
        transport: Transport,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    pub(crate) fn fatal(transport: Transport, source: std::io::Error) -> Self {
        Self::TransportFatal { transport, source }
    }
}
