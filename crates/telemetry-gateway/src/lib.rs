// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry ingestion gateway
//!
//! Accepts device metric reports over three transports, wraps each one in a
//! `{"device": ..., "observations": ...}` envelope and relays it to a single
//! upstream MQTT broker topic.
//!
//! # Features
//!
//! - **HTTP**: `PUT /` with a JSON body
//! - **UDP**: one JSON document per datagram
//! - **MQTT**: embedded 3.1.1 broker; every publish is forwarded, whatever its topic
//! - **Upstream**: one persistent (optionally mutual-TLS) MQTT session, best-effort QoS 0
//!
//! # Quick Start
//!
//! ```bash
//! # Defaults: HTTP 8080, UDP 41234, MQTT 1883, upstream localhost:8884
//! telemetry-gateway
//!
//! # Log envelopes instead of publishing them
//! telemetry-gateway --dry-run
//!
//! # Using config file
//! telemetry-gateway --config gateway.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [rest]
//! port = 8080
//!
//! [upstream]
//! host = "broker.example.com"
//! port = 8884
//! username = "acct-1"
//! password = "secret"
//! ca_path = "certs/ca.crt"
//! cert_path = "certs/client.crt"
//! key_path = "certs/client.key"
//! ```

pub mod broker;
pub mod config;
pub mod datagram;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod rest;
pub mod telemetry;
pub mod upstream;

pub use config::{ConfigError, GatewayConfig};
pub use envelope::{BrokerTopic, IngestStats, IngestStatsSnapshot, MetricEnvelope, Normalizer};
pub use error::{GatewayError, IngestError, Transport};
pub use gateway::Gateway;
pub use identity::DeviceIdentity;
pub use upstream::{LogUpstream, MemoryUpstream, MqttUpstream, UpstreamError, UpstreamPublisher};
