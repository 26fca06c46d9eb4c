// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope normalizer and ingestion statistics.
//!
//! Every transport ends up here: decoded payload + current device identity
//! become one [`MetricEnvelope`], serialized and handed to the upstream
//! publisher on the single [`BrokerTopic`].

use crate::error::{IngestError, Transport};
use crate::identity::DeviceIdentity;
use crate::upstream::UpstreamPublisher;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upstream data topic: `"<prefix>/<account>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopic(String);

impl BrokerTopic {
    pub fn new(prefix: &str, account_id: &str) -> Self {
        Self(format!("{}/{}", prefix, account_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical record forwarded upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEnvelope {
    pub device: String,
    pub observations: Value,
}

impl MetricEnvelope {
    /// Build an envelope. `None` and JSON `null` are rejected.
    pub fn new(device: impl Into<String>, observations: Option<Value>) -> Result<Self, IngestError> {
        match observations {
            None => Err(IngestError::InvalidPayload("payload is absent")),
            Some(Value::Null) => Err(IngestError::InvalidPayload("payload is null")),
            Some(observations) => Ok(Self {
                device: device.into(),
                observations,
            }),
        }
    }

    /// UTF-8 JSON body as published upstream.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Decode a raw payload as JSON. Empty input is an absent payload.
pub fn decode_payload(bytes: &[u8]) -> Result<Option<Value>, IngestError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(bytes)?))
}

/// Ingestion counters.
#[derive(Debug)]
pub struct IngestStats {
    pub rest_received: AtomicU64,
    pub udp_received: AtomicU64,
    pub mqtt_received: AtomicU64,

    /// Envelopes accepted by the upstream publisher.
    pub envelopes_forwarded: AtomicU64,
    pub bytes_forwarded: AtomicU64,

    /// Payloads dropped as absent, null or undecodable.
    pub payloads_rejected: AtomicU64,

    /// Envelopes the upstream publisher refused.
    pub publish_errors: AtomicU64,

    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,

    pub created: Instant,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            rest_received: AtomicU64::new(0),
            udp_received: AtomicU64::new(0),
            mqtt_received: AtomicU64::new(0),
            envelopes_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            payloads_rejected: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Record a payload arriving on a transport.
    pub fn record_received(&self, transport: Transport) {
        let counter = match transport {
            Transport::Rest => &self.rest_received,
            Transport::Datagram => &self.udp_received,
            Transport::Broker => &self.mqtt_received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.payloads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_forwarded(&self, bytes: u64) {
        self.envelopes_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            rest_received: self.rest_received.load(Ordering::Relaxed),
            udp_received: self.udp_received.load(Ordering::Relaxed),
            mqtt_received: self.mqtt_received.load(Ordering::Relaxed),
            envelopes_forwarded: self.envelopes_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            payloads_rejected: self.payloads_rejected.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of ingestion statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub rest_received: u64,
    pub udp_received: u64,
    pub mqtt_received: u64,
    pub envelopes_forwarded: u64,
    pub bytes_forwarded: u64,
    pub payloads_rejected: u64,
    pub publish_errors: u64,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub uptime_secs: u64,
}

impl IngestStatsSnapshot {
    pub fn received(&self) -> u64 {
        self.rest_received + self.udp_received + self.mqtt_received
    }

    /// Calculate envelopes per second.
    pub fn envelopes_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.envelopes_forwarded as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

/// Wraps decoded payloads into envelopes and publishes them.
///
/// Shared by every listener and connection.
pub struct Normalizer {
    identity: Arc<DeviceIdentity>,
    topic: BrokerTopic,
    upstream: Arc<dyn UpstreamPublisher>,
    stats: Arc<IngestStats>,
}

impl Normalizer {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        topic: BrokerTopic,
        upstream: Arc<dyn UpstreamPublisher>,
    ) -> Self {
        Self {
            identity,
            topic,
            upstream,
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn topic(&self) -> &BrokerTopic {
        &self.topic
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Wrap `data` with the current identity and publish it.
    ///
    /// Fails only for an absent or null payload. Publish failures are logged
    /// and counted, never returned.
    pub fn make_metrics(&self, data: Option<Value>) -> Result<(), IngestError> {
        let envelope = match MetricEnvelope::new(self.identity.current().as_str(), data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.record_rejected();
                return Err(e);
            }
        };

        info!(device = %envelope.device, observations = %envelope.observations, "Message");

        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_publish_error();
                warn!(error = %e, "Failed to serialize envelope");
                return Ok(());
            }
        };
        let len = payload.len() as u64;

        match self.upstream.publish(self.topic.as_str(), payload) {
            Ok(()) => {
                self.stats.record_forwarded(len);
                debug!(topic = %self.topic, bytes = len, "Envelope forwarded");
            }
            Err(e) => {
                self.stats.record_publish_error();
                warn!(topic = %self.topic, error = %e, "Upstream publish failed");
            }
        }
        Ok(())
    }

    /// Decode `bytes` as JSON and forward it. Decode failures count as rejected.
    pub fn ingest_bytes(&self, bytes: &[u8]) -> Result<(), IngestError> {
        let data = decode_payload(bytes).inspect_err(|_| self.stats.record_rejected())?;
        self.make_metrics(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{MemoryUpstream, UpstreamError};
    use serde_json::json;

    fn normalizer(identity: &str) -> (Normalizer, Arc<MemoryUpstream>) {
        let upstream = Arc::new(MemoryUpstream::new());
        let normalizer = Normalizer::new(
            Arc::new(DeviceIdentity::new(identity)),
            BrokerTopic::new("data2", "acct"),
            upstream.clone(),
        );
        (normalizer, upstream)
    }

    struct FailingUpstream;

    impl UpstreamPublisher for FailingUpstream {
        fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), UpstreamError> {
            Err(UpstreamError::Closed)
        }
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope =
            MetricEnvelope::new("d-host1", Some(json!({"temp": 21.5}))).unwrap();
        let bytes = envelope.to_json().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"device":"d-host1","observations":{"temp":21.5}}"#
        );
    }

    #[test]
    fn test_envelope_rejects_null_and_absent() {
        assert!(matches!(
            MetricEnvelope::new("d", None),
            Err(IngestError::InvalidPayload(_))
        ));
        assert!(matches!(
            MetricEnvelope::new("d", Some(Value::Null)),
            Err(IngestError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_envelope_accepts_falsy_values() {
        for value in [json!(false), json!(0), json!(""), json!({}), json!([])] {
            assert!(MetricEnvelope::new("d", Some(value)).is_ok());
        }
    }

    #[test]
    fn test_decode_payload() {
        assert!(decode_payload(b"").unwrap().is_none());
        assert_eq!(decode_payload(b"[1,2]").unwrap(), Some(json!([1, 2])));
        assert!(matches!(
            decode_payload(b"not json"),
            Err(IngestError::Decode(_))
        ));
        assert!(matches!(
            decode_payload(&[0xff, 0xfe]),
            Err(IngestError::Decode(_))
        ));
    }

    #[test]
    fn test_make_metrics_publishes_on_topic() {
        let (normalizer, upstream) = normalizer("d-host1");
        normalizer.make_metrics(Some(json!({"temp": 21.5}))).unwrap();

        let published = upstream.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "data2/acct");
        assert_eq!(
            published[0].json(),
            json!({"device": "d-host1", "observations": {"temp": 21.5}})
        );

        let stats = normalizer.stats().snapshot();
        assert_eq!(stats.envelopes_forwarded, 1);
        assert_eq!(stats.bytes_forwarded, published[0].payload.len() as u64);
    }

    #[test]
    fn test_make_metrics_uses_current_identity() {
        let (normalizer, upstream) = normalizer("d-fallback");
        normalizer.make_metrics(Some(json!(1))).unwrap();
        normalizer.identity().replace("aa:bb:cc:dd:ee:ff");
        normalizer.make_metrics(Some(json!(2))).unwrap();

        let published = upstream.published();
        assert_eq!(published[0].json()["device"], "d-fallback");
        assert_eq!(published[1].json()["device"], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_make_metrics_invalid_payload() {
        let (normalizer, upstream) = normalizer("d");
        assert!(normalizer.make_metrics(None).is_err());
        assert!(normalizer.make_metrics(Some(Value::Null)).is_err());
        assert!(upstream.published().is_empty());
        assert_eq!(normalizer.stats().snapshot().payloads_rejected, 2);
    }

    #[test]
    fn test_publish_failure_is_swallowed() {
        let normalizer = Normalizer::new(
            Arc::new(DeviceIdentity::new("d")),
            BrokerTopic::new("data2", "acct"),
            Arc::new(FailingUpstream),
        );
        assert!(normalizer.make_metrics(Some(json!({"a": 1}))).is_ok());

        let stats = normalizer.stats().snapshot();
        assert_eq!(stats.publish_errors, 1);
        assert_eq!(stats.envelopes_forwarded, 0);
    }

    #[test]
    fn test_ingest_bytes_decode_error() {
        let (normalizer, upstream) = normalizer("d");
        assert!(matches!(
            normalizer.ingest_bytes(b"{bad"),
            Err(IngestError::Decode(_))
        ));
        assert!(normalizer.ingest_bytes(br#"{"ok":true}"#).is_ok());
        assert_eq!(upstream.published().len(), 1);
        assert_eq!(normalizer.stats().snapshot().payloads_rejected, 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = IngestStats::new();
        stats.record_received(Transport::Rest);
        stats.record_received(Transport::Datagram);
        stats.record_received(Transport::Broker);
        stats.record_received(Transport::Broker);
        stats.record_connection_opened();
        stats.record_connection_opened();
        stats.record_connection_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received(), 4);
        assert_eq!(snapshot.mqtt_received, 2);
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_active, 1);
    }
}
