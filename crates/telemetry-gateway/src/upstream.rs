// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream publisher seam.
//!
//! The gateway only needs `publish(topic, payload)`. Delivery is best-effort:
//! `publish` hands the message off without waiting for the remote broker.

use crate::config::UpstreamConfig;
use parking_lot::Mutex;
use rumqttc::tokio_rustls::rustls::pki_types::CertificateDer;
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upstream errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("failed to read TLS material {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS material {path}: {reason}")]
    InvalidTls { path: String, reason: String },

    #[error("upstream session closed")]
    Closed,
}

/// Capability to deliver one serialized envelope to the remote broker.
///
/// Implementations must not block: the call happens inline on listener
/// tasks.
pub trait UpstreamPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), UpstreamError>;
}

// ---------------------------------------------------------------------------
// MQTT session
// ---------------------------------------------------------------------------

/// Persistent MQTT session to the upstream broker.
pub struct MqttUpstream {
    client: AsyncClient,
}

impl MqttUpstream {
    /// Build the session and spawn the task driving its event loop.
    ///
    /// The returned task runs until `shutdown` is cancelled; connection
    /// errors are retried after `reconnect_delay_secs`.
    pub fn connect(
        config: &UpstreamConfig,
        client_id: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), UpstreamError> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        options.set_credentials(config.username.clone(), config.password.clone());

        if config.tls {
            let tls = client_tls_config(config)?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(tls),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, config.queue_capacity);

        info!(
            host = %config.host,
            port = config.port,
            tls = config.tls_enabled(),
            client_id,
            "Connecting to upstream broker"
        );

        let task = tokio::spawn(drive_event_loop(
            eventloop,
            config.reconnect_delay(),
            shutdown,
        ));

        Ok((Self { client }, task))
    }
}

impl UpstreamPublisher for MqttUpstream {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), UpstreamError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

/// Client TLS settings: the configured CA bundle, or the platform trust store
/// when none is set, plus the client certificate when one is configured.
fn client_tls_config(config: &UpstreamConfig) -> Result<ClientConfig, UpstreamError> {
    let mut roots = RootCertStore::empty();
    match &config.ca_path {
        Some(ca_path) => {
            for cert in read_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| invalid_tls(ca_path, e.to_string()))?;
            }
            if roots.is_empty() {
                return Err(invalid_tls(ca_path, "no certificate found".into()));
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| invalid_tls(Path::new("<system trust store>"), e.to_string()))?;
            let (added, ignored) = roots.add_parsable_certificates(native);
            debug!(added, ignored, "Loaded system trust roots");
            if roots.is_empty() {
                warn!("System trust store is empty; upstream certificate checks will fail");
            }
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = rustls_pemfile::private_key(&mut read_pem(key_path)?.as_slice())
                .map_err(|e| invalid_tls(key_path, e.to_string()))?
                .ok_or_else(|| invalid_tls(key_path, "no private key found".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| invalid_tls(cert_path, e.to_string()))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, UpstreamError> {
    rustls_pemfile::certs(&mut read_pem(path)?.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid_tls(path, e.to_string()))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, UpstreamError> {
    std::fs::read(path).map_err(|source| UpstreamError::Tls {
        path: path.display().to_string(),
        source,
    })
}

fn invalid_tls(path: &Path, reason: String) -> UpstreamError {
    UpstreamError::InvalidTls {
        path: path.display().to_string(),
        reason,
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Upstream event loop shutting down");
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(rumqttc::Packet::ConnAck(ack))) => {
                        info!(code = ?ack.code, "Connected to upstream broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_secs = reconnect_delay.as_secs(),
                            "Upstream connection error"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dry-run publisher
// ---------------------------------------------------------------------------

/// Logs envelopes instead of sending them.
pub struct LogUpstream;

impl UpstreamPublisher for LogUpstream {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), UpstreamError> {
        info!(
            topic,
            payload = %String::from_utf8_lossy(&payload),
            "Dry run publish"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory publisher (for testing)
// ---------------------------------------------------------------------------

/// One publish captured by [`MemoryUpstream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Payload parsed as JSON (`Null` if it is not valid JSON).
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Records every publish in arrival order. Useful for testing without a broker.
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    published: Mutex<Vec<PublishedMessage>>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.lock().is_empty()
    }

    /// Wait until at least `count` messages were published or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl UpstreamPublisher for MemoryUpstream {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), UpstreamError> {
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
