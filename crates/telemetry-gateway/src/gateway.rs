// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener wiring.
//!
//! The three transports share one [`Normalizer`] and nothing else. Each is
//! bound and run on its own; a failure in one is logged and leaves the
//! others running.

use crate::broker::BrokerListener;
use crate::config::{ConfigError, GatewayConfig};
use crate::datagram::DatagramListener;
use crate::envelope::Normalizer;
use crate::error::{GatewayError, Transport};
use crate::rest::RestListener;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound listeners, ready to run.
pub struct Gateway {
    rest: Option<RestListener>,
    udp: Option<DatagramListener>,
    mqtt: Option<BrokerListener>,
}

impl Gateway {
    /// Bind every enabled listener.
    ///
    /// A listener that fails to bind is logged and left out. Fails only if no
    /// listener could be bound.
    pub async fn bind(
        config: &GatewayConfig,
        normalizer: Arc<Normalizer>,
    ) -> Result<Self, GatewayError> {
        let mut last_error = None;

        let rest = if config.rest.enabled {
            match RestListener::bind(config.rest_addr(), &config.rest, normalizer.clone()).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("{}", e);
                    last_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        let udp = if config.udp.enabled {
            match DatagramListener::bind(
                config.udp_addr(),
                config.udp.max_datagram_size,
                normalizer.clone(),
            )
            .await
            {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("{}", e);
                    last_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        let mqtt = if config.mqtt.enabled {
            match BrokerListener::bind(config.mqtt_addr(), config.mqtt.max_packet_size, normalizer)
                .await
            {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!("{}", e);
                    last_error = Some(e);
                    None
                }
            }
        } else {
            None
        };

        if rest.is_none() && udp.is_none() && mqtt.is_none() {
            return Err(last_error.unwrap_or_else(|| {
                GatewayError::Config(ConfigError::Invalid("All listeners are disabled".into()))
            }));
        }

        Ok(Self { rest, udp, mqtt })
    }

    pub fn rest_addr(&self) -> Option<SocketAddr> {
        self.rest.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn mqtt_addr(&self) -> Option<SocketAddr> {
        self.mqtt.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run every bound listener until `shutdown` is cancelled.
    ///
    /// Returns once all listeners have stopped, whether by shutdown or by
    /// their own fatal error.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut listeners = JoinSet::new();
        self.spawn_into(&mut listeners, &shutdown);
        supervise(listeners).await;
    }

    fn spawn_into(self, listeners: &mut JoinSet<ListenerExit>, shutdown: &CancellationToken) {
        if let Some(rest) = self.rest {
            let shutdown = shutdown.clone();
            listeners.spawn(async move { (Transport::Rest, rest.run(shutdown).await) });
        }
        if let Some(udp) = self.udp {
            let shutdown = shutdown.clone();
            listeners.spawn(async move { (Transport::Datagram, udp.run(shutdown).await) });
        }
        if let Some(mqtt) = self.mqtt {
            let shutdown = shutdown.clone();
            listeners.spawn(async move { (Transport::Broker, mqtt.run(shutdown).await) });
        }
    }
}

type ListenerExit = (Transport, Result<(), GatewayError>);

/// Wait for every listener, logging each exit. One listener ending never
/// stops the others.
async fn supervise(mut listeners: JoinSet<ListenerExit>) {
    while let Some(joined) = listeners.join_next().await {
        match joined {
            Ok((transport, Ok(()))) => info!("{} listener stopped", transport),
            Ok((transport, Err(e))) => {
                error!("{} listener terminated: {}", transport, e);
                if !listeners.is_empty() {
                    warn!("{} listener(s) still running", listeners.len());
                }
            }
            Err(e) => error!("Listener task panicked: {}", e),
        }
    }
}
