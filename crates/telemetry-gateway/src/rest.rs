// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request endpoint.
//!
//! `PUT /` with a JSON or `application/x-www-form-urlencoded` body. Form
//! fields become a JSON object of strings. 200 with an empty body on
//! success; on any failure 400 (or 404 with `legacy_not_found_status`),
//! also with an empty body.

use crate::config::RestConfig;
use crate::envelope::Normalizer;
use crate::error::{GatewayError, Transport};
use axum::body::Bytes;
use axum::extract::{FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::{routing::put, Form, Router};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared handler state.
#[derive(Clone)]
pub struct RestState {
    normalizer: Arc<Normalizer>,
    failure_status: StatusCode,
}

/// Build the router.
pub fn router(normalizer: Arc<Normalizer>, legacy_not_found_status: bool) -> Router {
    let failure_status = if legacy_not_found_status {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };

    Router::new()
        .route("/", put(put_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(RestState {
            normalizer,
            failure_status,
        })
}

/// PUT /
async fn put_metrics(State(state): State<RestState>, request: Request) -> StatusCode {
    let normalizer = &state.normalizer;
    normalizer.stats().record_received(Transport::Rest);

    let result = if is_form(&request) {
        match Form::<Map<String, Value>>::from_request(request, &()).await {
            Ok(Form(fields)) => {
                info!(payload = ?fields, "REST form payload");
                normalizer.make_metrics(Some(Value::Object(fields)))
            }
            Err(rejection) => {
                normalizer.stats().record_rejected();
                error!("Error on rest: {}", rejection);
                return state.failure_status;
            }
        }
    } else {
        match Bytes::from_request(request, &()).await {
            Ok(body) => {
                info!(payload = %String::from_utf8_lossy(&body), "REST payload");
                normalizer.ingest_bytes(&body)
            }
            Err(rejection) => {
                normalizer.stats().record_rejected();
                error!("Error on rest: {}", rejection);
                return state.failure_status;
            }
        }
    };

    match result {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("Error on rest: {}", e);
            state.failure_status
        }
    }
}

fn is_form(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Bound request endpoint.
pub struct RestListener {
    listener: TcpListener,
    router: Router,
}

impl RestListener {
    pub async fn bind(
        addr: SocketAddr,
        config: &RestConfig,
        normalizer: Arc<Normalizer>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::fatal(Transport::Rest, e))?;
        Ok(Self {
            listener,
            router: router(normalizer, config.legacy_not_found_status),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled. In-flight requests are drained.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        if let Ok(addr) = self.local_addr() {
            info!("REST server listening on http://{}", addr);
        }

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::fatal(Transport::Rest, e))
    }
}
