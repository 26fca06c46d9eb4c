// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability

//! End-to-end ingestion over real sockets.
//!
//! Every test binds a full gateway on ephemeral localhost ports, drives one or
//! more transports and checks what reached the in-memory upstream.

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry_gateway::broker::protocol::{Connect, Packet, Publish, QoS};
use telemetry_gateway::broker::ClientConnection;
use telemetry_gateway::{
    DeviceIdentity, Gateway, GatewayConfig, MemoryUpstream, Normalizer,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    rest: SocketAddr,
    udp: SocketAddr,
    mqtt: SocketAddr,
    identity: Arc<DeviceIdentity>,
    normalizer: Arc<Normalizer>,
    upstream: Arc<MemoryUpstream>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(GatewayConfig::default()).await
    }

    async fn start_with(mut config: GatewayConfig) -> Self {
        config.bind_address = [127, 0, 0, 1].into();
        config.rest.port = 0;
        config.udp.port = 0;
        config.mqtt.port = 0;
        config.upstream.account_id = Some("acct-42".into());

        let identity = Arc::new(DeviceIdentity::new("d-host1"));
        let upstream = Arc::new(MemoryUpstream::new());
        let normalizer = Arc::new(Normalizer::new(
            identity.clone(),
            config.broker_topic(),
            upstream.clone(),
        ));

        let gateway = Gateway::bind(&config, normalizer.clone()).await.unwrap();
        let rest = gateway.rest_addr().unwrap();
        let udp = gateway.udp_addr().unwrap();
        let mqtt = gateway.mqtt_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gateway.run(shutdown.clone()));

        Self {
            rest,
            udp,
            mqtt,
            identity,
            normalizer,
            upstream,
            shutdown,
            task,
        }
    }

    async fn put(&self, body: &'static str) -> reqwest::StatusCode {
        reqwest::Client::new()
            .put(format!("http://{}/", self.rest))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn mqtt_client(&self, client_id: &str) -> ClientConnection<TcpStream> {
        let stream = TcpStream::connect(self.mqtt).await.unwrap();
        let mut conn = ClientConnection::new(stream, 64 * 1024);
        conn.write_packet(&Packet::Connect(Connect::new(client_id)))
            .await
            .unwrap();
        let ack = tokio::time::timeout(WAIT, conn.read_packet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ack,
            Some(Packet::ConnAck {
                session_present: false,
                return_code: 0
            })
        );
        conn
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

async fn read(conn: &mut ClientConnection<TcpStream>) -> Option<Packet> {
    tokio::time::timeout(WAIT, conn.read_packet())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_rest_concrete_scenario() {
    let h = Harness::start().await;

    assert_eq!(h.put(r#"{"temp":21.5}"#).await, reqwest::StatusCode::OK);

    let published = h.upstream.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "data2/acct-42");
    assert_eq!(
        String::from_utf8(published[0].payload.clone()).unwrap(),
        r#"{"device":"d-host1","observations":{"temp":21.5}}"#
    );

    h.stop().await;
}

#[tokio::test]
async fn test_rest_null_payload_rejected() {
    let h = Harness::start().await;
    assert_eq!(h.put("null").await, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(h.put("").await, reqwest::StatusCode::BAD_REQUEST);
    assert!(h.upstream.is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_rest_legacy_status() {
    let mut config = GatewayConfig::default();
    config.rest.legacy_not_found_status = true;
    let h = Harness::start_with(config).await;
    assert_eq!(h.put("null").await, reqwest::StatusCode::NOT_FOUND);
    h.stop().await;
}

#[tokio::test]
async fn test_udp_forwarding_and_null() {
    let h = Harness::start().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(b"null", h.udp).await.unwrap();
    client.send_to(b"", h.udp).await.unwrap();
    client.send_to(br#"[1,2,3]"#, h.udp).await.unwrap();

    assert!(h.upstream.wait_for(1, WAIT).await);
    let published = h.upstream.published();
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].json(),
        json!({"device": "d-host1", "observations": [1, 2, 3]})
    );

    // Listener survived the bad datagrams.
    client.send_to(br#"{"n":2}"#, h.udp).await.unwrap();
    assert!(h.upstream.wait_for(2, WAIT).await);

    h.stop().await;
}

#[tokio::test]
async fn test_mqtt_publishes_in_order() {
    let h = Harness::start().await;
    let mut conn = h.mqtt_client("sensor-1").await;

    for seq in 0..20 {
        let payload = format!(r#"{{"seq":{}}}"#, seq);
        conn.write_packet(&Packet::Publish(Publish::new("any/topic", payload)))
            .await
            .unwrap();
    }

    assert!(h.upstream.wait_for(20, WAIT).await);
    let seqs: Vec<_> = h
        .upstream
        .published()
        .iter()
        .map(|m| m.json()["observations"]["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());

    conn.write_packet(&Packet::Disconnect).await.unwrap();
    assert_eq!(read(&mut conn).await, None);

    h.stop().await;
}

#[tokio::test]
async fn test_mqtt_bad_publish_keeps_connection() {
    let h = Harness::start().await;
    let mut conn = h.mqtt_client("sensor-2").await;

    conn.write_packet(&Packet::Publish(Publish::new("t", "{not json")))
        .await
        .unwrap();
    conn.write_packet(&Packet::PingReq).await.unwrap();
    assert_eq!(read(&mut conn).await, Some(Packet::PingResp));

    let good = Publish::new("t", r#"{"ok":1}"#).with_qos(QoS::AtLeastOnce, 9);
    conn.write_packet(&Packet::Publish(good)).await.unwrap();
    assert_eq!(read(&mut conn).await, Some(Packet::PubAck { packet_id: 9 }));

    assert_eq!(h.upstream.len(), 1);
    assert_eq!(h.upstream.published()[0].json()["observations"]["ok"], 1);

    h.stop().await;
}

#[tokio::test]
async fn test_mqtt_ping_exactly_one_response() {
    let h = Harness::start().await;
    let mut conn = h.mqtt_client("pinger").await;

    conn.write_packet(&Packet::PingReq).await.unwrap();
    conn.write_packet(&Packet::PingReq).await.unwrap();
    assert_eq!(read(&mut conn).await, Some(Packet::PingResp));
    assert_eq!(read(&mut conn).await, Some(Packet::PingResp));

    // No extra response queued: the next reply is for the next request.
    let qos1 = Publish::new("t", "1").with_qos(QoS::AtLeastOnce, 1);
    conn.write_packet(&Packet::Publish(qos1)).await.unwrap();
    assert_eq!(read(&mut conn).await, Some(Packet::PubAck { packet_id: 1 }));

    h.stop().await;
}

#[tokio::test]
async fn test_mqtt_packets_after_disconnect_ignored() {
    let h = Harness::start().await;
    let stream = TcpStream::connect(h.mqtt).await.unwrap();
    let mut raw = stream;

    // CONNECT, DISCONNECT and a PUBLISH in a single write.
    let mut bytes = Packet::Connect(Connect::new("burst")).encode().unwrap();
    bytes.extend(Packet::Disconnect.encode().unwrap());
    bytes.extend(Packet::Publish(Publish::new("t", r#"{"late":true}"#)).encode().unwrap());
    raw.write_all(&bytes).await.unwrap();

    let mut conn = ClientConnection::new(raw, 1024);
    assert!(matches!(
        read(&mut conn).await,
        Some(Packet::ConnAck { return_code: 0, .. })
    ));
    assert_eq!(read(&mut conn).await, None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.upstream.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_mqtt_publish_before_connect_closes() {
    let h = Harness::start().await;
    let stream = TcpStream::connect(h.mqtt).await.unwrap();
    let mut conn = ClientConnection::new(stream, 1024);

    conn.write_packet(&Packet::Publish(Publish::new("t", "{}")))
        .await
        .unwrap();
    assert_eq!(read(&mut conn).await, None);
    assert!(h.upstream.is_empty());

    // The listener still accepts new clients.
    let _ok = h.mqtt_client("after").await;

    h.stop().await;
}

#[tokio::test]
async fn test_identity_replacement_visible_to_new_envelopes() {
    let h = Harness::start().await;

    assert_eq!(h.put(r#"{"a":1}"#).await, reqwest::StatusCode::OK);
    h.identity.replace("aa:bb:cc:dd:ee:ff");
    assert_eq!(h.put(r#"{"a":2}"#).await, reqwest::StatusCode::OK);

    let published = h.upstream.published();
    assert_eq!(published[0].json()["device"], "d-host1");
    assert_eq!(published[1].json()["device"], "aa:bb:cc:dd:ee:ff");

    h.stop().await;
}

#[tokio::test]
async fn test_all_transports_share_one_topic() {
    let h = Harness::start().await;

    assert_eq!(h.put(r#"{"via":"rest"}"#).await, reqwest::StatusCode::OK);

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(br#"{"via":"udp"}"#, h.udp).await.unwrap();

    let mut conn = h.mqtt_client("mixed").await;
    conn.write_packet(&Packet::Publish(Publish::new("x/y", r#"{"via":"mqtt"}"#)))
        .await
        .unwrap();

    assert!(h.upstream.wait_for(3, WAIT).await);
    let published = h.upstream.published();
    assert!(published.iter().all(|m| m.topic == "data2/acct-42"));

    let mut via: Vec<String> = published
        .iter()
        .map(|m| m.json()["observations"]["via"].as_str().unwrap().to_string())
        .collect();
    via.sort();
    assert_eq!(via, ["mqtt", "rest", "udp"]);

    let stats = h.normalizer.stats().snapshot();
    assert_eq!(stats.received(), 3);
    assert_eq!(stats.envelopes_forwarded, 3);

    h.stop().await;
}
