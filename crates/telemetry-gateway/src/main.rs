// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry gateway CLI
//!
//! # Usage
//!
//! ```bash
//! # Everything from the environment (SERVER_*_PORT, BROKER_*, *_LOG_*)
//! telemetry-gateway
//!
//! # Configuration file, with a command-line override
//! telemetry-gateway --config gateway.toml --mqtt-port 11883
//!
//! # Write an example configuration
//! telemetry-gateway gen-config -o gateway.toml
//! ```

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry_gateway::{
    identity, telemetry, DeviceIdentity, Gateway, GatewayConfig, IngestStatsSnapshot, LogUpstream,
    MqttUpstream, Normalizer, UpstreamPublisher,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Telemetry ingestion gateway
#[derive(Parser, Debug)]
#[command(name = "telemetry-gateway")]
#[command(about = "Telemetry gateway - HTTP, UDP and MQTT fan-in to one upstream broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for all listeners
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// HTTP listener port
    #[arg(long, env = "SERVER_REST_PORT")]
    rest_port: Option<u16>,

    /// UDP listener port
    #[arg(long, env = "SERVER_UDP_PORT")]
    udp_port: Option<u16>,

    /// MQTT listener port
    #[arg(long, env = "SERVER_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Fixed device id (skips hardware address lookup)
    #[arg(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    /// Upstream broker host
    #[arg(long, env = "BROKER_HOST")]
    broker_host: Option<String>,

    /// Upstream broker port
    #[arg(long, env = "BROKER_PORT")]
    broker_port: Option<u16>,

    /// Upstream user name (also the account id unless set in the config file)
    #[arg(long, env = "BROKER_HOST_USR")]
    broker_user: Option<String>,

    /// Upstream password
    #[arg(long, env = "BROKER_HOST_PSW", hide_env_values = true)]
    broker_password: Option<String>,

    /// CA bundle for the upstream TLS session
    #[arg(long, env = "BROKER_HOST_CA")]
    broker_ca: Option<PathBuf>,

    /// Client certificate for the upstream TLS session
    #[arg(long, env = "BROKER_HOST_CERT")]
    broker_cert: Option<PathBuf>,

    /// Client private key for the upstream TLS session
    #[arg(long, env = "BROKER_HOST_KEY")]
    broker_key: Option<PathBuf>,

    /// Connect to the upstream broker without TLS
    #[arg(long)]
    broker_plaintext: bool,

    /// Console log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONSOLE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log file path
    #[arg(long, env = "AGENT_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log file level
    #[arg(long, env = "FILE_LOG_LEVEL")]
    file_log_level: Option<String>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Log envelopes instead of publishing them upstream
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(cmd) = &args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    telemetry::init(&config.logging)?;

    info!("Telemetry gateway v{}", env!("CARGO_PKG_VERSION"));

    let device_identity = Arc::new(match &config.device_id {
        Some(id) => DeviceIdentity::new(id.clone()),
        None => DeviceIdentity::from_hostname(),
    });
    info!("Device id: {}", device_identity.current());
    if config.device_id.is_none() {
        tokio::spawn(identity::resolve(device_identity.clone()));
    }

    let shutdown = CancellationToken::new();
    let topic = config.broker_topic();
    info!("Upstream topic: {}", topic);

    let (upstream, upstream_task) = if config.dry_run {
        warn!("Dry run: envelopes are logged, not published");
        let upstream: Arc<dyn UpstreamPublisher> = Arc::new(LogUpstream);
        (upstream, None)
    } else {
        let client_id = config
            .upstream
            .client_id
            .clone()
            .unwrap_or_else(|| device_identity.current().to_string());
        let (mqtt, task) = MqttUpstream::connect(&config.upstream, &client_id, shutdown.clone())?;
        let upstream: Arc<dyn UpstreamPublisher> = Arc::new(mqtt);
        (upstream, Some(task))
    };

    let normalizer = Arc::new(Normalizer::new(device_identity, topic, upstream));
    let gateway = Gateway::bind(&config, normalizer.clone()).await?;

    // Stats reporting task
    if let Some(interval) = config.stats_interval() {
        let stats = normalizer.stats().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => print_stats(&stats.snapshot()),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    let mut listeners = tokio::spawn(gateway.run(shutdown.clone()));

    let listeners_done = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
            false
        }
        _ = &mut listeners => {
            warn!("All listeners stopped");
            true
        }
    };
    shutdown.cancel();

    if !listeners_done {
        if let Err(e) = listeners.await {
            error!("Listener task failed: {}", e);
        }
    }
    if let Some(task) = upstream_task {
        if let Err(e) = task.await {
            error!("Upstream task failed: {}", e);
        }
    }

    info!("Final statistics:");
    print_stats(&normalizer.stats().snapshot());

    Ok(())
}

fn build_config(args: &Args) -> Result<GatewayConfig, telemetry_gateway::ConfigError> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.rest_port {
        config.rest.port = port;
    }
    if let Some(port) = args.udp_port {
        config.udp.port = port;
    }
    if let Some(port) = args.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(ref id) = args.device_id {
        config.device_id = Some(id.clone());
    }

    let upstream = &mut config.upstream;
    if let Some(ref host) = args.broker_host {
        upstream.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        upstream.port = port;
    }
    if let Some(ref user) = args.broker_user {
        upstream.username = user.clone();
    }
    if let Some(ref password) = args.broker_password {
        upstream.password = password.clone();
    }
    if let Some(ref path) = args.broker_ca {
        upstream.ca_path = Some(path.clone());
    }
    if let Some(ref path) = args.broker_cert {
        upstream.cert_path = Some(path.clone());
    }
    if let Some(ref path) = args.broker_key {
        upstream.key_path = Some(path.clone());
    }
    if args.broker_plaintext {
        upstream.tls = false;
    }

    let logging = &mut config.logging;
    if let Some(ref level) = args.log_level {
        logging.console_level = level.clone();
    }
    if let Some(ref path) = args.log_file {
        logging.file = Some(path.clone());
    }
    if let Some(ref level) = args.file_log_level {
        logging.file_level = level.clone();
    }

    if let Some(secs) = args.stats_interval {
        config.stats_interval_secs = secs;
    }
    if args.dry_run {
        config.dry_run = true;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GatewayConfig::default();
    config.upstream.ca_path = Some("certs/ca.crt".into());
    config.upstream.cert_path = Some("certs/client.crt".into());
    config.upstream.key_path = Some("certs/client.key".into());
    config.logging.file = Some("agent.log".into());

    let toml_str = config.to_toml()?;

    let content = format!(
        r#"# Telemetry Gateway Configuration
# Generated by telemetry-gateway gen-config

{}
"#,
        toml_str
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            for (name, enabled, port) in [
                ("REST", config.rest.enabled, config.rest.port),
                ("UDP", config.udp.enabled, config.udp.port),
                ("MQTT", config.mqtt.enabled, config.mqtt.port),
            ] {
                if enabled {
                    println!("  {:<5} {}:{}", name, config.bind_address, port);
                } else {
                    println!("  {:<5} disabled", name);
                }
            }
            println!(
                "Upstream: {}:{} (tls: {})",
                config.upstream.host,
                config.upstream.port,
                config.upstream.tls_enabled()
            );
            println!("Topic: {}", config.broker_topic());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &IngestStatsSnapshot) {
    info!(
        "Received rest={} udp={} mqtt={} | forwarded {} ({:.1} msg/s, {}) | rejected {} | publish errors {} | mqtt clients {} active / {} total",
        stats.rest_received,
        stats.udp_received,
        stats.mqtt_received,
        stats.envelopes_forwarded,
        stats.envelopes_per_second(),
        format_bytes(stats.bytes_forwarded),
        stats.payloads_rejected,
        stats.publish_errors,
        stats.connections_active,
        stats.connections_accepted,
    );
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
