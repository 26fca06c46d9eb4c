// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device identity.
//!
//! Every envelope is tagged with one process-wide identifier. A default is
//! synthesized from the host name at startup so the gateway is usable right
//! away; a single background attempt then replaces it with the first hardware
//! address of the host. Envelopes built before that attempt completes carry
//! the default.

use arc_swap::ArcSwap;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Single-writer, many-reader identity cell.
///
/// Readers get either the previous value or the replacement, never a mix.
#[derive(Debug)]
pub struct DeviceIdentity {
    current: ArcSwap<String>,
}

impl DeviceIdentity {
    /// Create the cell with its initial value.
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial.into()),
        }
    }

    /// Create the cell with the host-name-derived default.
    pub fn from_hostname() -> Self {
        Self::new(default_device_id())
    }

    /// Snapshot of the current identity.
    pub fn current(&self) -> Arc<String> {
        self.current.load_full()
    }

    /// Replace the identity as a whole.
    pub fn replace(&self, id: impl Into<String>) {
        self.current.store(Arc::new(id.into()));
    }
}

/// `"d-" + lowercase(hostname)`, or `"d-unknown"` when the host name is unavailable.
pub fn default_device_id() -> String {
    let host = get_hostname().unwrap_or_else(|| "unknown".to_string());
    format!("d-{}", host.to_lowercase())
}

/// Make one attempt at replacing the default with the hardware address.
///
/// Runs the probe on the blocking pool. No retries: on failure the default
/// stays for the process lifetime.
pub async fn resolve(identity: Arc<DeviceIdentity>) {
    match tokio::task::spawn_blocking(get_first_mac).await {
        Ok(Some(mac)) => {
            info!(device_id = %mac, "Device id resolved from hardware address");
            identity.replace(mac);
        }
        Ok(None) => {
            warn!(
                device_id = %identity.current(),
                "Unable to get MAC address, keeping default device id"
            );
        }
        Err(e) => {
            warn!(error = %e, "MAC address probe failed, keeping default device id");
        }
    }
}

/// Get system hostname (Unix).
#[cfg(unix)]
fn get_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY:
    // - buf is a valid mutable buffer with known size (256 bytes)
    // - gethostname writes at most buf.len() bytes
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }

    // Truncated names may lack the terminator.
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let hostname = String::from_utf8_lossy(&buf[..end]).into_owned();

    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}

/// Get system hostname (Windows).
#[cfg(windows)]
fn get_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|h| !h.is_empty())
}

/// First non-loopback, non-zero MAC address.
#[cfg(target_os = "linux")]
fn get_first_mac() -> Option<String> {
    first_mac_in(Path::new("/sys/class/net"))
}

/// MAC lookup via /sys/class/net is Linux-specific.
#[cfg(not(target_os = "linux"))]
fn get_first_mac() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn first_mac_in(net_dir: &Path) -> Option<String> {
    let mut entries: Vec<_> = fs::read_dir(net_dir).ok()?.flatten().collect();
    // read_dir order is unspecified; sort for a stable pick across restarts.
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name() == "lo" {
            continue;
        }
        if let Ok(mac) = fs::read_to_string(entry.path().join("address")) {
            let mac = mac.trim();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac.to_lowercase());
            }
        }
    }

    None
}
