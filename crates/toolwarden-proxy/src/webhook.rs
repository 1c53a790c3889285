//! Fire-and-forget alert webhook delivery.
//!
//! Alert payloads carry tool/host/agent identifiers and must not leave the
//! machine, so only loopback destinations are accepted. Delivery runs in a
//! detached task and never sits on the request hot path.

use std::net::IpAddr;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use toolwarden_core::alerts::AlertNotification;

/// Check that a webhook URL resolves to the local machine.
///
/// Accepted hosts are `localhost`, any address in `127.0.0.0/8`, and the
/// bracketed IPv6 loopback `[::1]`. Everything else -- remote names, LAN
/// addresses, non-HTTP schemes -- is rejected at startup rather than
/// silently leaking alerts later.
pub fn ensure_loopback_url(url: &str) -> Result<()> {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        bail!("webhook URL must use http:// or https://, got '{url}'");
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host_of(authority);
    if !is_loopback(host) {
        bail!("webhook host '{host}' is not loopback; only local delivery is allowed");
    }
    Ok(())
}

/// Strip the port from an authority, honoring `[...]` IPv6 brackets.
fn host_of(authority: &str) -> &str {
    match authority.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or(bracketed),
        None => authority.rsplit_once(':').map_or(authority, |(host, _port)| host),
    }
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Post an alert notification without blocking the caller. Delivery is
/// advisory: failures are logged and dropped, never retried.
pub fn dispatch(client: &reqwest::Client, url: &str, notification: AlertNotification) {
    let client = client.clone();
    let url = url.to_string();
    tokio::spawn(async move {
        match client.post(&url).json(&notification).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, severity = %notification.severity, "alert webhook delivered");
            }
            Ok(resp) => {
                warn!(url = %url, status = %resp.status(), "alert webhook endpoint rejected the payload");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "alert webhook POST failed");
            }
        }
    });
}
