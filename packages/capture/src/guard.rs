//! SSRF guard for capture targets.
//!
//! Capture URLs come from end users, and the browser runs inside the
//! deployment's network. Before navigation every URL is checked against a
//! hostname blocklist and the private/link-local/loopback address ranges, with
//! DNS resolved at validation time. A post-validation redirect to a private
//! address is accepted as out of scope; the engine does not interpose on the
//! browser's own networking.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::Url;

/// Hostnames rejected regardless of what they resolve to.
const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "metadata.google.internal",
    "169.254.169.254",
];

/// Why a URL was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid url: {0}")]
    Invalid(String),

    #[error("scheme '{0}' is not allowed, only http and https")]
    Scheme(String),

    #[error("blocked host: {0}")]
    BlockedHost(String),

    #[error("host resolves to private address {0}")]
    PrivateAddress(IpAddr),

    #[error("host {0} did not resolve")]
    Unresolvable(String),
}

/// Validate a capture target.
///
/// Rules are applied in order: parse, scheme, hostname blocklist, resolved
/// address ranges. Hostnames are resolved here, once; literal IPs resolve to
/// themselves.
pub async fn validate_url(raw: &str) -> Result<(), Rejection> {
    let parsed = Url::parse(raw).map_err(|e| Rejection::Invalid(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(Rejection::Scheme(other.to_string())),
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Rejection::Invalid("missing host".into()))?;
    // Url keeps brackets around IPv6 literals; strip them for comparison.
    let host = host.trim_start_matches('[').trim_end_matches(']');

    for blocked in BLOCKED_HOSTS {
        if host.eq_ignore_ascii_case(blocked) {
            return Err(Rejection::BlockedHost(host.to_string()));
        }
    }

    for ip in resolve(host).await? {
        if is_private(ip) {
            return Err(Rejection::PrivateAddress(ip));
        }
    }

    Ok(())
}

async fn resolve(host: &str) -> Result<Vec<IpAddr>, Rejection> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    // Port is irrelevant, lookup_host just needs a socket-addr shaped input.
    let addrs = tokio::net::lookup_host((host, 80))
        .await
        .map_err(|_| Rejection::Unresolvable(host.to_string()))?
        .map(|addr| addr.ip())
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(Rejection::Unresolvable(host.to_string()));
    }
    Ok(addrs)
}

/// Membership in 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16, fc00::/7,
/// fe80::/10, and ::1/128.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            // An IPv4-mapped address is judged by its embedded IPv4 range.
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(mapped);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 unique-local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    false
}
