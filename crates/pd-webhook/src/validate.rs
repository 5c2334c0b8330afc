//! Webhook target validation. The daemon runs on developer machines inside
//! private networks, so outbound hooks must never be pointable at loopback,
//! RFC1918 space, link-local, carrier-grade NAT, or cloud metadata
//! endpoints.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use url::Url;

use crate::WebhookError;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse and validate a subscription URL: http/https only, and neither the
/// literal host nor anything it resolves to may fall in the blocked ranges.
pub async fn validate_webhook_url(raw: &str) -> Result<Url, WebhookError> {
    let url = Url::parse(raw).map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidUrl(format!(
            "scheme {} not allowed, use http or https",
            url.scheme()
        )));
    }
    let Some(host) = url.host_str() else {
        return Err(WebhookError::InvalidUrl("missing host".into()));
    };

    if host_is_blocked(host) {
        return Err(WebhookError::BlockedUrl(host.to_string()));
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if ip_is_blocked(ip) {
            return Err(WebhookError::BlockedUrl(host.to_string()));
        }
        return Ok(url);
    }

    // Resolve the hostname and vet every address. An unresolvable host is
    // let through; delivery will just fail.
    let port = url.port_or_known_default().unwrap_or(80);
    let lookup = tokio::net::lookup_host((host, port));
    if let Ok(Ok(addrs)) = tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        for addr in addrs {
            if ip_is_blocked(addr.ip()) {
                return Err(WebhookError::BlockedUrl(format!(
                    "{host} resolves to {}",
                    addr.ip()
                )));
            }
        }
    }
    Ok(url)
}

/// Hostname-level blocks: loopback names and internal-only suffixes.
fn host_is_blocked(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

/// Address-level blocks, covering the private/link-local/metadata set.
pub fn ip_is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4_is_blocked(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return v4_is_blocked(mapped);
            }
            v6_is_blocked(v6)
        }
    }
}

fn v4_is_blocked(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()                                      // 127.0.0.0/8
        || ip.is_unspecified()                            // 0.0.0.0
        || ip.is_private()                                // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local()                             // 169.254/16 (cloud metadata)
        || ip.is_broadcast()
        || ip.is_multicast()
        || (octets[0] == 100 && (64..128).contains(&octets[1])) // 100.64.0.0/10
}

fn v6_is_blocked(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()                                  // ::1
        || ip.is_unspecified()                        // ::
        || (segments[0] & 0xfe00) == 0xfc00           // fc00::/7 unique-local
        || (segments[0] & 0xffc0) == 0xfe80           // fe80::/10 link-local
        || (segments[0] & 0xff00) == 0xff00           // ff00::/8 multicast
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_v4(s: &str) -> bool {
        ip_is_blocked(IpAddr::V4(s.parse().unwrap()))
    }

    fn blocked_v6(s: &str) -> bool {
        ip_is_blocked(IpAddr::V6(s.parse().unwrap()))
    }

    #[test]
    fn blocks_every_listed_v4_range() {
        for ip in [
            "127.0.0.1",
            "127.255.255.254",
            "10.0.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254", // cloud metadata
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.0",
        ] {
            assert!(blocked_v4(ip), "{ip} should be blocked");
        }
    }

    #[test]
    fn allows_public_v4() {
        for ip in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1"] {
            assert!(!blocked_v4(ip), "{ip} should be allowed");
        }
    }

    #[test]
    fn blocks_every_listed_v6_range() {
        for ip in ["::1", "fc00::1", "fdff::1", "fe80::1", "ff02::1", "::", "::ffff:10.0.0.1"] {
            assert!(blocked_v6(ip), "{ip} should be blocked");
        }
    }

    #[test]
    fn allows_public_v6() {
        assert!(!blocked_v6("2606:4700:4700::1111"));
    }

    #[tokio::test]
    async fn rejects_bad_schemes_and_internal_hosts() {
        assert!(matches!(
            validate_webhook_url("ftp://example.com/hook").await,
            Err(WebhookError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("http://10.0.0.5/hook").await,
            Err(WebhookError::BlockedUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("http://localhost/hook").await,
            Err(WebhookError::BlockedUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("http://metadata.internal/x").await,
            Err(WebhookError::BlockedUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("https://printer.local/x").await,
            Err(WebhookError::BlockedUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("http://[::1]:8080/x").await,
            Err(WebhookError::BlockedUrl(_))
        ));
        assert!(matches!(
            validate_webhook_url("not a url").await,
            Err(WebhookError::InvalidUrl(_))
        ));
    }
}
