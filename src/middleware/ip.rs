//! Client identity for per-client limits.
//!
//! The key is the TCP peer address taken from axum's `ConnectInfo`. Forwarding
//! headers (`X-Forwarded-For`, then `X-Real-IP`) replace it only when the
//! peer is inside `TRUSTED_PROXIES`, so a client talking to the gateway
//! directly cannot pick its own rate-limit bucket.
//!
//! Without `ConnectInfo` (routers driven in-process, e.g. by tests) the
//! headers are the only signal and are used as-is. Requests with neither
//! share the [`UNKNOWN_IP`] bucket.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Bucket for requests whose origin cannot be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (cidr.parse::<IpAddr>().ok()?, None),
        };

        let max_prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or(max_prefix);
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Client address as reported by forwarding headers, if any.
fn forwarded_ip<B>(req: &Request<B>) -> Option<&str> {
    // "client, proxy1, proxy2": the first entry is the client
    if let Some(value) = req.headers().get("x-forwarded-for")
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Some(first);
    }

    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Key identifying the client that sent `req`.
pub fn client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    match peer_ip(req) {
        Some(peer) if trusted_proxies.is_trusted(&peer) => match forwarded_ip(req) {
            Some(ip) => Cow::Owned(ip.to_string()),
            None => Cow::Owned(peer.to_string()),
        },
        Some(peer) => {
            if forwarded_ip(req).is_some() {
                debug!(peer = %peer, "Ignoring forwarding headers from untrusted peer");
            }
            Cow::Owned(peer.to_string())
        }
        None => forwarded_ip(req)
            .map(|ip| Cow::Owned(ip.to_string()))
            .unwrap_or(Cow::Borrowed(UNKNOWN_IP)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/v1/posts");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    fn proxies(cidrs: &[&str]) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&cidrs.iter().map(|c| c.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_peer_address_is_default_key() {
        let req = request(&[], Some("203.0.113.9:51000"));
        assert_eq!(client_ip(&req, &proxies(&[])), "203.0.113.9");
    }

    #[test]
    fn test_untrusted_peer_cannot_spoof() {
        let req = request(&[("x-forwarded-for", "1.1.1.1")], Some("203.0.113.9:51000"));
        assert_eq!(client_ip(&req, &proxies(&["10.0.0.0/8"])), "203.0.113.9");
    }

    #[test]
    fn test_trusted_proxy_forwards_client() {
        let req = request(
            &[("x-forwarded-for", "198.51.100.7, 10.0.0.2")],
            Some("10.0.0.2:443"),
        );
        assert_eq!(client_ip(&req, &proxies(&["10.0.0.0/8"])), "198.51.100.7");
    }

    #[test]
    fn test_trusted_proxy_real_ip_fallback() {
        let req = request(&[("x-real-ip", "198.51.100.8")], Some("10.0.0.2:443"));
        assert_eq!(client_ip(&req, &proxies(&["10.0.0.0/8"])), "198.51.100.8");
    }

    #[test]
    fn test_headers_used_without_connect_info() {
        let req = request(&[("x-forwarded-for", "198.51.100.7")], None);
        assert_eq!(client_ip(&req, &proxies(&[])), "198.51.100.7");
    }

    #[test]
    fn test_unknown_fallback() {
        let req = request(&[], None);
        assert_eq!(client_ip(&req, &proxies(&[])), UNKNOWN_IP);

        let blank = request(&[("x-forwarded-for", " ")], None);
        assert_eq!(client_ip(&blank, &proxies(&[])), UNKNOWN_IP);
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config() {
        let config = proxies(&["10.0.0.0/8", "bogus", "172.16.0.0/12"]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"8.8.8.8".parse().unwrap()));

        assert!(!proxies(&[]).is_trusted(&"10.0.0.1".parse().unwrap()));
    }
}
