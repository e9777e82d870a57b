//! Address canonicalization and hop-by-hop header scrubbing.
//!
//! Grounded on `examples/original_source/client/helper.go` (`portMap`,
//! `canonicalAddr`, `RmProxyHeaders`).

use crate::error::Error;

/// Default port for a URL scheme, used when an address arrives with no
/// explicit port (`canonicalAddr` in the original).
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "socks5" => Some(1080),
        _ => None,
    }
}

/// Fills in a missing port on `host` using `scheme`'s default, returning a
/// `host:port` string. `host` may already carry a port, in which case it is
/// returned unchanged.
pub fn canonical_addr(host: &str, scheme: &str) -> String {
    if host.rfind(':').map(|i| i > host.rfind(']').unwrap_or(0)).unwrap_or(false) {
        return host.to_string();
    }
    match default_port(scheme) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Validates a normalized tunnel target of the form `host:port` or
/// `[ipv6]:port`, port 1-5 digits, per spec §4.2's address sanitization rule.
pub fn validate_target(target: &str) -> Result<(), Error> {
    let (host, port) = split_host_port(target).ok_or(Error::InvalidAddress {
        addr: target.to_string(),
        reason: "missing host:port separator",
    })?;
    if host.is_empty() {
        return Err(Error::InvalidAddress { addr: target.to_string(), reason: "empty host" });
    }
    if port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAddress { addr: target.to_string(), reason: "invalid port" });
    }
    let port_num: u32 = port.parse().unwrap_or(u32::MAX);
    if port_num == 0 || port_num > 65535 {
        return Err(Error::InvalidAddress { addr: target.to_string(), reason: "port out of range" });
    }
    Ok(())
}

/// Splits `host:port` or `[ipv6]:port` into `(host, port)`. Returns `None` if
/// there is no unambiguous split point.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = after.strip_prefix(':')?;
        return Some((host, port));
    }
    let idx = addr.rfind(':')?;
    Some((&addr[..idx], &addr[idx + 1..]))
}

/// Hop-by-hop / proxy-only headers stripped before forwarding a request
/// upstream (`RmProxyHeaders` in the original, plus `Proxy-Connection` per
/// spec §4.6).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "forwarded",
];

/// True if `name` (case-insensitively) is a hop-by-hop header or one of the
/// `X-Forwarded-*` / `Forwarded-*` family.
pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str())
        || lower.starts_with("x-forwarded-")
        || lower.starts_with("forwarded-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        assert_eq!(default_port("http"), Some(80));
        assert_eq!(default_port("https"), Some(443));
        assert_eq!(default_port("socks5"), Some(1080));
        assert_eq!(default_port("gopher"), None);
    }

    #[test]
    fn canonicalizes_missing_port() {
        assert_eq!(canonical_addr("example.com", "http"), "example.com:80");
        assert_eq!(canonical_addr("example.com:8080", "http"), "example.com:8080");
    }

    #[test]
    fn splits_ipv6() {
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", "443")));
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", "443")));
        assert_eq!(split_host_port("no-port"), None);
    }

    #[test]
    fn validates_targets() {
        assert!(validate_target("example.com:443").is_ok());
        assert!(validate_target("[::1]:80").is_ok());
        assert!(validate_target("example.com:").is_err());
        assert!(validate_target("example.com:999999").is_err());
        assert!(validate_target("noport").is_err());
    }

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("Proxy-Connection"));
        assert!(is_hop_by_hop("X-Forwarded-For"));
        assert!(is_hop_by_hop("Forwarded-For"));
        assert!(!is_hop_by_hop("Content-Length"));
    }
}
