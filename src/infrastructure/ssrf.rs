use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use url::Url;

use crate::error::SsrfError;

/// Validates a feed URL before any network I/O is attempted.
///
/// Checks, in order: scheme is `http`/`https`; the literal hostname is not
/// `localhost`; every address the hostname resolves to is public (this
/// protects against DNS rebinding, since a hostname can legitimately
/// resolve to a public address at validation time and a private one at
/// request time — we still only check once here, at validation time, per
/// the base contract).
pub fn validate_url(url: &str) -> Result<(), SsrfError> {
    let parsed = Url::parse(url).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::UnsupportedScheme(other.to_string())),
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| SsrfError::InvalidUrl("missing host".to_string()))?;

    if host.eq_ignore_ascii_case("localhost") {
        return Err(SsrfError::PrivateAddress);
    }

    // `Url::host()` yields a parsed IP directly for IP-literal hosts
    // (`host_str()` would return the bracketed `[::1]` form for IPv6, which
    // `Ipv6Addr::from_str` rejects).
    match parsed.host() {
        Some(url::Host::Ipv4(ip)) => {
            return if is_private_ipv4(&ip) { Err(SsrfError::PrivateAddress) } else { Ok(()) };
        }
        Some(url::Host::Ipv6(ip)) => {
            return if is_private_ipv6(&ip) { Err(SsrfError::PrivateAddress) } else { Ok(()) };
        }
        _ => {}
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SsrfError::DnsResolutionFailed(e.to_string()))?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_private_ip(&addr.ip()) {
            return Err(SsrfError::PrivateAddress);
        }
    }

    if !resolved_any {
        return Err(SsrfError::DnsResolutionFailed(format!(
            "no addresses for host {host}"
        )));
    }

    Ok(())
}

/// Test-only variant that skips the address check, so tests can validate
/// URLs pointing at a loopback `wiremock::MockServer`. Must never be
/// reachable from a production code path.
pub fn validate_url_allow_loopback(url: &str) -> Result<(), SsrfError> {
    let parsed = Url::parse(url).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SsrfError::UnsupportedScheme(other.to_string())),
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }

    // IPv4-mapped IPv6 (::ffff:a.b.c.d) must be unwrapped and re-checked,
    // otherwise an attacker can smuggle a private IPv4 address past the
    // scheme/host checks by writing it in this form.
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&mapped);
    }

    let segments = ip.segments();
    // Unique local address fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // Link-local fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_ipv4_literal() {
        assert!(matches!(
            validate_url("http://127.0.0.1"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_localhost_literal() {
        assert!(matches!(
            validate_url("http://localhost"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_rfc1918_10() {
        assert!(matches!(
            validate_url("http://10.0.0.1"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_rfc1918_192_168() {
        assert!(matches!(
            validate_url("http://192.168.1.1"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_link_local_ipv4() {
        assert!(matches!(
            validate_url("http://169.254.1.1"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_loopback_ipv6_literal() {
        assert!(matches!(
            validate_url("http://[::1]"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_ipv4_mapped_ipv6_loopback() {
        assert!(matches!(
            validate_url("http://[::ffff:127.0.0.1]"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_ipv4_mapped_ipv6_private() {
        assert!(matches!(
            validate_url("http://[::ffff:192.168.1.1]"),
            Err(SsrfError::PrivateAddress)
        ));
    }

    #[test]
    fn rejects_ftp_scheme() {
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(SsrfError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_file_scheme() {
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(SsrfError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn accepts_public_https_url() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
    }
}
