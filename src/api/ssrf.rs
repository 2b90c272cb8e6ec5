//! SSRF guard for the URL preview proxy.
//!
//! The proxy endpoint fetches user-supplied URLs on the hub's behalf, so
//! before any request leaves the hub the hostname is resolved and every
//! resolved address is checked against private, loopback, link-local and
//! IPv4-mapped ranges.

use std::net::IpAddr;

use crate::core::HubError;

/// Resolve a URL's host and reject it if any address lands in forbidden
/// space. Returns the parsed URL on success.
///
/// # Errors
///
/// [`HubError::BadInput`] for unparseable URLs or non-http(s) schemes,
/// [`HubError::Forbidden`] when the host resolves into private space.
pub async fn check_url(raw: &str) -> Result<reqwest::Url, HubError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| HubError::BadInput(format!("invalid url: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(HubError::BadInput(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| HubError::BadInput("url has no host".to_owned()))?;
    let port = url.port_or_known_default().unwrap_or(80);

    // Literal IPs skip DNS; hostnames are resolved and every address must
    // pass.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if ip_is_forbidden(ip) {
            return Err(HubError::Forbidden(format!("address {ip} is not allowed")));
        }
        return Ok(url);
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| HubError::BadInput(format!("cannot resolve '{host}': {e}")))?;
    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if ip_is_forbidden(addr.ip()) {
            return Err(HubError::Forbidden(format!(
                "'{host}' resolves to forbidden address {ip}",
                ip = addr.ip()
            )));
        }
    }
    if !resolved_any {
        return Err(HubError::BadInput(format!("'{host}' did not resolve")));
    }

    Ok(url)
}

/// RFC 1918, loopback, link-local, unspecified, ULA and IPv4-mapped IPv6
/// space.
#[must_use]
pub fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_is_forbidden(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_loopback_v4_are_forbidden() {
        for raw in ["10.0.0.1", "172.16.5.5", "192.168.1.1", "127.0.0.1", "169.254.1.1", "0.0.0.0"] {
            let ip: IpAddr = raw.parse().expect("ip");
            assert!(ip_is_forbidden(ip), "{raw} must be forbidden");
        }
    }

    #[test]
    fn public_v4_is_allowed() {
        for raw in ["1.1.1.1", "8.8.8.8", "93.184.216.34"] {
            let ip: IpAddr = raw.parse().expect("ip");
            assert!(!ip_is_forbidden(ip), "{raw} must be allowed");
        }
    }

    #[test]
    fn ipv4_mapped_v6_inherits_v4_rules() {
        let mapped: IpAddr = "::ffff:192.168.1.1".parse().expect("ip");
        assert!(ip_is_forbidden(mapped), "mapped private v4 is forbidden");

        let mapped_public: IpAddr = "::ffff:8.8.8.8".parse().expect("ip");
        assert!(!ip_is_forbidden(mapped_public), "mapped public v4 is fine");
    }

    #[test]
    fn v6_special_ranges_are_forbidden() {
        for raw in ["::1", "fe80::1", "fc00::1", "fd12::1", "::"] {
            let ip: IpAddr = raw.parse().expect("ip");
            assert!(ip_is_forbidden(ip), "{raw} must be forbidden");
        }
        let public: IpAddr = "2606:4700::1111".parse().expect("ip");
        assert!(!ip_is_forbidden(public), "public v6 is allowed");
    }

    #[tokio::test]
    async fn literal_loopback_url_is_rejected() {
        let err = check_url("http://127.0.0.1:8080/admin")
            .await
            .expect_err("must reject");
        assert!(matches!(err, HubError::Forbidden(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let err = check_url("file:///etc/passwd").await.expect_err("must reject");
        assert!(matches!(err, HubError::BadInput(_)), "got {err:?}");
    }
}
