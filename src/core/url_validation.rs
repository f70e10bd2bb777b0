//! Endpoint URL normalization and the optional private-network gate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use super::error::UrlValidationError;

const BLOCKED_HOSTNAMES: [&str; 3] = ["localhost", "0.0.0.0", "metadata.google.internal"];

const BLOCKED_TLDS: [&str; 4] = [".local", ".internal", ".lan", ".corp"];

/// Ports of well-known non-HTTP services.
const BLOCKED_PORTS: [u16; 9] = [22, 23, 25, 110, 143, 3306, 5432, 6379, 27017];

/// Parses and normalizes `raw`: lowercase scheme and host, default port
/// dropped, no fragment, no trailing slash on the path. Query strings are
/// refused since request paths are appended to the result. With `block_private` the
/// loopback, private, link-local and internal-name destinations are refused.
pub fn validate_endpoint_url(raw: &str, block_private: bool) -> Result<String, UrlValidationError> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed).map_err(|_| UrlValidationError::Malformed {
        url: trimmed.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(UrlValidationError::UnsupportedScheme {
                scheme: other.to_string(),
            });
        }
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }

    let host = url.host().ok_or_else(|| UrlValidationError::MissingHost {
        url: trimmed.to_string(),
    })?;

    if block_private {
        check_host(&host)?;
        if let Some(port) = url.port() {
            if BLOCKED_PORTS.contains(&port) {
                return Err(UrlValidationError::BlockedPort { port });
            }
        }
    }

    if url.query().is_some() {
        return Err(UrlValidationError::QueryNotAllowed {
            url: trimmed.to_string(),
        });
    }

    url.set_fragment(None);
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    // `url` already lowercases scheme/host and drops default ports. An empty
    // path is rendered as "/", which is the only trailing slash left.
    let normalized = url.as_str().trim_end_matches('/').to_string();
    Ok(normalized)
}

fn check_host(host: &Host<&str>) -> Result<(), UrlValidationError> {
    let blocked = match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            BLOCKED_HOSTNAMES.contains(&domain.as_str())
                || BLOCKED_TLDS.iter().any(|tld| domain.ends_with(tld))
        }
        Host::Ipv4(ip) => is_private_ip(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_private_ip(IpAddr::V6(*ip)),
    };

    if blocked {
        Err(UrlValidationError::BlockedHost {
            host: host.to_string(),
        })
    } else {
        Ok(())
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // carrier-grade NAT 100.64.0.0/10
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_url() {
        assert_eq!(
            validate_endpoint_url("HTTP://GPU-Box.Example.COM:80/", false).unwrap(),
            "http://gpu-box.example.com"
        );
        assert_eq!(
            validate_endpoint_url("https://api.example.com:443/v1/#frag", false).unwrap(),
            "https://api.example.com/v1"
        );
        assert_eq!(
            validate_endpoint_url("  http://10.0.0.5:8000  ", false).unwrap(),
            "http://10.0.0.5:8000"
        );
    }

    #[test]
    fn test_trailing_slashes_are_trimmed_from_path() {
        let base = validate_endpoint_url("http://gpu.example.com:8000/api//", false).unwrap();
        assert_eq!(base, "http://gpu.example.com:8000/api");

        let joined = Url::parse(&format!("{base}/v1/chat/completions")).unwrap();
        assert_eq!(joined.path(), "/api/v1/chat/completions");
        assert_eq!(joined.query(), None);
    }

    #[test]
    fn test_rejects_query_string() {
        assert_eq!(
            validate_endpoint_url("http://gpu.example.com:8000/api/?tenant=a", false),
            Err(UrlValidationError::QueryNotAllowed {
                url: "http://gpu.example.com:8000/api/?tenant=a".to_string()
            })
        );
        assert!(matches!(
            validate_endpoint_url("http://h/api/?k=v", false),
            Err(UrlValidationError::QueryNotAllowed { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            validate_endpoint_url("not a url", false),
            Err(UrlValidationError::Malformed { .. })
        ));
        assert!(matches!(
            validate_endpoint_url("ftp://example.com", false),
            Err(UrlValidationError::UnsupportedScheme { scheme }) if scheme == "ftp"
        ));
        assert_eq!(
            validate_endpoint_url("http://user:pw@example.com", false),
            Err(UrlValidationError::EmbeddedCredentials)
        );
    }

    #[test]
    fn test_private_gate_off_allows_loopback() {
        assert_eq!(
            validate_endpoint_url("http://127.0.0.1:9000", false).unwrap(),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_private_gate_blocks_internal_destinations() {
        for url in [
            "http://127.0.0.1:9000",
            "http://localhost:8000",
            "http://192.168.1.20",
            "http://10.1.2.3:8080",
            "http://169.254.169.254",
            "http://100.64.0.1",
            "http://[::1]:8000",
            "http://[fd00::1]",
            "http://gpu.internal",
            "http://box.local:8000",
        ] {
            assert!(
                matches!(
                    validate_endpoint_url(url, true),
                    Err(UrlValidationError::BlockedHost { .. })
                ),
                "{url} should be blocked"
            );
        }
    }

    #[test]
    fn test_private_gate_blocks_service_ports() {
        assert_eq!(
            validate_endpoint_url("http://db.example.com:5432", true),
            Err(UrlValidationError::BlockedPort { port: 5432 })
        );
    }

    #[test]
    fn test_private_gate_allows_public_hosts() {
        assert_eq!(
            validate_endpoint_url("https://inference.example.org:8443/", true).unwrap(),
            "https://inference.example.org:8443"
        );
        assert!(validate_endpoint_url("http://8.8.8.8:8000", true).is_ok());
    }
}
