use crate::error::OgieError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Validates URLs before any request targets them.
///
/// Private-target detection is lexical: the host is matched as written (or as
/// an IP literal) and never resolved. A public hostname whose DNS record points
/// at a private address is not caught here.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlGuard {
    allow_private_urls: bool,
}

impl UrlGuard {
    pub fn new(allow_private_urls: bool) -> Self {
        Self { allow_private_urls }
    }

    /// Parses `url_str` and checks it against the scheme and private-target rules.
    pub fn validate(&self, url_str: &str) -> Result<Url, OgieError> {
        let url = Url::parse(url_str.trim())
            .map_err(|e| OgieError::invalid_url(url_str, format!("unparseable URL: {e}")))?;
        self.validate_parsed(&url)?;
        Ok(url)
    }

    /// Same checks as [`UrlGuard::validate`] for an already parsed URL, e.g. a
    /// resolved redirect target.
    pub fn validate_parsed(&self, url: &Url) -> Result<(), OgieError> {
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            return Err(OgieError::invalid_url(
                url.as_str(),
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }

        let host = url
            .host()
            .ok_or_else(|| OgieError::invalid_url(url.as_str(), "URL has no host"))?;

        if !self.allow_private_urls && is_private_host(&host) {
            return Err(OgieError::invalid_url(
                url.as_str(),
                format!("private or internal host '{host}' is not allowed"),
            ));
        }

        Ok(())
    }
}

/// Convenience wrapper around [`UrlGuard::validate`].
pub fn validate_url(url: &str, allow_private_urls: bool) -> Result<Url, OgieError> {
    UrlGuard::new(allow_private_urls).validate(url)
}

/// Returns true when the URL parses and points at a private or internal host.
pub fn is_private_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host().map(|h| is_private_host(&h)))
        .unwrap_or(false)
}

pub fn is_private_host<S: AsRef<str>>(host: &Host<S>) -> bool {
    match host {
        Host::Domain(domain) => is_internal_domain(domain.as_ref()),
        Host::Ipv4(ip) => is_private_ipv4(ip),
        Host::Ipv6(ip) => is_private_ipv6(ip),
    }
}

fn is_internal_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain == "localhost" || domain.ends_with(".local") || domain.ends_with(".internal") {
        return true;
    }
    // Hosts that slipped through as text but are really IP literals.
    match domain.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_ipv4(&ip),
        Ok(IpAddr::V6(ip)) => is_private_ipv6(&ip),
        Err(_) => false,
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    ip.is_loopback()
        || ip.is_unspecified()
        // 169.254.0.0/16
        || ip.is_link_local()
        // 10.0.0.0/8
        || octets[0] == 10
        // 172.16.0.0/12
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        // 192.168.0.0/16
        || (octets[0] == 192 && octets[1] == 168)
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&mapped);
    }
    let first = ip.segments()[0];

    ip.is_loopback()
        || ip.is_unspecified()
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
}
