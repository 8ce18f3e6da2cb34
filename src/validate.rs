//! URL validation and SSRF protection
//!
//! Every URL is checked once, before any network traffic. Only literal
//! addresses are inspected; hostnames are not resolved.

use crate::utils::host_matches_any;
use crate::{FetchError, UrlGuardSettings};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

pub struct UrlGuard {
    settings: UrlGuardSettings,
}

impl UrlGuard {
    pub fn new(settings: UrlGuardSettings) -> Self {
        Self { settings }
    }

    pub fn validate(&self, raw: &str) -> Result<Url, FetchError> {
        let trimmed = raw.trim();
        let reject = |reason: &str| Err(FetchError::Validation(format!("{trimmed}: {reason}")));

        if trimmed.is_empty() {
            return Err(FetchError::Validation("URL is empty".to_string()));
        }
        if trimmed.len() > self.settings.max_url_length {
            return Err(FetchError::Validation(format!(
                "URL exceeds {} characters",
                self.settings.max_url_length
            )));
        }

        let url = match Url::parse(trimmed) {
            Ok(url) => url,
            Err(e) => return reject(&e.to_string()),
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return reject("URL must use http or https scheme");
        }
        if !url.username().is_empty() || url.password().is_some() {
            return reject("URLs with embedded credentials are not allowed");
        }

        let host = match url.host() {
            Some(host) => host,
            None => return reject("URL has no host"),
        };

        if !self.settings.allow_private_networks {
            match &host {
                Host::Ipv4(ip) if is_internal_ip(IpAddr::V4(*ip)) => {
                    return reject("URLs pointing to private/loopback addresses are not allowed")
                }
                Host::Ipv6(ip) if is_internal_ip(IpAddr::V6(*ip)) => {
                    return reject("URLs pointing to private/loopback addresses are not allowed")
                }
                Host::Domain(domain) if is_internal_hostname(domain) => {
                    return reject("URLs pointing to internal hosts are not allowed")
                }
                _ => {}
            }
        }

        if let Host::Domain(domain) = &host {
            if host_matches_any(domain, &self.settings.blocked_hosts) {
                return reject("host is blocked");
            }
        }

        Ok(url)
    }
}

fn is_internal_hostname(domain: &str) -> bool {
    let lower = domain.trim_end_matches('.').to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
}

/// Loopback, private, link-local, unspecified, multicast and other
/// non-routable ranges.
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_v4(mapped);
            }
            is_internal_v6(v6)
        }
    }
}

fn is_internal_v4(v4: Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_multicast()
        || v4.is_broadcast()
        || a == 0
        // carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
}

fn is_internal_v6(v6: Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || v6.is_multicast()
        // unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (first & 0xffc0) == 0xfe80
}
