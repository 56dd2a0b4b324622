//! Host header parsing and normalization.
//!
//! Turns the raw `Host` value into the exact lookup key used against
//! `public.domains`. The resolver never decides which tenant applies; it only
//! yields the key. `X-Forwarded-Host` is deliberately ignored (trust boundary
//! sits at this server, not the proxy).

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HostError {
    #[error("unrecognized host: {0}")]
    Unrecognized(String),
}

/// Result of host resolution: either the shared store sentinel or the
/// case-normalized string used for the domain lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLookupKey {
    /// Host equals a configured bare base domain.
    Public,
    Host(String),
}

#[derive(Clone)]
pub struct HostResolver {
    base_domains: Vec<String>,
}

impl HostResolver {
    pub fn new(base_domains: Vec<String>) -> Self {
        Self { base_domains }
    }

    /// Normalize and classify a raw `Host` header value.
    ///
    /// Lowercases, strips the port and any trailing dot, rejects IP literals
    /// and hosts outside the configured base domains. Punycode labels pass
    /// through verbatim.
    pub fn resolve(&self, raw_host: &str) -> Result<HostLookupKey, HostError> {
        let normalized = Self::normalize(raw_host)
            .ok_or_else(|| HostError::Unrecognized(raw_host.to_string()))?;

        for base in &self.base_domains {
            if normalized == *base {
                return Ok(HostLookupKey::Public);
            }
            if normalized.len() > base.len() + 1
                && normalized.ends_with(base)
                && normalized.as_bytes()[normalized.len() - base.len() - 1] == b'.'
            {
                return Ok(HostLookupKey::Host(normalized));
            }
        }

        Err(HostError::Unrecognized(raw_host.to_string()))
    }

    fn normalize(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        // Bracketed IPv6 literals are never tenant hosts.
        if trimmed.starts_with('[') {
            return None;
        }

        // Strip the port, if any. A second colon would mean a bare IPv6
        // literal, which is also rejected.
        let without_port = match trimmed.split_once(':') {
            Some((host, port)) => {
                if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                host
            }
            None => trimmed,
        };
        if without_port.contains(':') {
            return None;
        }

        let without_dot = without_port.strip_suffix('.').unwrap_or(without_port);
        if without_dot.is_empty() {
            return None;
        }

        // Reject IPv4 literals.
        if without_dot
            .split('.')
            .all(|label| !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit()))
        {
            return None;
        }

        let lowered = without_dot.to_ascii_lowercase();

        // Every label must be non-empty and made of hostname characters.
        let labels_ok = lowered.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        });
        if !labels_ok {
            return None;
        }

        Some(lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> HostResolver {
        HostResolver::new(vec!["example.com".to_string(), "shops.dev".to_string()])
    }

    #[test]
    fn bare_base_domain_is_public() {
        assert_eq!(resolver().resolve("example.com"), Ok(HostLookupKey::Public));
        assert_eq!(resolver().resolve("shops.dev"), Ok(HostLookupKey::Public));
    }

    #[test]
    fn subdomain_yields_lookup_key() {
        assert_eq!(
            resolver().resolve("pepita.example.com"),
            Ok(HostLookupKey::Host("pepita.example.com".to_string()))
        );
        // Nested labels are still just lookup keys; the registry decides.
        assert_eq!(
            resolver().resolve("eu.pepita.example.com"),
            Ok(HostLookupKey::Host("eu.pepita.example.com".to_string()))
        );
    }

    #[test]
    fn normalization_lowercases_and_strips() {
        assert_eq!(
            resolver().resolve("Pepita.Example.COM:8443"),
            Ok(HostLookupKey::Host("pepita.example.com".to_string()))
        );
        assert_eq!(
            resolver().resolve("pepita.example.com."),
            Ok(HostLookupKey::Host("pepita.example.com".to_string()))
        );
        assert_eq!(resolver().resolve("EXAMPLE.COM:80"), Ok(HostLookupKey::Public));
    }

    #[test]
    fn punycode_accepted_verbatim() {
        assert_eq!(
            resolver().resolve("xn--caf-dma.example.com"),
            Ok(HostLookupKey::Host("xn--caf-dma.example.com".to_string()))
        );
    }

    #[test]
    fn rejects_foreign_and_malformed_hosts() {
        let r = resolver();
        assert!(r.resolve("unknown.other.org").is_err());
        assert!(r.resolve("notexample.com").is_err()); // suffix without dot boundary
        assert!(r.resolve("").is_err());
        assert!(r.resolve("pepita..example.com").is_err());
        assert!(r.resolve("pepita.example.com:80x").is_err());
    }

    #[test]
    fn rejects_ip_literals() {
        let r = resolver();
        assert!(r.resolve("127.0.0.1").is_err());
        assert!(r.resolve("10.0.0.1:8080").is_err());
        assert!(r.resolve("[::1]:443").is_err());
        assert!(r.resolve("::1").is_err());
    }
}
