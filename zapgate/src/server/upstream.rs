//! Upstream allowlist: SSRF defense for every proxied URL.

use std::collections::HashSet;

use url::Url;

use crate::utils::url::canonical_authority;
use crate::{Error, Result};

/// Validates that resolved targets point at a configured upstream.
///
/// Authorities are compared in canonical form: lowercased host, explicit
/// port, IPv6 bracketed. Anything else is rejected before any outbound
/// I/O happens.
#[derive(Debug)]
pub struct UpstreamValidator {
    allowed: HashSet<String>,
}

impl UpstreamValidator {
    /// Build from the configured allowlist plus the receiver base URL,
    /// whose API and raw TS ports are always legitimate targets.
    pub fn new(allowed: &[String], api_base: &str) -> Self {
        let mut set: HashSet<String> = allowed.iter().map(|a| a.to_ascii_lowercase()).collect();

        if let Ok(base) = Url::parse(api_base) {
            if let Some(authority) = canonical_authority(&base) {
                set.insert(authority);
            }
            if let Some(host) = base.host_str() {
                let host = host.to_ascii_lowercase();
                if host.contains(':') && !host.starts_with('[') {
                    set.insert(format!("[{host}]:8001"));
                } else {
                    set.insert(format!("{host}:8001"));
                }
            }
        }

        Self { allowed: set }
    }

    /// Validate a target URL; returns the parsed URL on success.
    pub fn validate(&self, raw: &str) -> Result<Url> {
        let url =
            Url::parse(raw).map_err(|e| Error::upstream(format!("invalid target URL: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::upstream(format!(
                    "scheme {other:?} is not proxyable"
                )));
            }
        }

        let authority = canonical_authority(&url)
            .ok_or_else(|| Error::upstream("target URL has no authority"))?;

        if self.allowed.contains(&authority) {
            Ok(url)
        } else {
            Err(Error::UpstreamNotAllowed(authority))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> UpstreamValidator {
        UpstreamValidator::new(
            &["cdn.example.com:443".to_string()],
            "http://receiver.lan",
        )
    }

    #[test]
    fn api_base_and_ts_port_are_implicitly_allowed() {
        let v = validator();
        assert!(v.validate("http://receiver.lan/web/stream.m3u?ref=1:0:1").is_ok());
        assert!(v.validate("http://receiver.lan:8001/1:0:19:132F").is_ok());
        assert!(v.validate("http://RECEIVER.LAN:8001/x").is_ok(), "host is case folded");
    }

    #[test]
    fn configured_extra_authorities_pass() {
        assert!(validator().validate("https://cdn.example.com/seg.ts").is_ok());
    }

    #[test]
    fn unknown_authorities_are_rejected() {
        let v = validator();
        assert!(matches!(
            v.validate("http://attacker.example/steal"),
            Err(Error::UpstreamNotAllowed(_))
        ));
        // Same host, wrong port.
        assert!(v.validate("http://receiver.lan:9999/x").is_err());
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let v = validator();
        assert!(v.validate("file:///etc/passwd").is_err());
        assert!(v.validate("ftp://receiver.lan/x").is_err());
    }

    #[test]
    fn ipv6_authorities_are_bracketed() {
        let v = UpstreamValidator::new(&["[fe80::1]:8001".to_string()], "http://[fe80::1]");
        assert!(v.validate("http://[fe80::1]:8001/1:0:1").is_ok());
    }
}
