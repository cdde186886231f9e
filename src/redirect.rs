// ABOUTME: Redirect-URI security policy enforcement for registration and authorization
// ABOUTME: Validates schemes, hosts, loopback carve-outs, and optional DNS resolution
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Redirect-URI validation.
//!
//! A redirect URI passes iff it parses, has no fragment, and has a scheme.
//! `http`/`https` URIs need a host; in production non-loopback redirects must
//! be `https`. Custom schemes (native apps) are allowed unless blocklisted.
//! Loopback hosts are always permitted, even in production.

use std::net::IpAddr;

use thiserror::Error;
use url::Url;

use crate::config::RedirectUriSecurity;

/// Schemes that must never be registered as redirect targets.
const BLOCKED_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript", "about"];

/// Why a redirect URI was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectUriError {
    /// The URI did not parse (this also covers a missing scheme).
    #[error("redirect URI does not parse as an absolute URI")]
    Unparseable,
    /// Fragments are forbidden (RFC 6749 section 3.1.2).
    #[error("redirect URI must not contain a fragment")]
    Fragment,
    /// The scheme is on the blocklist.
    #[error("redirect URI scheme {0:?} is not allowed")]
    BlockedScheme(String),
    /// An http(s) URI without a host.
    #[error("redirect URI must include a host")]
    MissingHost,
    /// Non-loopback http in production mode.
    #[error("non-loopback redirect URIs must use https in production")]
    InsecureScheme,
    /// Private-range host rejected by policy.
    #[error("redirect URI host is in a private address range")]
    PrivateAddress,
    /// Link-local host rejected by policy.
    #[error("redirect URI host is link-local")]
    LinkLocalAddress,
    /// Loopback host rejected by policy.
    #[error("loopback redirect URIs are not allowed by policy")]
    LoopbackDisallowed,
    /// Strict DNS is enabled and the host did not resolve.
    #[error("redirect URI host does not resolve")]
    Unresolvable,
}

/// Whether a host string names the loopback interface.
#[must_use]
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed
        .parse::<IpAddr>()
        .map_or(false, |ip| ip.is_loopback())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn is_link_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Validate a redirect URI against the security policy.
///
/// # Errors
/// Returns the first policy violation found.
pub async fn validate_redirect_uri(
    uri: &str,
    policy: &RedirectUriSecurity,
) -> Result<(), RedirectUriError> {
    if uri.contains('#') {
        return Err(RedirectUriError::Fragment);
    }

    let parsed = Url::parse(uri).map_err(|_| RedirectUriError::Unparseable)?;
    if parsed.fragment().is_some() {
        return Err(RedirectUriError::Fragment);
    }

    let scheme = parsed.scheme().to_ascii_lowercase();
    if BLOCKED_SCHEMES.contains(&scheme.as_str()) {
        return Err(RedirectUriError::BlockedScheme(scheme));
    }

    // Custom schemes for native apps carry no host to vet.
    if scheme != "http" && scheme != "https" {
        return Ok(());
    }

    let Some(host) = parsed.host_str() else {
        return Err(RedirectUriError::MissingHost);
    };

    if is_loopback_host(host) {
        if policy.allow_loopback {
            return Ok(());
        }
        return Err(RedirectUriError::LoopbackDisallowed);
    }

    let host_ip = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok();

    if let Some(ip) = host_ip {
        if is_private_ip(ip) && !policy.allow_private_ip {
            return Err(RedirectUriError::PrivateAddress);
        }
        if is_link_local_ip(ip) && !policy.allow_link_local {
            return Err(RedirectUriError::LinkLocalAddress);
        }
    }

    if policy.production_mode && scheme != "https" {
        return Err(RedirectUriError::InsecureScheme);
    }

    if policy.strict_dns && host_ip.is_none() {
        let lookup_target = format!("{host}:{}", parsed.port_or_known_default().unwrap_or(443));
        match tokio::net::lookup_host(lookup_target).await {
            Ok(mut addrs) => {
                if addrs.next().is_none() {
                    return Err(RedirectUriError::Unresolvable);
                }
            }
            Err(_) => return Err(RedirectUriError::Unresolvable),
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn lax() -> RedirectUriSecurity {
        RedirectUriSecurity {
            allow_loopback: true,
            allow_private_ip: false,
            allow_link_local: false,
            strict_dns: false,
            production_mode: false,
        }
    }

    fn production() -> RedirectUriSecurity {
        RedirectUriSecurity {
            production_mode: true,
            ..lax()
        }
    }

    #[tokio::test]
    async fn accepts_https_and_custom_schemes() {
        assert!(validate_redirect_uri("https://app.example.com/cb", &lax())
            .await
            .is_ok());
        assert!(validate_redirect_uri("myapp://oauth/callback", &lax())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rejects_fragments_and_garbage() {
        assert_eq!(
            validate_redirect_uri("https://a.example.com/cb#frag", &lax()).await,
            Err(RedirectUriError::Fragment)
        );
        assert_eq!(
            validate_redirect_uri("not a uri", &lax()).await,
            Err(RedirectUriError::Unparseable)
        );
        assert_eq!(
            validate_redirect_uri("/relative/path", &lax()).await,
            Err(RedirectUriError::Unparseable)
        );
    }

    #[tokio::test]
    async fn rejects_blocklisted_schemes() {
        for uri in [
            "javascript:alert(1)",
            "data:text/html,x",
            "file:///etc/passwd",
            "vbscript:msgbox",
            "about:blank",
        ] {
            let err = validate_redirect_uri(uri, &lax()).await.unwrap_err();
            assert!(
                matches!(err, RedirectUriError::BlockedScheme(_)),
                "{uri} should be blocked, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn loopback_allowed_even_in_production() {
        for uri in [
            "http://localhost:8765/cb",
            "http://127.0.0.1:8765/cb",
            "http://127.0.0.53/cb",
            "http://[::1]:9000/cb",
        ] {
            assert!(
                validate_redirect_uri(uri, &production()).await.is_ok(),
                "{uri} should pass in production"
            );
        }
    }

    #[tokio::test]
    async fn production_requires_https_for_public_hosts() {
        assert_eq!(
            validate_redirect_uri("http://app.example.com/cb", &production()).await,
            Err(RedirectUriError::InsecureScheme)
        );
        assert!(
            validate_redirect_uri("https://app.example.com/cb", &production())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn private_and_link_local_follow_policy() {
        assert_eq!(
            validate_redirect_uri("http://10.1.2.3/cb", &lax()).await,
            Err(RedirectUriError::PrivateAddress)
        );
        assert_eq!(
            validate_redirect_uri("http://169.254.10.10/cb", &lax()).await,
            Err(RedirectUriError::LinkLocalAddress)
        );

        let permissive = RedirectUriSecurity {
            allow_private_ip: true,
            allow_link_local: true,
            ..lax()
        };
        assert!(validate_redirect_uri("http://10.1.2.3/cb", &permissive)
            .await
            .is_ok());
    }

    #[test]
    fn loopback_host_detection() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("127.255.0.9"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("example.com"));
        assert!(!is_loopback_host("10.0.0.1"));
    }
}
