//! Subdomain-encoded target resolution (C1) and the URL Proxifier (C4).
//!
//! A `ProxyURL` has the shape `https://{target_host}.{root_domain}{path}{query}`.
//! Converting between the two is the hot path of the whole system — every
//! attribute, every CSS `url()`, every JSON string field goes through
//! [`proxify`]. The prefix/suffix strings are precomputed once per call site
//! (see [`Suffix`]) rather than reformatted on every invocation, per the
//! "arena + index" design note: hot path calls this millions of times.

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("request host is off-domain or has an empty target label")]
    NotProxyable,
    #[error("could not parse a target URL from the redirect query")]
    InvalidRedirectTarget,
}

/// Precomputed `.{root_domain}` suffix and owned root domain, so per-request
/// resolution never reformats the domain string.
#[derive(Debug, Clone)]
pub struct Suffix {
    root_domain: String,
    dotted: String,
}

impl Suffix {
    pub fn new(root_domain: impl Into<String>) -> Self {
        let root_domain = root_domain.into();
        let dotted = format!(".{root_domain}");
        Self { root_domain, dotted }
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    /// `true` if `host` is exactly the root domain (the "landing" host).
    pub fn is_root(&self, host: &str) -> bool {
        host.eq_ignore_ascii_case(&self.root_domain)
    }

    /// `true` if `host` ends with `.{root_domain}` (a proxied subdomain, or
    /// any already-proxified absolute URL we encounter mid-rewrite).
    pub fn is_proxy_host(&self, host: &str) -> bool {
        host.len() > self.dotted.len() && host.to_ascii_lowercase().ends_with(&self.dotted)
    }

    /// Strip the `.{root_domain}` suffix, returning the target host label.
    /// `None` if `host` is not a proxy host or the remaining label is empty.
    pub fn strip<'a>(&self, host: &'a str) -> Option<&'a str> {
        if !self.is_proxy_host(host) {
            return None;
        }
        let target = &host[..host.len() - self.dotted.len()];
        if target.is_empty() {
            None
        } else {
            Some(target)
        }
    }
}

/// An absolute URL toward an upstream origin, derived from the request
/// hostname. Always `https`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl(pub Url);

impl TargetUrl {
    pub fn target_host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }
}

/// Resolution outcome for an incoming request host+path+query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Hostname equals `root_domain`: serve the landing page (no target).
    Landing,
    /// Hostname is a proxied subdomain; here is the resolved upstream URL.
    Target(TargetUrl),
}

/// C1: resolve the upstream target from a request's host/path/query.
///
/// `path_and_query` must already include the leading `/` and any `?query`.
pub fn resolve(suffix: &Suffix, host: &str, path_and_query: &str) -> Result<Resolution, ResolveError> {
    if suffix.is_root(host) {
        return Ok(Resolution::Landing);
    }
    let target_host = suffix.strip(host).ok_or(ResolveError::NotProxyable)?;
    let raw = format!("https://{target_host}{path_and_query}");
    let url = Url::parse(&raw).map_err(|_| ResolveError::NotProxyable)?;
    Ok(Resolution::Target(TargetUrl(url)))
}

/// C1 root redirect: parse a user-typed target from `?example.com` or
/// `?https://example.com/x` on a request to the bare root domain, and
/// return the ProxyURL it should redirect to.
pub fn resolve_root_redirect(suffix: &Suffix, query: &str) -> Result<String, ResolveError> {
    if query.is_empty() {
        return Err(ResolveError::InvalidRedirectTarget);
    }
    let decoded = percent_encoding::percent_decode_str(query)
        .decode_utf8()
        .map_err(|_| ResolveError::InvalidRedirectTarget)?;
    let decoded = decoded.trim();
    if decoded.is_empty() {
        return Err(ResolveError::InvalidRedirectTarget);
    }
    let with_scheme = if decoded.contains("://") {
        decoded.to_string()
    } else {
        format!("https://{decoded}")
    };
    let parsed = Url::parse(&with_scheme).map_err(|_| ResolveError::InvalidRedirectTarget)?;
    let host = parsed
        .host_str()
        .ok_or(ResolveError::InvalidRedirectTarget)?;
    let path_and_query = path_and_query_of(&parsed);
    Ok(format!("https://{host}{}{path_and_query}", suffix.dotted))
}

fn path_and_query_of(url: &Url) -> String {
    let mut s = url.path().to_string();
    if let Some(q) = url.query() {
        s.push('?');
        s.push_str(q);
    }
    s
}

/// C4: the shared URL Proxifier. Converts an absolute (or base-relative) URL
/// into its ProxyURL form. Idempotent: proxifying an already-proxified URL
/// is a no-op. Leaves opaque schemes (`data:`, `blob:`, `javascript:`,
/// `chrome-extension:`), empty strings, and fragment-only references
/// untouched.
pub fn proxify(suffix: &Suffix, base: &Url, raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return raw.to_string();
    }
    let lower = trimmed.to_ascii_lowercase();
    for scheme in ["data:", "blob:", "javascript:", "chrome-extension:"] {
        if lower.starts_with(scheme) {
            return raw.to_string();
        }
    }

    let resolved = match base.join(trimmed) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    let Some(host) = resolved.host_str() else {
        return raw.to_string();
    };

    if suffix.is_proxy_host(host) {
        // Already proxied: idempotent no-op.
        return resolved.to_string();
    }

    let scheme = match resolved.scheme() {
        "ws" | "wss" => "wss",
        _ => "https",
    };
    format!("{scheme}://{host}{}{}", suffix.dotted, path_and_query_of(&resolved))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn landing_on_bare_root() {
        let r = resolve(&suffix(), "p.example", "/").unwrap();
        assert_eq!(r, Resolution::Landing);
    }

    #[test]
    fn resolves_target_verbatim_no_dash_rewrite() {
        let r = resolve(&suffix(), "www.google.com.p.example", "/x?y=1").unwrap();
        match r {
            Resolution::Target(t) => assert_eq!(t.0.as_str(), "https://www.google.com/x?y=1"),
            _ => panic!("expected target"),
        }
    }

    #[test]
    fn off_domain_is_not_proxyable() {
        let e = resolve(&suffix(), "evil.com", "/").unwrap_err();
        assert_eq!(e, ResolveError::NotProxyable);
    }

    #[test]
    fn empty_subdomain_is_not_proxyable() {
        let e = resolve(&suffix(), ".p.example", "/").unwrap_err();
        assert_eq!(e, ResolveError::NotProxyable);
    }

    #[test]
    fn root_redirect_bare_host() {
        let p = resolve_root_redirect(&suffix(), "example.com/path").unwrap();
        assert_eq!(p, "https://example.com.p.example/path");
    }

    #[test]
    fn root_redirect_full_url() {
        let p = resolve_root_redirect(&suffix(), "https%3A%2F%2Fexample.com%2Fx").unwrap();
        assert_eq!(p, "https://example.com.p.example/x");
    }

    #[test]
    fn root_redirect_empty_is_error() {
        assert!(resolve_root_redirect(&suffix(), "").is_err());
    }

    #[test]
    fn proxify_idempotent() {
        let s = suffix();
        let base = Url::parse("https://www.google.com.p.example/").unwrap();
        let once = proxify(&s, &base, "https://www.google.com/x");
        let base2 = Url::parse(&once).unwrap();
        let twice = proxify(&s, &base2, &once);
        assert_eq!(once, twice);
        assert_eq!(once, "https://www.google.com.p.example/x");
    }

    #[test]
    fn proxify_leaves_opaque_schemes() {
        let s = suffix();
        let base = Url::parse("https://x.com.p.example/").unwrap();
        assert_eq!(proxify(&s, &base, "data:text/plain,hi"), "data:text/plain,hi");
        assert_eq!(proxify(&s, &base, "javascript:void(0)"), "javascript:void(0)");
        assert_eq!(proxify(&s, &base, "#frag"), "#frag");
        assert_eq!(proxify(&s, &base, ""), "");
    }

    #[test]
    fn proxify_relative_resolves_against_base() {
        let s = suffix();
        let base = Url::parse("https://www.google.com.p.example/dir/").unwrap();
        assert_eq!(
            proxify(&s, &base, "/y"),
            "https://www.google.com.p.example/y"
        );
    }

    #[test]
    fn proxify_websocket_scheme_maps_to_wss() {
        let s = suffix();
        let base = Url::parse("https://x.com.p.example/").unwrap();
        assert_eq!(
            proxify(&s, &base, "ws://x.com/socket"),
            "wss://x.com.p.example/socket"
        );
    }
}
