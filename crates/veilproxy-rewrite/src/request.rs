//! C2: Request Rewriter. Prepares the outgoing upstream request: strips
//! leak headers, rewrites `Referer`/`Origin` identity, and filters cookies
//! per the configured glob pass-through lists.

use http::{HeaderMap, HeaderValue};
use url::Url;

use veilproxy_url::{resolve, Resolution, Suffix};

use crate::headers::filter_request_cookies;

/// Headers stripped case-insensitively from every outbound upstream request.
const LEAK_HEADER_PREFIXES: &[&str] = &["x-forwarded-", "cf-access-", "x-cf-"];
const LEAK_HEADERS_EXACT: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-real-ip",
    "via",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
];

pub fn strip_leak_headers(headers: &mut HeaderMap) {
    let to_remove: Vec<String> = headers
        .keys()
        .filter(|name| {
            let lower = name.as_str().to_ascii_lowercase();
            LEAK_HEADERS_EXACT.contains(&lower.as_str())
                || LEAK_HEADER_PREFIXES.iter().any(|p| lower.starts_with(p))
        })
        .map(|name| name.as_str().to_string())
        .collect();
    for name in to_remove {
        headers.remove(&name);
    }
}

/// Rewrite `Referer`/`Origin` so the upstream sees its own identity instead
/// of the proxy's: if the header's hostname ends with `root_domain`,
/// resolve it with the URL Resolver and replace it with the resolved target
/// URL. On parse failure, delete the header. This unconditionally rewrites
/// any proxy-hosted Referer regardless of whether it matches the current
/// request's target (see DESIGN.md, Open Question 1).
fn rewrite_identity_header(suffix: &Suffix, headers: &mut HeaderMap, name: http::HeaderName) {
    let Some(value) = headers.get(&name).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else {
        headers.remove(&name);
        return;
    };
    let Ok(url) = Url::parse(raw) else {
        headers.remove(&name);
        return;
    };
    let Some(host) = url.host_str() else {
        headers.remove(&name);
        return;
    };
    if !suffix.is_proxy_host(host) {
        return;
    }

    let path_and_query = {
        let mut s = url.path().to_string();
        if let Some(q) = url.query() {
            s.push('?');
            s.push_str(q);
        }
        s
    };
    match resolve(suffix, host, &path_and_query) {
        Ok(Resolution::Target(target)) => {
            if let Ok(hv) = HeaderValue::from_str(target.0.as_str()) {
                headers.insert(name, hv);
            } else {
                headers.remove(&name);
            }
        }
        _ => {
            headers.remove(&name);
        }
    }
}

pub fn rewrite_referer_and_origin(suffix: &Suffix, headers: &mut HeaderMap) {
    rewrite_identity_header(suffix, headers, http::header::REFERER);
    rewrite_identity_header(suffix, headers, http::header::ORIGIN);
}

/// Build the outbound header set for the upstream request: set `Host` to
/// the target hostname, strip leak headers, rewrite identity headers, and
/// filter cookies.
pub fn prepare_upstream_headers(
    suffix: &Suffix,
    target_host: &str,
    mut headers: HeaderMap,
    root_passthrough: &[wildmatch::WildMatch],
    proxy_passthrough: &[wildmatch::WildMatch],
) -> HeaderMap {
    strip_leak_headers(&mut headers);
    rewrite_referer_and_origin(suffix, &mut headers);
    filter_request_cookies(&mut headers, root_passthrough, proxy_passthrough);
    if let Ok(hv) = HeaderValue::from_str(target_host) {
        headers.insert(http::header::HOST, hv);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn strips_all_leak_headers() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        h.insert("cf-ray", HeaderValue::from_static("abc"));
        h.insert("cf-access-client-id", HeaderValue::from_static("x"));
        h.insert("x-cf-something", HeaderValue::from_static("y"));
        h.insert("via", HeaderValue::from_static("1.1 proxy"));
        h.insert("accept", HeaderValue::from_static("*/*"));
        strip_leak_headers(&mut h);
        assert!(h.get("x-forwarded-for").is_none());
        assert!(h.get("cf-ray").is_none());
        assert!(h.get("cf-access-client-id").is_none());
        assert!(h.get("x-cf-something").is_none());
        assert!(h.get("via").is_none());
        assert!(h.get("accept").is_some());
    }

    #[test]
    fn referer_pointing_to_proxy_rewritten_to_origin() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::REFERER,
            HeaderValue::from_static("https://x.com.p.example/page?a=1"),
        );
        rewrite_referer_and_origin(&suffix(), &mut h);
        assert_eq!(
            h.get(http::header::REFERER).unwrap().to_str().unwrap(),
            "https://x.com/page?a=1"
        );
    }

    #[test]
    fn unparseable_referer_deleted() {
        let mut h = HeaderMap::new();
        h.insert(http::header::REFERER, HeaderValue::from_static("not a url"));
        rewrite_referer_and_origin(&suffix(), &mut h);
        assert!(h.get(http::header::REFERER).is_none());
    }

    #[test]
    fn off_proxy_referer_untouched() {
        let mut h = HeaderMap::new();
        h.insert(http::header::REFERER, HeaderValue::from_static("https://unrelated.com/"));
        rewrite_referer_and_origin(&suffix(), &mut h);
        assert_eq!(
            h.get(http::header::REFERER).unwrap().to_str().unwrap(),
            "https://unrelated.com/"
        );
    }
}
