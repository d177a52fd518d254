//! C3: Header Rewriter. Applied to upstream response headers before body
//! handling: sanitize fingerprinting/negotiation headers, harden
//! `Set-Cookie`, rewrite `Location`/`Link`, relax CSP, adjust CORS, and set
//! the always-on `X-Robots-Tag`.

use http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use veilproxy_url::{proxify, Suffix};

/// Headers dropped outright from every response before anything else runs.
const SANITIZE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "referrer-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "permissions-policy",
    "report-to",
    "nel",
    "alt-svc",
    "refresh",
    "sourcemap",
    "x-sourcemap",
    "x-dns-prefetch-control",
    "clear-site-data",
    "accept-ch",
];

/// CSP directives that get the proxy-relaxing tokens appended (or created).
const CSP_RELAX_DIRECTIVES: &[(&str, &str)] = &[
    ("script-src", "'unsafe-inline' 'unsafe-eval' * data:"),
    ("style-src", "'unsafe-inline' * data:"),
    ("connect-src", "* data:"),
    ("img-src", "* data:"),
];

pub fn sanitize(headers: &mut HeaderMap) {
    for name in SANITIZE_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite every `Set-Cookie` value: keep `name=value`, drop any prior
/// `Domain`/`Secure`/`SameSite` attributes, append `Domain={root_domain}`
/// unless the cookie name starts with `__Host-`, and always append
/// `Secure; SameSite=Lax`.
pub fn rewrite_set_cookie(suffix: &Suffix, headers: &mut HeaderMap) {
    let values: Vec<HeaderValue> = headers
        .get_all(http::header::SET_COOKIE)
        .iter()
        .cloned()
        .collect();
    if values.is_empty() {
        return;
    }
    headers.remove(http::header::SET_COOKIE);
    for value in values {
        let Ok(raw) = value.to_str() else { continue };
        let rewritten = rewrite_one_set_cookie(suffix, raw);
        if let Ok(hv) = HeaderValue::from_str(&rewritten) {
            headers.append(http::header::SET_COOKIE, hv);
        }
    }
}

fn rewrite_one_set_cookie(suffix: &Suffix, raw: &str) -> String {
    let mut parts = raw.split(';');
    let name_value = parts.next().unwrap_or("").trim();
    let cookie_name = name_value.split('=').next().unwrap_or("").trim();

    let mut kept_attrs: Vec<String> = Vec::new();
    for attr in parts {
        let attr = attr.trim();
        let lower = attr.to_ascii_lowercase();
        if lower.starts_with("domain=") || lower == "secure" || lower.starts_with("samesite=") {
            continue;
        }
        if !attr.is_empty() {
            kept_attrs.push(attr.to_string());
        }
    }

    let mut out = name_value.to_string();
    for attr in kept_attrs {
        out.push_str("; ");
        out.push_str(&attr);
    }
    if !cookie_name.starts_with("__Host-") {
        out.push_str("; Domain=");
        out.push_str(suffix.root_domain());
    }
    out.push_str("; Secure; SameSite=Lax");
    out
}

/// Filter the request `Cookie` header, dropping names matched by either
/// glob list. Deletes the header entirely if filtering empties it (never
/// emits an empty `Cookie:` header).
pub fn filter_request_cookies(
    headers: &mut HeaderMap,
    root_passthrough: &[wildmatch::WildMatch],
    proxy_passthrough: &[wildmatch::WildMatch],
) {
    let Some(value) = headers.get(http::header::COOKIE).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else {
        headers.remove(http::header::COOKIE);
        return;
    };

    let kept: Vec<&str> = raw
        .split(';')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let name = p.split('=').next().unwrap_or("");
            !root_passthrough.iter().any(|g| g.matches(name))
                && !proxy_passthrough.iter().any(|g| g.matches(name))
        })
        .collect();

    if kept.is_empty() {
        headers.remove(http::header::COOKIE);
    } else if let Ok(hv) = HeaderValue::from_str(&kept.join("; ")) {
        headers.insert(http::header::COOKIE, hv);
    }
}

/// Rewrite `Location` against `target_url`, producing a ProxyURL.
pub fn rewrite_location(suffix: &Suffix, target_url: &Url, headers: &mut HeaderMap) {
    let Some(value) = headers.get(http::header::LOCATION).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else { return };
    let rewritten = proxify(suffix, target_url, raw);
    if let Ok(hv) = HeaderValue::from_str(&rewritten) {
        headers.insert(http::header::LOCATION, hv);
    }
}

/// Rewrite the `Link` header: drop entries whose `rel` includes
/// `preconnect`/`dns-prefetch`, rewrite the `<url>` form and any
/// `imagesrcset="…"` within surviving entries.
pub fn rewrite_link(suffix: &Suffix, target_url: &Url, headers: &mut HeaderMap) {
    let Some(value) = headers.get(http::header::LINK).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else { return };

    let rewritten: Vec<String> = raw
        .split(',')
        .filter_map(|entry| rewrite_link_entry(suffix, target_url, entry))
        .collect();

    if rewritten.is_empty() {
        headers.remove(http::header::LINK);
    } else if let Ok(hv) = HeaderValue::from_str(&rewritten.join(", ")) {
        headers.insert(http::header::LINK, hv);
    }
}

fn rewrite_link_entry(suffix: &Suffix, target_url: &Url, entry: &str) -> Option<String> {
    let entry = entry.trim();
    let lower = entry.to_ascii_lowercase();
    if lower.contains("rel=\"preconnect\"")
        || lower.contains("rel=preconnect")
        || lower.contains("rel=\"dns-prefetch\"")
        || lower.contains("rel=dns-prefetch")
    {
        return None;
    }

    let start = entry.find('<')?;
    let end = entry[start..].find('>').map(|i| i + start)?;
    let url = &entry[start + 1..end];
    let rewritten_url = proxify(suffix, target_url, url);
    let mut out = format!("<{rewritten_url}>");
    out.push_str(&entry[end + 1..]);

    if let Some(srcset_idx) = out.to_ascii_lowercase().find("imagesrcset=\"") {
        let value_start = srcset_idx + "imagesrcset=\"".len();
        if let Some(rel_end) = out[value_start..].find('"') {
            let srcset_val = &out[value_start..value_start + rel_end];
            let rewritten_srcset = crate::html::rewrite_srcset_value(suffix, target_url, srcset_val);
            out = format!(
                "{}{}{}",
                &out[..value_start],
                rewritten_srcset,
                &out[value_start + rel_end..]
            );
        }
    }
    Some(out)
}

/// Remove `upgrade-insecure-requests` and append the proxy-relaxing tokens
/// to script/style/connect/img source lists (creating the directive if
/// absent).
pub fn relax_csp(headers: &mut HeaderMap) {
    let Some(value) = headers.get(http::header::CONTENT_SECURITY_POLICY).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else { return };

    let mut directives: Vec<String> = raw
        .split(';')
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .filter(|d| !d.eq_ignore_ascii_case("upgrade-insecure-requests"))
        .map(|d| d.to_string())
        .collect();

    for (name, tokens) in CSP_RELAX_DIRECTIVES {
        if let Some(existing) = directives
            .iter_mut()
            .find(|d| d.to_ascii_lowercase().starts_with(&format!("{name} ")) || d.eq_ignore_ascii_case(name))
        {
            if !existing.contains(tokens) {
                existing.push(' ');
                existing.push_str(tokens);
            }
        } else {
            directives.push(format!("{name} {tokens}"));
        }
    }

    let joined = directives.join("; ");
    if let Ok(hv) = HeaderValue::from_str(&joined) {
        headers.insert(http::header::CONTENT_SECURITY_POLICY, hv);
    }
}

/// When `Access-Control-Allow-Origin` names a concrete origin that is a
/// suffix of the target hostname, rewrite that origin's hostname to
/// `{origin_host}.{root_domain}`.
pub fn rewrite_cors(suffix: &Suffix, target_host: &str, headers: &mut HeaderMap) {
    let Some(value) = headers.get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN).cloned() else {
        return;
    };
    let Ok(raw) = value.to_str() else { return };
    if raw == "*" {
        return;
    }
    let Ok(origin_url) = Url::parse(raw) else { return };
    let Some(origin_host) = origin_url.host_str() else {
        return;
    };
    if !target_host.ends_with(origin_host) {
        return;
    }
    let new_host = format!("{origin_host}.{}", suffix.root_domain());
    let rewritten = format!("{}://{new_host}", origin_url.scheme());
    if let Ok(hv) = HeaderValue::from_str(&rewritten) {
        headers.insert(http::header::ACCESS_CONTROL_ALLOW_ORIGIN, hv);
    }
}

pub fn set_robots_tag(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-robots-tag"),
        HeaderValue::from_static("noindex, nofollow"),
    );
}

pub fn set_cache_hit(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-proxy-cache"),
        HeaderValue::from_static("HIT"),
    );
}

/// Status-code shortcut (spec 4.3): for 204/304/3xx, only sanitize +
/// Location rewrite run; no body transformation follows.
pub fn is_status_shortcut(status: u16) -> bool {
    status == 204 || status == 304 || (300..400).contains(&status)
}

/// Full header rewrite pipeline for a non-shortcut response.
pub fn rewrite_response_headers(suffix: &Suffix, target_url: &Url, headers: &mut HeaderMap) {
    sanitize(headers);
    rewrite_set_cookie(suffix, headers);
    rewrite_location(suffix, target_url, headers);
    rewrite_link(suffix, target_url, headers);
    relax_csp(headers);
    rewrite_cors(suffix, target_url.host_str().unwrap_or_default(), headers);
    set_robots_tag(headers);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn hardens_set_cookie() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::SET_COOKIE,
            HeaderValue::from_static("sid=abc; Domain=.x.com; Secure; SameSite=None"),
        );
        rewrite_set_cookie(&suffix(), &mut h);
        let out = h.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert_eq!(out, "sid=abc; Domain=p.example; Secure; SameSite=Lax");
    }

    #[test]
    fn host_prefixed_cookie_has_no_domain_attr() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::SET_COOKIE,
            HeaderValue::from_static("__Host-session=abc; Path=/"),
        );
        rewrite_set_cookie(&suffix(), &mut h);
        let out = h.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert_eq!(out, "__Host-session=abc; Path=/; Secure; SameSite=Lax");
    }

    #[test]
    fn cookie_filtering_deletes_header_when_empty() {
        let mut h = HeaderMap::new();
        h.insert(http::header::COOKIE, HeaderValue::from_static("_ga=1; _gid=2"));
        let root = vec![wildmatch::WildMatch::new("_g*")];
        filter_request_cookies(&mut h, &root, &[]);
        assert!(h.get(http::header::COOKIE).is_none());
    }

    #[test]
    fn link_header_drops_preconnect() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::LINK,
            HeaderValue::from_static("<https://fonts.gstatic.com>; rel=preconnect, </style.css>; rel=stylesheet"),
        );
        let target = Url::parse("https://x.com.p.example/").unwrap();
        rewrite_link(&suffix(), &target, &mut h);
        let out = h.get(http::header::LINK).unwrap().to_str().unwrap();
        assert!(!out.contains("preconnect"));
        assert!(out.contains("x.com.p.example/style.css"));
    }

    #[test]
    fn location_rewritten_to_proxy_url() {
        let mut h = HeaderMap::new();
        h.insert(http::header::LOCATION, HeaderValue::from_static("https://x.com/login"));
        let target = Url::parse("https://x.com.p.example/api").unwrap();
        rewrite_location(&suffix(), &target, &mut h);
        assert_eq!(
            h.get(http::header::LOCATION).unwrap().to_str().unwrap(),
            "https://x.com.p.example/login"
        );
    }

    #[test]
    fn status_shortcut_covers_3xx_and_204_304() {
        assert!(is_status_shortcut(204));
        assert!(is_status_shortcut(304));
        assert!(is_status_shortcut(301));
        assert!(is_status_shortcut(399));
        assert!(!is_status_shortcut(200));
        assert!(!is_status_shortcut(404));
    }

    #[test]
    fn csp_relax_is_fixed_point() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'; upgrade-insecure-requests"),
        );
        relax_csp(&mut h);
        let once = h.get(http::header::CONTENT_SECURITY_POLICY).unwrap().to_str().unwrap().to_string();
        relax_csp(&mut h);
        let twice = h.get(http::header::CONTENT_SECURITY_POLICY).unwrap().to_str().unwrap();
        assert_eq!(once, twice);
        assert!(!twice.contains("upgrade-insecure-requests"));
    }
}
