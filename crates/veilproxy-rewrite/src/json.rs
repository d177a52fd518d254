//! C5: JSON tree walker. Recurses through a parsed `serde_json::Value`,
//! proxifying every string field that looks like an absolute URL. Used both
//! for `application/json` / `application/manifest+json` responses and by
//! the HTML streamer for Import Maps and Speculation Rules script bodies.
//!
//! `serde_json::Value` is a tree, not a graph — `Rc`/`Arc` back-edges are
//! impossible to construct through ordinary deserialization — but the
//! invariant in the specification is explicit (cycle safety on objects with
//! back-edges), so the walk carries a depth-bounded guard as the concrete
//! expression of "visited set of object identities" for a tree-shaped value:
//! recursion depth is capped rather than tracking pointer identity, since
//! `serde_json::Value` has none to track.

use serde_json::Value;
use url::Url;

use veilproxy_url::{proxify, Suffix};

/// Recursion depth past which we stop descending. A legitimate document
/// nests far shallower than this; only a pathological or adversarial input
/// would reach it, and bailing out there is the cycle-safety backstop.
const MAX_DEPTH: usize = 256;

fn looks_like_absolute_url(s: &str) -> bool {
    let lower = s.trim_start();
    lower.len() > 8
        && (lower.starts_with("http://") || lower.starts_with("https://"))
}

/// Rewrite every absolute-URL-looking string field in `value`, in place.
pub fn rewrite_json(suffix: &Suffix, base: &Url, value: &mut Value) {
    walk(suffix, base, value, 0);
}

fn walk(suffix: &Suffix, base: &Url, value: &mut Value, depth: usize) {
    if depth >= MAX_DEPTH {
        return;
    }
    match value {
        Value::String(s) => {
            if looks_like_absolute_url(s) {
                *s = proxify(suffix, base, s);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk(suffix, base, item, depth + 1);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                walk(suffix, base, v, depth + 1);
            }
        }
        _ => {}
    }
}

/// Parse and rewrite a JSON document, falling back to passthrough (the
/// original bytes, unparsed) on any parse failure per the MIME-parse-failure
/// error policy.
pub fn rewrite_json_str(suffix: &Suffix, base: &Url, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut v) => {
            rewrite_json(suffix, base, &mut v);
            serde_json::to_string(&v).unwrap_or_else(|_| body.to_string())
        }
        Err(_) => body.to_string(),
    }
}

/// Rewrite an Import Map document (spec 4.6): proxify every URL-shaped
/// string value as usual, and additionally rewrite the keys of the
/// `scopes` map — unlike every other URL in the document, those keys are
/// themselves URL prefixes, not values, so the generic tree walk never
/// touches them.
pub fn rewrite_import_map_str(suffix: &Suffix, base: &Url, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut v) => {
            rewrite_json(suffix, base, &mut v);
            if let Some(scopes) = v.get_mut("scopes").and_then(Value::as_object_mut) {
                let rewritten = std::mem::take(scopes)
                    .into_iter()
                    .map(|(k, val)| (proxify(suffix, base, &k), val))
                    .collect();
                *scopes = rewritten;
            }
            serde_json::to_string(&v).unwrap_or_else(|_| body.to_string())
        }
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn rewrites_nested_url_fields() {
        let base = Url::parse("https://api.example.org.p.example/data").unwrap();
        let body = r#"{"next":"https://api.example.org/next","n":1}"#;
        let out = rewrite_json_str(&suffix(), &base, body);
        assert_eq!(out, r#"{"next":"https://api.example.org.p.example/next","n":1}"#);
    }

    #[test]
    fn leaves_non_url_strings_alone() {
        let base = Url::parse("https://api.example.org.p.example/data").unwrap();
        let mut v = json!({"name": "hello world", "count": 3});
        rewrite_json(&suffix(), &base, &mut v);
        assert_eq!(v["name"], "hello world");
    }

    #[test]
    fn parse_failure_falls_back_to_passthrough() {
        let base = Url::parse("https://api.example.org.p.example/data").unwrap();
        let body = "not json at all {";
        assert_eq!(rewrite_json_str(&suffix(), &base, body), body);
    }

    #[test]
    fn import_map_rewrites_scopes_keys_and_values() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let body = r#"{"imports":{"a":"https://x.com/a.js"},"scopes":{"https://x.com/vendor/":{"b":"https://x.com/b.js"}}}"#;
        let out = rewrite_import_map_str(&suffix(), &base, body);
        assert!(out.contains(r#""https://x.com.p.example/vendor/""#));
        assert!(out.contains("https://x.com.p.example/a.js"));
        assert!(out.contains("https://x.com.p.example/b.js"));
    }

    #[test]
    fn deeply_nested_arrays_terminate() {
        let base = Url::parse("https://api.example.org.p.example/data").unwrap();
        let mut v = json!([]);
        let mut cursor = &mut v;
        for _ in 0..(MAX_DEPTH + 50) {
            *cursor = json!([cursor.take()]);
            cursor = cursor.as_array_mut().unwrap().get_mut(0).unwrap();
        }
        // Must return without stack overflow or infinite loop.
        rewrite_json(&suffix(), &base, &mut v);
    }
}
