//! C6: HTML Streamer. Rewrites an HTML document on the fly with `lol_html`
//! rather than buffering a full DOM, per design note 9 ("favor an existing
//! streaming rewriter over a DOM builder; do not buffer the document").

use std::cell::Cell;
use std::rc::Rc;
use std::sync::OnceLock;

use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use regex::Regex;
use url::Url;

use veilproxy_url::{proxify, Suffix};

use crate::mods::{CompiledMod, UNSAFE_TEXT_ANCESTORS};

/// Attribute name -> element selectors carrying it, for the generic
/// URL-bearing attribute rewrite pass (spec 4.6).
const ATTR_SELECTORS: &[(&str, &[&str])] = &[
    ("href", &["a", "link", "area", "base", "image"]),
    ("ping", &["a"]),
    (
        "src",
        &["img", "script", "iframe", "audio", "video", "source", "track", "embed", "input", "frame"],
    ),
    ("action", &["form"]),
    ("formaction", &["button", "input"]),
    ("data", &["object"]),
    ("manifest", &["html"]),
    ("background", &["body"]),
    ("poster", &["video"]),
    ("codebase", &["object", "applet"]),
    ("archive", &["object", "applet"]),
    ("longdesc", &["frame", "iframe", "img"]),
    ("cite", &["blockquote", "q", "del", "ins"]),
];

/// SVG presentation attributes that carry URLs (`url(#id)` references and
/// plain hrefs), scoped to any descendant of an `<svg>` root.
const SVG_URL_ATTRS: &[&str] = &["fill", "stroke", "filter", "mask", "clip-path", "href", "xlink:href"];

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with('/')
}

fn javascript_location_assignment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"location\s*=\s*(['"])https?://[^'"]*\1"#).unwrap())
}

/// Neutralize a `javascript:` URI so it can no longer navigate the real
/// (un-proxied) top-level context: any `location = "http…"` assignment
/// becomes `location='#'`. The rest of the URI body is left untouched.
fn neutralize_javascript_uri(value: &str) -> String {
    javascript_location_assignment()
        .replace_all(value, "location='#'")
        .into_owned()
}

/// Rewrite a single URL-bearing attribute value: `data:` passes through
/// untouched, `javascript:` is neutralized rather than proxified (it isn't
/// an absolute URL, and `proxify` would otherwise pass it through verbatim,
/// leaving any embedded navigation live), everything else is proxified.
fn rewrite_attr_url(suffix: &Suffix, base: &Url, value: &str) -> String {
    let lower = value.trim().to_ascii_lowercase();
    if lower.starts_with("data:") {
        return value.to_string();
    }
    if lower.starts_with("javascript:") {
        return neutralize_javascript_uri(value);
    }
    proxify(suffix, base, value)
}

/// Rewrite every value in a `srcset` attribute: each comma-separated entry
/// is `url descriptor?`; only the URL component is proxified.
pub fn rewrite_srcset_value(suffix: &Suffix, base: &Url, value: &str) -> String {
    value
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return String::new();
            }
            let mut parts = entry.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or("");
            let descriptor = parts.next();
            let rewritten = proxify(suffix, base, url);
            match descriptor {
                Some(d) => format!("{rewritten} {d}"),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn rewrite_meta_refresh(suffix: &Suffix, base: &Url, content: &str) -> Option<String> {
    let (delay, rest) = content.split_once(';')?;
    let url_part = rest.trim();
    let lower = url_part.to_ascii_lowercase();
    if !lower.starts_with("url=") {
        return None;
    }
    let raw_url = &url_part[4..];
    let unquoted = raw_url.trim_matches(|c| c == '\'' || c == '"');
    let rewritten = proxify(suffix, base, unquoted);
    Some(format!("{delay};url={rewritten}"))
}

/// Prepended, in order, into the first `<head>` encountered: the client
/// config bootstrap followed by the interceptor script. `async` (not
/// `defer`) matches scenario S1's literal expectation.
fn head_injection(suffix: &Suffix) -> String {
    format!(
        r#"<script>self.__CFG__={{rootDomain:'{}'}}</script><script src="/__divortio_interceptor.js" async></script>"#,
        suffix.root_domain()
    )
}

/// Stream-rewrite an HTML document. `base` is the resolved target URL of the
/// page (used to resolve relative URLs during proxification). `mods` are
/// the enabled, domain-matching Mods bound for this request (spec 4.6's mod
/// binding step: one `text!` handler per mod, bound to its own selector).
pub fn rewrite_html(
    suffix: &Suffix,
    base: &Url,
    input: &[u8],
    mods: &[CompiledMod],
) -> Result<Vec<u8>, lol_html::errors::RewritingError> {
    let mut output = Vec::with_capacity(input.len() + 4096);

    let suffix_owned = suffix.clone();
    let base_owned = base.clone();

    let head_injector = {
        let injection = head_injection(&suffix_owned);
        element!("head", move |el| {
            el.prepend(&injection, ContentType::Html);
            Ok(())
        })
    };

    let mut attr_handlers = Vec::new();
    for (attr, selectors) in ATTR_SELECTORS {
        for selector in *selectors {
            let suffix_owned = suffix_owned.clone();
            let base_owned = base_owned.clone();
            let attr_name = attr.to_string();
            let handler = element!(format!("{selector}[{attr}]"), move |el| {
                if let Some(value) = el.get_attribute(&attr_name) {
                    let rewritten = rewrite_attr_url(&suffix_owned, &base_owned, &value);
                    el.set_attribute(&attr_name, &rewritten).ok();
                }
                Ok(())
            });
            attr_handlers.push(handler);
        }
    }

    let mut svg_handlers = Vec::new();
    for attr in SVG_URL_ATTRS {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        let attr_name = attr.to_string();
        let handler = element!(format!("svg *[{attr}]"), move |el| {
            if let Some(value) = el.get_attribute(&attr_name) {
                let rewritten = rewrite_attr_url(&suffix_owned, &base_owned, &value);
                el.set_attribute(&attr_name, &rewritten).ok();
            }
            Ok(())
        });
        svg_handlers.push(handler);
    }

    // Proxied scripts/styles no longer match the upstream's subresource
    // integrity hash once rewritten, so the attribute must go rather than
    // cause the browser to reject the fetch.
    let integrity_handler = element!("*[integrity]", move |el| {
        el.remove_attribute("integrity");
        Ok(())
    });

    let srcset_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        element!("img[srcset], source[srcset]", move |el| {
            if let Some(value) = el.get_attribute("srcset") {
                let rewritten = rewrite_srcset_value(&suffix_owned, &base_owned, &value);
                el.set_attribute("srcset", &rewritten).ok();
            }
            Ok(())
        })
    };

    let style_attr_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        element!("*[style]", move |el| {
            if let Some(value) = el.get_attribute("style") {
                let rewritten = crate::css::rewrite_css(&suffix_owned, &base_owned, &value);
                el.set_attribute("style", &rewritten).ok();
            }
            Ok(())
        })
    };

    let style_tag_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        text!("style", move |t| {
            let rewritten = crate::css::rewrite_css(&suffix_owned, &base_owned, t.as_str());
            t.replace(&rewritten, ContentType::Text);
            Ok(())
        })
    };

    let meta_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        element!("meta", move |el| {
            let is_refresh = el
                .get_attribute("http-equiv")
                .map(|v| v.eq_ignore_ascii_case("refresh"))
                .unwrap_or(false);
            if is_refresh {
                if let Some(content) = el.get_attribute("content") {
                    if let Some(rewritten) = rewrite_meta_refresh(&suffix_owned, &base_owned, &content) {
                        el.set_attribute("content", &rewritten).ok();
                    }
                }
                return Ok(());
            }
            let is_og_or_twitter = el
                .get_attribute("property")
                .map(|p| p.starts_with("og:"))
                .unwrap_or(false)
                || el
                    .get_attribute("name")
                    .map(|n| n.starts_with("twitter:"))
                    .unwrap_or(false);
            if is_og_or_twitter {
                if let Some(content) = el.get_attribute("content") {
                    if looks_like_url(&content) {
                        let rewritten = proxify(&suffix_owned, &base_owned, &content);
                        el.set_attribute("content", &rewritten).ok();
                    }
                }
            }
            Ok(())
        })
    };

    let import_map_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        text!(r#"script[type="importmap"]"#, move |t| {
            let rewritten = crate::json::rewrite_import_map_str(&suffix_owned, &base_owned, t.as_str());
            t.replace(&rewritten, ContentType::Text);
            Ok(())
        })
    };

    let speculation_rules_handler = {
        let suffix_owned = suffix_owned.clone();
        let base_owned = base_owned.clone();
        text!(r#"script[type="speculationrules"]"#, move |t| {
            let rewritten = crate::json::rewrite_json_str(&suffix_owned, &base_owned, t.as_str());
            t.replace(&rewritten, ContentType::Text);
            Ok(())
        })
    };

    // Ancestor guard for mod text rewriting: a shared counter per unsafe
    // ancestor tag group and one for `<script>`, incremented on entry and
    // decremented on the matching end tag, read by every mod's text handler
    // bound further down the tree.
    let unsafe_depth = Rc::new(Cell::new(0u32));
    let script_depth = Rc::new(Cell::new(0u32));

    let unsafe_ancestor_tracker = {
        let unsafe_depth = unsafe_depth.clone();
        element!(UNSAFE_TEXT_ANCESTORS.join(", "), move |el| {
            unsafe_depth.set(unsafe_depth.get() + 1);
            let unsafe_depth = unsafe_depth.clone();
            if let Some(handlers) = el.end_tag_handlers() {
                handlers.push(Box::new(move |_end| {
                    unsafe_depth.set(unsafe_depth.get().saturating_sub(1));
                    Ok(())
                }));
            }
            Ok(())
        })
    };

    let script_ancestor_tracker = {
        let script_depth = script_depth.clone();
        element!("script", move |el| {
            script_depth.set(script_depth.get() + 1);
            let script_depth = script_depth.clone();
            if let Some(handlers) = el.end_tag_handlers() {
                handlers.push(Box::new(move |_end| {
                    script_depth.set(script_depth.get().saturating_sub(1));
                    Ok(())
                }));
            }
            Ok(())
        })
    };

    let mut mod_handlers = Vec::new();
    for compiled_mod in mods {
        let compiled_mod = compiled_mod.clone();
        let unsafe_depth = unsafe_depth.clone();
        let script_depth = script_depth.clone();
        let handler = text!(compiled_mod.selector.clone(), move |t| {
            if unsafe_depth.get() > 0 {
                return Ok(());
            }
            let in_script = script_depth.get() > 0;
            let rewritten = compiled_mod.rule.apply(t.as_str(), in_script);
            t.replace(&rewritten, ContentType::Text);
            Ok(())
        });
        mod_handlers.push(handler);
    }

    let mut handlers = vec![
        head_injector,
        unsafe_ancestor_tracker,
        script_ancestor_tracker,
        srcset_handler,
        style_attr_handler,
        meta_handler,
        style_tag_handler,
        import_map_handler,
        speculation_rules_handler,
        integrity_handler,
    ];
    handlers.extend(attr_handlers);
    handlers.extend(svg_handlers);
    handlers.extend(mod_handlers);

    let mut settings = Settings::default();
    settings.element_content_handlers = handlers;

    let mut rewriter = HtmlRewriter::new(settings, |c: &[u8]| output.extend_from_slice(c));
    rewriter.write(input)?;
    rewriter.end()?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{Mod, TextRule};

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn rewrite_srcset_handles_descriptors() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let out = rewrite_srcset_value(
            &suffix(),
            &base,
            "https://x.com/a.png 1x, https://x.com/b.png 2x",
        );
        assert!(out.contains("x.com.p.example/a.png 1x"));
        assert!(out.contains("x.com.p.example/b.png 2x"));
    }

    #[test]
    fn rewrite_srcset_handles_bare_urls() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let out = rewrite_srcset_value(&suffix(), &base, "https://x.com/a.png");
        assert_eq!(out, "https://x.com.p.example/a.png");
    }

    #[test]
    fn meta_refresh_rewritten() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let out = rewrite_meta_refresh(&suffix(), &base, "5;url=https://x.com/next").unwrap();
        assert_eq!(out, "5;url=https://x.com.p.example/next");
    }

    #[test]
    fn javascript_uri_location_assignment_neutralized() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let out = rewrite_attr_url(&suffix(), &base, "javascript:location='https://evil.com'");
        assert_eq!(out, "javascript:location='#'");
    }

    #[test]
    fn javascript_uri_without_navigation_untouched() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let out = rewrite_attr_url(&suffix(), &base, "javascript:void(0)");
        assert_eq!(out, "javascript:void(0)");
    }

    #[test]
    fn rewrite_html_injects_interceptor_and_rewrites_href() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let input = b"<html><head></head><body><a href=\"https://x.com/page\">go</a></body></html>";
        let out = rewrite_html(&suffix(), &base, input, &[]).unwrap();
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains(r#"<script src="/__divortio_interceptor.js" async></script>"#));
        assert!(out_str.contains("self.__CFG__={rootDomain:'p.example'}"));
        assert!(out_str.contains("x.com.p.example/page"));
    }

    #[test]
    fn rewrite_html_applies_active_mod_to_matching_selector() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let input = b"<html><head></head><body><p>hello ads world</p></body></html>";
        let compiled: Vec<CompiledMod> = vec![Mod::new(
            "demo",
            "p",
            "*",
            TextRule::Single { pattern: "ads".into(), replacement: "X".into() },
        )]
        .iter()
        .filter_map(Mod::compile)
        .collect();
        let out = rewrite_html(&suffix(), &base, input, &compiled).unwrap();
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains("hello X world"));
    }

    #[test]
    fn rewrite_html_skips_mod_text_inside_unsafe_ancestor() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let input = b"<html><head></head><body><pre>keep ads here</pre></body></html>";
        let compiled: Vec<CompiledMod> = vec![Mod::new(
            "demo",
            "pre",
            "*",
            TextRule::Single { pattern: "ads".into(), replacement: "X".into() },
        )]
        .iter()
        .filter_map(Mod::compile)
        .collect();
        let out = rewrite_html(&suffix(), &base, input, &compiled).unwrap();
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains("keep ads here"));
    }

    #[test]
    fn rewrite_html_rewrites_import_map_scopes_keys() {
        let base = Url::parse("https://x.com.p.example/").unwrap();
        let input = br#"<html><head><script type="importmap">{"imports":{"a":"https://x.com/a.js"},"scopes":{"https://x.com/vendor/":{"b":"https://x.com/b.js"}}}</script></head><body></body></html>"#;
        let out = rewrite_html(&suffix(), &base, input, &[]).unwrap();
        let out_str = String::from_utf8(out).unwrap();
        assert!(out_str.contains(r#""https://x.com.p.example/vendor/""#));
    }
}
