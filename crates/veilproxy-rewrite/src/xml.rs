//! C5: XML / RSS / Atom / sitemap rewriter. Deliberately conservative
//! regex-targeted rewrites rather than a full XML parse — if a regex fails
//! to match, the original fragment is preserved untouched (per design note
//! 9: "the XML/Link/srcset regex rules are deliberately conservative").

use regex::{Captures, Regex};
use std::sync::OnceLock;
use url::Url;

use veilproxy_url::{proxify, Suffix};

struct XmlPatterns {
    xml_stylesheet: Regex,
    link_text: Regex,
    attr_href: Regex,
    enclosure_url: Regex,
    media_content_url: Regex,
    loc: Regex,
    image_loc: Regex,
}

static PATTERNS: OnceLock<XmlPatterns> = OnceLock::new();

fn patterns() -> &'static XmlPatterns {
    PATTERNS.get_or_init(|| XmlPatterns {
        xml_stylesheet: Regex::new(r#"(<\?xml-stylesheet[^>]*\bhref=")([^"]*)(")"#).unwrap(),
        link_text: Regex::new(r"(<link>)([^<]*)(</link>)").unwrap(),
        attr_href: Regex::new(r#"(<[A-Za-z0-9_:]*link\b[^>]*\bhref=")([^"]*)(")"#).unwrap(),
        enclosure_url: Regex::new(r#"(<enclosure\b[^>]*\burl=")([^"]*)(")"#).unwrap(),
        media_content_url: Regex::new(r#"(<media:content\b[^>]*\burl=")([^"]*)(")"#).unwrap(),
        loc: Regex::new(r"(<loc>)([^<]*)(</loc>)").unwrap(),
        image_loc: Regex::new(r"(<image:loc>)([^<]*)(</image:loc>)").unwrap(),
    })
}

fn rewrite_url_text(suffix: &Suffix, base: &Url, url: &str) -> String {
    let trimmed = url.trim();
    if suffix.is_proxy_host_of(trimmed) {
        return url.to_string();
    }
    proxify(suffix, base, trimmed)
}

/// Extension trait so this module can cheaply probe "already proxied"
/// without a full `Url::parse` on every candidate.
trait AlreadyProxied {
    fn is_proxy_host_of(&self, candidate: &str) -> bool;
}

impl AlreadyProxied for Suffix {
    fn is_proxy_host_of(&self, candidate: &str) -> bool {
        Url::parse(candidate)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.is_proxy_host(h)))
            .unwrap_or(false)
    }
}

fn apply(re: &Regex, input: &str, suffix: &Suffix, base: &Url) -> String {
    re.replace_all(input, |caps: &Captures| {
        let prefix = &caps[1];
        let url = &caps[2];
        let suf = &caps[3];
        format!("{prefix}{}{suf}", rewrite_url_text(suffix, base, url))
    })
    .into_owned()
}

/// Rewrite an XML/RSS/Atom/sitemap document.
pub fn rewrite_xml(suffix: &Suffix, base: &Url, xml: &str) -> String {
    let p = patterns();
    let mut out = xml.to_string();
    out = apply(&p.xml_stylesheet, &out, suffix, base);
    out = apply(&p.link_text, &out, suffix, base);
    out = apply(&p.attr_href, &out, suffix, base);
    out = apply(&p.enclosure_url, &out, suffix, base);
    out = apply(&p.media_content_url, &out, suffix, base);
    out = apply(&p.loc, &out, suffix, base);
    out = apply(&p.image_loc, &out, suffix, base);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn rewrites_loc_and_stylesheet() {
        let base = Url::parse("https://foo.com.p.example/feed.xml").unwrap();
        let xml = concat!(
            r#"<?xml-stylesheet type="text/xsl" href="https://foo.com/feed.xsl"?>"#,
            "<urlset><url><loc>https://foo.com/page</loc></url></urlset>"
        );
        let out = rewrite_xml(&suffix(), &base, xml);
        assert!(out.contains("https://foo.com.p.example/feed.xsl"));
        assert!(out.contains("https://foo.com.p.example/page"));
    }

    #[test]
    fn rewrites_enclosure_and_media_content() {
        let base = Url::parse("https://foo.com.p.example/feed.xml").unwrap();
        let xml = concat!(
            r#"<enclosure url="https://foo.com/ep.mp3" length="123" type="audio/mpeg"/>"#,
            r#"<media:content url="https://foo.com/thumb.jpg"/>"#
        );
        let out = rewrite_xml(&suffix(), &base, xml);
        assert!(out.contains("https://foo.com.p.example/ep.mp3"));
        assert!(out.contains("https://foo.com.p.example/thumb.jpg"));
    }

    #[test]
    fn skips_already_proxied_urls() {
        let base = Url::parse("https://foo.com.p.example/feed.xml").unwrap();
        let xml = "<loc>https://foo.com.p.example/already</loc>";
        let out = rewrite_xml(&suffix(), &base, xml);
        assert_eq!(out, xml);
    }

    #[test]
    fn unmatched_fragment_preserved_untouched() {
        let base = Url::parse("https://foo.com.p.example/feed.xml").unwrap();
        let xml = "<rss><channel><title>Plain text, no links here</title></channel></rss>";
        let out = rewrite_xml(&suffix(), &base, xml);
        assert_eq!(out, xml);
    }
}
