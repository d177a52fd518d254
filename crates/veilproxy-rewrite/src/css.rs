//! C5: CSS parser. Walks the CSS token stream with `cssparser` and rewrites
//! every URL reference — `@import`, `image-set(...)`, and the general
//! `url(...)` form — so it routes through the proxy. `data:` targets are
//! left untouched. Operates on a fully buffered string (see the 16 MiB body
//! cap enforced by the caller).

use cssparser::{Parser, ParserInput, Token};
use url::Url;

use veilproxy_url::{proxify, Suffix};

/// Strip `/*# sourceMappingURL=... */` comments (and the legacy `//#` form,
/// which does not appear in valid CSS but shows up in minified bundles that
/// concatenate JS and CSS tooling output) before tokenizing.
fn strip_source_mapping_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    loop {
        match rest.find("/*# sourceMappingURL=") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("*/") {
                    Some(end_rel) => rest = &rest[start + end_rel + 2..],
                    None => {
                        rest = "";
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Rewrite a complete stylesheet, a `<style>` body, or an inline `style="…"`
/// attribute value. `base` is the document URL used to resolve relative
/// references inside `url(...)`.
pub fn rewrite_css(suffix: &Suffix, base: &Url, css: &str) -> String {
    let cleaned = strip_source_mapping_comments(css);
    let mut input = ParserInput::new(&cleaned);
    let mut parser = Parser::new(&mut input);
    let mut out = String::with_capacity(cleaned.len());
    rewrite_token_stream(&mut parser, suffix, base, &mut out);
    out
}

fn rewrite_token_stream(parser: &mut Parser<'_, '_>, suffix: &Suffix, base: &Url, out: &mut String) {
    let mut in_import = false;

    loop {
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(t) => t.clone(),
            Err(_) => break,
        };

        match token {
            Token::UnquotedUrl(ref url_val) => {
                let rewritten = rewrite_url_value(suffix, base, url_val.as_ref());
                out.push_str(&format!("url({})", quote_css_url(&rewritten)));
            }
            Token::Function(ref name)
                if name.eq_ignore_ascii_case("url") || name.eq_ignore_ascii_case("image-set") =>
            {
                out.push_str(name.as_ref());
                out.push('(');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_function_args(inner, suffix, base, out);
                    Ok(())
                });
                out.push(')');
            }
            Token::AtKeyword(ref kw) if kw.eq_ignore_ascii_case("import") => {
                out.push_str("@import ");
                in_import = true;
            }
            Token::AtKeyword(ref kw) => {
                out.push('@');
                out.push_str(kw.as_ref());
            }
            Token::QuotedString(ref s) => {
                let s_str: &str = s.as_ref();
                if in_import {
                    let rewritten = rewrite_url_value(suffix, base, s_str);
                    out.push_str(&format!("\"{}\"", escape_css_string(&rewritten)));
                    in_import = false;
                } else {
                    out.push_str(&format!("\"{}\"", escape_css_string(s_str)));
                }
            }
            Token::CurlyBracketBlock => {
                out.push('{');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_token_stream(inner, suffix, base, out);
                    Ok(())
                });
                out.push('}');
            }
            Token::ParenthesisBlock => {
                out.push('(');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_token_stream(inner, suffix, base, out);
                    Ok(())
                });
                out.push(')');
            }
            Token::SquareBracketBlock => {
                out.push('[');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_token_stream(inner, suffix, base, out);
                    Ok(())
                });
                out.push(']');
            }
            Token::Function(ref name) => {
                out.push_str(name.as_ref());
                out.push('(');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_token_stream(inner, suffix, base, out);
                    Ok(())
                });
                out.push(')');
            }
            Token::Ident(ref v) => out.push_str(v.as_ref()),
            Token::Hash(ref v) | Token::IDHash(ref v) => {
                out.push('#');
                out.push_str(v.as_ref());
            }
            Token::Number { value, .. } => out.push_str(&format_number(value)),
            Token::Percentage { unit_value, .. } => {
                out.push_str(&format_number(unit_value * 100.0));
                out.push('%');
            }
            Token::Dimension { value, ref unit, .. } => {
                out.push_str(&format_number(value));
                out.push_str(unit.as_ref());
            }
            Token::WhiteSpace(_) => out.push(' '),
            Token::Colon => out.push(':'),
            Token::Semicolon => {
                in_import = false;
                out.push(';');
            }
            Token::Comma => out.push(','),
            Token::Delim(c) => out.push(c),
            Token::IncludeMatch => out.push_str("~="),
            Token::DashMatch => out.push_str("|="),
            Token::PrefixMatch => out.push_str("^="),
            Token::SuffixMatch => out.push_str("$="),
            Token::SubstringMatch => out.push_str("*="),
            Token::CDO => out.push_str("<!--"),
            Token::CDC => out.push_str("-->"),
            Token::Comment(ref c) => {
                out.push_str("/*");
                out.push_str(c.as_ref());
                out.push_str("*/");
            }
            Token::BadString(ref s) => out.push_str(s.as_ref()),
            Token::BadUrl(ref s) => {
                out.push_str("url(");
                out.push_str(s.as_ref());
                out.push(')');
            }
            Token::CloseParenthesis => out.push(')'),
            Token::CloseSquareBracket => out.push(']'),
            Token::CloseCurlyBracket => out.push('}'),
            _ => {}
        }
    }
}

fn rewrite_function_args(parser: &mut Parser<'_, '_>, suffix: &Suffix, base: &Url, out: &mut String) {
    loop {
        let tok = match parser.next_including_whitespace_and_comments() {
            Ok(t) => t.clone(),
            Err(_) => break,
        };
        match tok {
            Token::QuotedString(ref s) => {
                let rewritten = rewrite_url_value(suffix, base, s.as_ref());
                out.push_str(&format!("\"{}\"", escape_css_string(&rewritten)));
            }
            Token::UnquotedUrl(ref s) => {
                let rewritten = rewrite_url_value(suffix, base, s.as_ref());
                out.push_str(&quote_css_url(&rewritten));
            }
            Token::Function(ref name) if name.eq_ignore_ascii_case("url") => {
                out.push_str("url(");
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<'_, ()>> {
                    rewrite_function_args(inner, suffix, base, out);
                    Ok(())
                });
                out.push(')');
            }
            Token::WhiteSpace(_) => out.push(' '),
            Token::Comma => out.push(','),
            Token::Number { value, .. } => out.push_str(&format_number(value)),
            Token::Dimension { value, ref unit, .. } => {
                out.push_str(&format_number(value));
                out.push_str(unit.as_ref());
            }
            Token::Ident(ref v) => out.push_str(v.as_ref()),
            Token::Delim(c) => out.push(c),
            _ => {}
        }
    }
}

fn rewrite_url_value(suffix: &Suffix, base: &Url, raw: &str) -> String {
    if raw.trim_start().to_ascii_lowercase().starts_with("data:") {
        return raw.to_string();
    }
    proxify(suffix, base, raw)
}

fn quote_css_url(url: &str) -> String {
    format!("\"{}\"", escape_css_string(url))
}

fn escape_css_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\a ")
}

fn format_number(v: f32) -> String {
    if v == (v as i64) as f32 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffix() -> Suffix {
        Suffix::new("p.example")
    }

    #[test]
    fn rewrites_url_function_and_import() {
        let base = Url::parse("https://foo.com.p.example/style.css").unwrap();
        let css = r#"a{background:url("https://cdn.foo.com/a.png")} @import "https://foo.com/b.css";"#;
        let out = rewrite_css(&suffix(), &base, css);
        assert!(out.contains("https://cdn.foo.com.p.example/a.png"));
        assert!(out.contains("https://foo.com.p.example/b.css"));
    }

    #[test]
    fn preserves_data_urls() {
        let base = Url::parse("https://foo.com.p.example/s.css").unwrap();
        let css = "body { background: url(data:image/png;base64,abc); }";
        let out = rewrite_css(&suffix(), &base, css);
        assert!(out.contains("data:image/png;base64,abc"));
    }

    #[test]
    fn strips_source_mapping_comment() {
        let base = Url::parse("https://foo.com.p.example/s.css").unwrap();
        let css = "body{color:red}\n/*# sourceMappingURL=s.css.map */";
        let out = rewrite_css(&suffix(), &base, css);
        assert!(!out.contains("sourceMappingURL"));
    }

    #[test]
    fn idempotent_on_rewrite() {
        let base = Url::parse("https://foo.com.p.example/s.css").unwrap();
        let css = r#"a{background:url("https://cdn.foo.com/a.png")}"#;
        let once = rewrite_css(&suffix(), &base, css);
        let twice = rewrite_css(&suffix(), &base, &once);
        assert_eq!(once, twice);
    }
}
