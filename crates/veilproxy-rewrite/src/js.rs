//! C5/C7: JavaScript text-level rewrite. No AST parse — spec 4.7 calls for
//! exactly two textual transforms, not a full parser.

use std::sync::OnceLock;

use regex::Regex;

static SOURCE_MAP_COMMENT: OnceLock<Regex> = OnceLock::new();
static DYNAMIC_IMPORT: OnceLock<Regex> = OnceLock::new();

fn source_map_comment() -> &'static Regex {
    SOURCE_MAP_COMMENT.get_or_init(|| Regex::new(r"(?m)^//# sourceMappingURL=.*$\n?").unwrap())
}

fn dynamic_import() -> &'static Regex {
    DYNAMIC_IMPORT.get_or_init(|| Regex::new(r"\bimport\s*\(").unwrap())
}

/// Strip `//# sourceMappingURL=...` comments and rewrite `import(` call
/// sites to route through the interceptor's dynamic-import shim.
pub fn rewrite_js(body: &str) -> String {
    let stripped = source_map_comment().replace_all(body, "");
    dynamic_import()
        .replace_all(&stripped, "import(self.__d_rw(")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_source_mapping_url_comment() {
        let js = "console.log(1);\n//# sourceMappingURL=app.js.map\n";
        let out = rewrite_js(js);
        assert!(!out.contains("sourceMappingURL"));
        assert!(out.contains("console.log(1);"));
    }

    #[test]
    fn rewrites_dynamic_import_call_sites() {
        let js = "const m = import('./mod.js');";
        let out = rewrite_js(js);
        assert!(out.contains("import(self.__d_rw('./mod.js')"));
    }

    #[test]
    fn leaves_non_import_code_untouched() {
        let js = "function important() { return 1; }";
        let out = rewrite_js(js);
        assert_eq!(out, js);
    }
}
