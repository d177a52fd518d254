//! C12: Mod Framework. A Mod is a domain-scoped HTML/text transform bound
//! into the HTML streamer for requests whose target host matches its
//! `domain_pattern`. Registered once at boot; enablement is resolved from
//! configuration and does not change per request.

use regex::Regex;

/// `domain_pattern` grammar: `*` (any host), an exact host, or `*.root`
/// (the root host itself or any of its subdomains).
#[derive(Debug, Clone)]
pub enum DomainPattern {
    Any,
    Exact(String),
    Wildcard(String),
}

impl DomainPattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            DomainPattern::Any
        } else if let Some(root) = raw.strip_prefix("*.") {
            DomainPattern::Wildcard(root.to_string())
        } else {
            DomainPattern::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, target_host: &str) -> bool {
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(host) => target_host.eq_ignore_ascii_case(host),
            DomainPattern::Wildcard(root) => {
                target_host.eq_ignore_ascii_case(root)
                    || target_host
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", root.to_ascii_lowercase()))
            }
        }
    }
}

/// Element tags whose subtree is unsafe for blind text substitution: inside
/// these, a text rewriter mod must not touch the text node.
pub const UNSAFE_TEXT_ANCESTORS: &[&str] = &["style", "svg", "noscript", "textarea", "pre", "code"];

/// A single-pattern-and-replacement, or a dictionary compiled to one
/// alternation regex with keys sorted longest-first so short keys never
/// shadow longer ones that contain them.
#[derive(Debug, Clone)]
pub enum TextRule {
    Single { pattern: String, replacement: String },
    Dictionary(Vec<(String, String)>),
}

#[derive(Clone)]
pub enum Replacements {
    Fixed(String),
    /// `(key, replacement)`, longest-key-first — the order the alternation
    /// regex was built in, so the first entry whose key equals the match
    /// text is the one that produced it.
    Keyed(Vec<(String, String)>),
}

#[derive(Clone)]
pub struct CompiledTextRule {
    regex: Regex,
    replacements: Replacements,
}

impl TextRule {
    pub fn compile(&self) -> Option<CompiledTextRule> {
        match self {
            TextRule::Single { pattern, replacement } => {
                let regex = Regex::new(pattern).ok()?;
                Some(CompiledTextRule {
                    regex,
                    replacements: Replacements::Fixed(replacement.clone()),
                })
            }
            TextRule::Dictionary(entries) => {
                let mut sorted = entries.clone();
                sorted.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                let pattern = sorted
                    .iter()
                    .map(|(k, _)| regex::escape(k))
                    .collect::<Vec<_>>()
                    .join("|");
                let regex = Regex::new(&format!("(?:{pattern})")).ok()?;
                Some(CompiledTextRule {
                    regex,
                    replacements: Replacements::Keyed(sorted),
                })
            }
        }
    }
}

impl CompiledTextRule {
    /// Apply the rule to `text`, honoring the script-context guard: inside
    /// `<script>`, a match adjacent to `/ . @ - :` (URL/JSON-like context)
    /// is rejected to avoid corrupting identifiers, property accesses, or
    /// URL fragments that merely happen to contain the matched substring.
    pub fn apply(&self, text: &str, in_script: bool) -> String {
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for m in self.regex.find_iter(text) {
            if in_script && is_guarded_context(bytes, m.start(), m.end()) {
                continue;
            }
            out.push_str(&text[last..m.start()]);
            let replacement = self.replacement_for(m.as_str());
            out.push_str(replacement);
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }

    fn replacement_for<'a>(&'a self, matched: &'a str) -> &'a str {
        match &self.replacements {
            Replacements::Fixed(r) => r,
            Replacements::Keyed(pairs) => pairs
                .iter()
                .find(|(k, _)| k == matched)
                .map(|(_, v)| v.as_str())
                .unwrap_or(matched),
        }
    }
}

fn is_guarded_context(bytes: &[u8], start: usize, end: usize) -> bool {
    const GUARD: &[u8] = b"/.@-:";
    let before = start.checked_sub(1).and_then(|i| bytes.get(i));
    let after = bytes.get(end);
    before.map(|b| GUARD.contains(b)).unwrap_or(false)
        || after.map(|b| GUARD.contains(b)).unwrap_or(false)
}

/// `(id, selector, domain_pattern, handler)` per spec 3. `handler` is a
/// text-rewrite rule bound to CSS `selector` and scoped by `domain_pattern`.
#[derive(Clone)]
pub struct Mod {
    pub id: String,
    pub selector: String,
    pub domain_pattern: DomainPattern,
    pub rule: TextRule,
}

impl Mod {
    pub fn new(id: impl Into<String>, selector: impl Into<String>, domain_pattern: &str, rule: TextRule) -> Self {
        Self {
            id: id.into(),
            selector: selector.into(),
            domain_pattern: DomainPattern::parse(domain_pattern),
            rule,
        }
    }

    /// Compile this mod's rule into a form the HTML Streamer can bind
    /// directly to its selector. `None` if the rule's pattern fails to
    /// compile (the mod is then silently inert, matching the MIME-parse-
    /// failure policy of swallowing component-local failures).
    pub fn compile(&self) -> Option<CompiledMod> {
        Some(CompiledMod {
            id: self.id.clone(),
            selector: self.selector.clone(),
            domain_pattern: self.domain_pattern.clone(),
            rule: self.rule.compile()?,
        })
    }
}

/// A [`Mod`] with its rule already compiled to a regex, ready to bind into
/// the HTML Streamer once per enabled/matching request.
#[derive(Clone)]
pub struct CompiledMod {
    pub id: String,
    pub selector: String,
    pub domain_pattern: DomainPattern,
    pub rule: CompiledTextRule,
}

/// Filter the registered mods down to those enabled and matching
/// `target_host`, per the HTML Streamer's mod-binding step.
pub fn active_mods<'a>(
    mods: &'a [Mod],
    enabled: impl Fn(&str) -> bool,
    target_host: &str,
) -> Vec<&'a Mod> {
    mods.iter()
        .filter(|m| enabled(&m.id) && m.domain_pattern.matches(target_host))
        .collect()
}

/// Same filter over pre-compiled mods, returning owned clones ready to move
/// into the streamer's per-request handler closures.
pub fn active_compiled_mods(
    mods: &[CompiledMod],
    enabled: impl Fn(&str) -> bool,
    target_host: &str,
) -> Vec<CompiledMod> {
    mods.iter()
        .filter(|m| enabled(&m.id) && m.domain_pattern.matches(target_host))
        .cloned()
        .collect()
}

/// The registry of text-rewrite mods this deployment ships. Empty by
/// default: a Mod's selector/pattern/domain are code, not configuration —
/// `MOD_*` environment variables only toggle which of these registered
/// mods are active (`Config::mod_enabled`). Add entries here to ship one.
pub fn builtin_mods() -> Vec<Mod> {
    Vec::new()
}

/// A Traffic Mod runs immediately after URL resolution, before the
/// WebSocket/HTTP branch, and may short-circuit the request with a redirect
/// or a block — spec 4.11's "a Mod exposing an `execute(target,config)` may
/// short-circuit with a Response".
#[derive(Debug, Clone)]
pub enum TrafficAction {
    Redirect { to: String },
    Block { status: u16 },
}

#[derive(Debug, Clone)]
pub struct TrafficMod {
    pub id: String,
    pub domain_pattern: DomainPattern,
    pub action: TrafficAction,
}

impl TrafficMod {
    pub fn new(id: impl Into<String>, domain_pattern: &str, action: TrafficAction) -> Self {
        Self {
            id: id.into(),
            domain_pattern: DomainPattern::parse(domain_pattern),
            action,
        }
    }

    /// `execute(target, config)`: yield this mod's action if it applies to
    /// `target_host`. Enablement (the `config` half) is resolved by the
    /// caller via [`active_traffic_mod`].
    pub fn execute(&self, target_host: &str) -> Option<&TrafficAction> {
        if self.domain_pattern.matches(target_host) {
            Some(&self.action)
        } else {
            None
        }
    }
}

/// The registry of traffic mods this deployment ships. Empty by default,
/// same rationale as [`builtin_mods`].
pub fn builtin_traffic_mods() -> Vec<TrafficMod> {
    Vec::new()
}

/// First enabled, domain-matching traffic mod, per the Orchestrator's
/// short-circuit step. At most one traffic mod applies per request.
pub fn active_traffic_mod<'a>(
    mods: &'a [TrafficMod],
    enabled: impl Fn(&str) -> bool,
    target_host: &str,
) -> Option<&'a TrafficMod> {
    mods.iter()
        .find(|m| enabled(&m.id) && m.domain_pattern.matches(target_host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_pattern_wildcard_matches_root_and_subdomains() {
        let p = DomainPattern::parse("*.ex.com");
        assert!(p.matches("ex.com"));
        assert!(p.matches("a.ex.com"));
        assert!(!p.matches("other.com"));
    }

    #[test]
    fn domain_pattern_any_matches_everything() {
        let p = DomainPattern::parse("*");
        assert!(p.matches("anything.tld"));
    }

    #[test]
    fn domain_pattern_exact_is_case_insensitive() {
        let p = DomainPattern::parse("Ex.com");
        assert!(p.matches("ex.com"));
    }

    #[test]
    fn dictionary_rule_sorts_longest_first() {
        let rule = TextRule::Dictionary(vec![
            ("foo".into(), "X".into()),
            ("foobar".into(), "Y".into()),
        ]);
        let compiled = rule.compile().unwrap();
        let out = compiled.apply("say foobar now", false);
        assert_eq!(out, "say Y now");
    }

    #[test]
    fn active_mods_filters_by_enable_and_domain() {
        let mods = vec![
            Mod::new(
                "a",
                "body",
                "*.ex.com",
                TextRule::Single { pattern: "x".into(), replacement: "y".into() },
            ),
            Mod::new(
                "b",
                "body",
                "other.com",
                TextRule::Single { pattern: "x".into(), replacement: "y".into() },
            ),
        ];
        let active = active_mods(&mods, |id| id == "a", "sub.ex.com");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn script_context_guard_rejects_url_adjacent_matches() {
        let rule = TextRule::Single { pattern: "ads".into(), replacement: "X".into() };
        let compiled = rule.compile().unwrap();
        let guarded = compiled.apply("window.ads.track()", true);
        assert_eq!(guarded, "window.ads.track()");
        let unguarded = compiled.apply("show ads here", true);
        assert_eq!(unguarded, "show X here");
    }

    #[test]
    fn active_compiled_mods_filters_like_active_mods() {
        let mods = vec![
            Mod::new("a", "body", "*.ex.com", TextRule::Single { pattern: "x".into(), replacement: "y".into() }),
            Mod::new("b", "body", "other.com", TextRule::Single { pattern: "x".into(), replacement: "y".into() }),
        ];
        let compiled: Vec<CompiledMod> = mods.iter().filter_map(Mod::compile).collect();
        let active = active_compiled_mods(&compiled, |id| id == "a", "sub.ex.com");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn traffic_mod_executes_only_for_matching_domain() {
        let mod_ = TrafficMod::new("block-evil", "*.evil.com", TrafficAction::Block { status: 451 });
        assert!(mod_.execute("sub.evil.com").is_some());
        assert!(mod_.execute("other.com").is_none());
    }

    #[test]
    fn active_traffic_mod_respects_enablement() {
        let mods = vec![TrafficMod::new("block-evil", "*.evil.com", TrafficAction::Block { status: 451 })];
        assert!(active_traffic_mod(&mods, |_| false, "sub.evil.com").is_none());
        assert!(active_traffic_mod(&mods, |_| true, "sub.evil.com").is_some());
    }
}
