//! Process-wide configuration, loaded once from the environment at boot.
//!
//! Every field here mirrors the contract in the stealth-proxy specification
//! (root domain, cache policy, feature flags, cookie pass-through globs, mod
//! toggles). Nothing here is re-read after [`Config::from_env`] returns; the
//! rest of the proxy treats it as an immutable, shared reference.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ROOT_DOMAIN is required and must be a bare RFC-1123 hostname (no scheme, no path, no port): {0}")]
    InvalidRootDomain(String),
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidInt { var: &'static str, value: String },
    #[error("{var} must be a JSON array of strings, got {value:?}: {source}")]
    InvalidJsonArray {
        var: &'static str,
        value: String,
        source: serde_json::Error,
    },
}

/// A boolean-like environment value: `true|1|on` (case-insensitive) is
/// truthy, everything else (including absence) is falsy unless a default
/// says otherwise.
fn parse_bool_like(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on")
}

fn env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(raw) => parse_bool_like(&raw),
        Err(_) => default,
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidInt { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn env_json_string_list(var: &'static str, default: &[&str]) -> Result<Vec<String>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => serde_json::from_str::<Vec<String>>(&raw).map_err(|source| {
            ConfigError::InvalidJsonArray {
                var,
                value: raw,
                source,
            }
        }),
        Err(_) => Ok(default.iter().map(|s| s.to_string()).collect()),
    }
}

/// Validates a bare RFC-1123 hostname: labels of letters/digits/hyphens
/// separated by dots, no leading/trailing dot, no scheme, no path, no port.
fn validate_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 || host.contains("://") || host.contains('/') {
        return false;
    }
    if host.starts_with('.') || host.ends_with('.') || host.contains(':') {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    /// Ordered MIME-prefixes matched by `contains`, per spec 4.8.
    pub cacheable_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub stealth_mode: bool,
    pub service_worker: bool,
}

#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub root_passthrough: Vec<String>,
    pub proxy_passthrough: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub root_domain: String,
    pub cache: CacheConfig,
    pub features: FeatureFlags,
    pub cookies: CookiePolicy,
    /// mod-id -> enabled, derived from `MOD_*` environment variables.
    pub mods: HashMap<String, bool>,
}

const DEFAULT_CACHEABLE_TYPES: &[&str] = &[
    "image/",
    "font/",
    "audio/",
    "video/",
    "text/css",
    "text/plain",
    "application/javascript",
    "application/x-javascript",
    "application/pdf",
    "image/x-icon",
    "image/vnd.microsoft.icon",
];

impl Config {
    /// Load and validate configuration from process environment variables.
    /// Fails fast: any invalid value aborts startup rather than limping on
    /// with a guessed default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let root_domain = std::env::var("ROOT_DOMAIN").unwrap_or_default();
        if !validate_hostname(&root_domain) {
            return Err(ConfigError::InvalidRootDomain(root_domain));
        }

        let cache = CacheConfig {
            enabled: env_bool("CACHE_ENABLED", true),
            ttl_seconds: env_u64("CACHE_TTL", 3600)?,
            cacheable_types: env_json_string_list("CACHEABLE_TYPES", DEFAULT_CACHEABLE_TYPES)?,
        };

        let features = FeatureFlags {
            stealth_mode: env_bool("FEATURES_STEALTH_MODE", true),
            service_worker: env_bool("FEATURES_SERVICE_WORKER", true),
        };

        let cookies = CookiePolicy {
            root_passthrough: env_json_string_list("COOKIE_ROOT_PASSTHROUGH", &[])?,
            proxy_passthrough: env_json_string_list("COOKIE_PROXY_PASSTHROUGH", &[])?,
        };

        let mods: HashMap<String, bool> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("MOD_")
                    .map(|id| (id.to_ascii_lowercase(), parse_bool_like(&v)))
            })
            .collect();

        tracing::info!(root_domain = %root_domain, cache_enabled = cache.enabled, mod_count = mods.len(), "configuration loaded");

        Ok(Config {
            root_domain,
            cache,
            features,
            cookies,
            mods,
        })
    }

    pub fn mod_enabled(&self, id: &str) -> bool {
        self.mods.get(id).copied().unwrap_or(false)
    }
}
