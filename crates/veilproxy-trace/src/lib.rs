//! A2: Structured per-request logging. Emits one `tracing` event per
//! completed request carrying the fields an operator needs to reconstruct
//! what happened without looking at the body: method, host, target host,
//! status, duration, cache outcome.

use std::time::Instant;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

impl CacheOutcome {
    fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

/// Starts at request entry, logged once at completion via [`RequestSpan::finish`].
pub struct RequestSpan {
    method: String,
    host: String,
    target_host: String,
    started_at: Instant,
}

impl RequestSpan {
    pub fn start(method: &str, host: &str, target_host: &str) -> Self {
        Self {
            method: method.to_string(),
            host: host.to_string(),
            target_host: target_host.to_string(),
            started_at: Instant::now(),
        }
    }

    pub fn finish(self, status: u16, cache: CacheOutcome) {
        info!(
            method = %self.method,
            host = %self.host,
            target_host = %self.target_host,
            status = status,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            cache = cache.as_str(),
            "request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_outcome_labels() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Miss.as_str(), "miss");
        assert_eq!(CacheOutcome::Bypass.as_str(), "bypass");
    }

    #[test]
    fn span_finish_does_not_panic() {
        let span = RequestSpan::start("GET", "x.com.p.example", "x.com");
        span.finish(200, CacheOutcome::Miss);
    }
}
