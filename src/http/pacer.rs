//! Adaptive per-domain request pacing.
//!
//! Keeps the time of the last request to each host and spaces the next one by
//! the host's current delay plus random jitter. Rate limits widen the delay,
//! runs of successes shrink it back towards the base.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter is drawn from `0..=jitter_ratio * current_delay`.
    pub jitter_ratio: f64,
    pub backoff_multiplier: f64,
    pub recovery_multiplier: f64,
    pub recovery_threshold: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.5,
            backoff_multiplier: 2.0,
            recovery_multiplier: 0.8,
            recovery_threshold: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct DomainState {
    current_delay: Duration,
    /// When the most recent request was (or is scheduled to be) sent.
    next_slot: Option<Instant>,
    consecutive_successes: u32,
    in_backoff: bool,
    total_requests: u64,
    rate_limit_hits: u64,
}

impl DomainState {
    fn new(base_delay: Duration) -> Self {
        Self {
            current_delay: base_delay,
            next_slot: None,
            consecutive_successes: 0,
            in_backoff: false,
            total_requests: 0,
            rate_limit_hits: 0,
        }
    }
}

/// Pacing snapshot for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStats {
    pub current_delay: Duration,
    pub in_backoff: bool,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
}

/// Shared across every task that talks to the same hosts.
#[derive(Debug, Clone)]
pub struct DomainPacer {
    config: PacerConfig,
    domains: Arc<RwLock<HashMap<String, DomainState>>>,
}

impl DomainPacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            domains: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }

    fn jitter(&self, delay: Duration) -> Duration {
        let max = delay.as_secs_f64() * self.config.jitter_ratio;
        if !max.is_finite() || max <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::rng().random_range(0.0..=max))
    }

    /// Wait for the host's next slot. Returns the host, or `None` for URLs
    /// without one.
    ///
    /// The slot is reserved under the write lock so concurrent callers for
    /// the same host queue up instead of firing together.
    pub async fn acquire(&self, url: &str) -> Option<String> {
        let domain = Self::extract_domain(url)?;
        let now = Instant::now();

        let slot = {
            let mut domains = self.domains.write().await;
            let state = domains
                .entry(domain.clone())
                .or_insert_with(|| DomainState::new(self.config.base_delay));
            let slot = match state.next_slot {
                Some(last) => {
                    let spacing = state.current_delay + self.jitter(state.current_delay);
                    (last + spacing).max(now)
                }
                None => now,
            };
            state.next_slot = Some(slot);
            state.total_requests += 1;
            slot
        };

        if slot > now {
            debug!("Pacing {}: waiting {:?}", domain, slot - now);
            tokio::time::sleep_until(slot).await;
        }
        Some(domain)
    }

    pub async fn report_success(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        let Some(state) = domains.get_mut(domain) else {
            return;
        };
        state.consecutive_successes += 1;

        if state.in_backoff && state.consecutive_successes >= self.config.recovery_threshold {
            let reduced = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
            );
            if reduced <= self.config.base_delay {
                state.in_backoff = false;
                state.current_delay = self.config.base_delay;
                info!("{} recovered from backoff", domain);
            } else {
                state.current_delay = reduced;
                debug!("{} delay reduced to {:?}", domain, state.current_delay);
            }
            state.consecutive_successes = 0;
        }
    }

    /// HTTP 429 (or an explicit Retry-After).
    pub async fn report_rate_limit(&self, domain: &str, status: u16) {
        let mut domains = self.domains.write().await;
        let Some(state) = domains.get_mut(domain) else {
            return;
        };
        state.rate_limit_hits += 1;
        state.consecutive_successes = 0;
        state.in_backoff = true;
        let widened = Duration::from_secs_f64(
            state.current_delay.as_secs_f64() * self.config.backoff_multiplier,
        );
        state.current_delay = widened.min(self.config.max_delay);
        warn!(
            "Rate limited by {} (HTTP {}), spacing requests {:?} apart",
            domain, status, state.current_delay
        );
    }

    /// 5xx and network errors: mild widening.
    pub async fn report_server_error(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.consecutive_successes = 0;
            state.in_backoff = true;
            let widened = Duration::from_secs_f64(state.current_delay.as_secs_f64() * 1.5);
            state.current_delay = widened.min(self.config.max_delay);
            debug!(
                "Server error from {}, delay now {:?}",
                domain, state.current_delay
            );
        }
    }

    pub async fn stats(&self) -> HashMap<String, DomainStats> {
        let domains = self.domains.read().await;
        domains
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    DomainStats {
                        current_delay: v.current_delay,
                        in_backoff: v.in_backoff,
                        total_requests: v.total_requests,
                        rate_limit_hits: v.rate_limit_hits,
                    },
                )
            })
            .collect()
    }
}

impl Default for DomainPacer {
    fn default() -> Self {
        Self::new(PacerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(base_ms: u64) -> DomainPacer {
        DomainPacer::new(PacerConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(1000),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn spacing_includes_delay_and_bounded_jitter() {
        let pacer = pacer(100);
        let start = Instant::now();
        pacer.acquire("https://portal.example.com/a").await;
        assert!(start.elapsed() < Duration::from_millis(50));

        pacer.acquire("https://portal.example.com/b").await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn hosts_are_paced_independently() {
        let pacer = pacer(1000);
        let start = Instant::now();
        pacer.acquire("https://a.example.com/").await;
        pacer.acquire("https://b.example.com/").await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rate_limit_widens_then_successes_recover() {
        let pacer = pacer(100);
        pacer.acquire("https://portal.example.com/").await;
        pacer.report_rate_limit("portal.example.com", 429).await;

        let stats = pacer.stats().await;
        let s = &stats["portal.example.com"];
        assert_eq!(s.current_delay, Duration::from_millis(200));
        assert!(s.in_backoff);

        for _ in 0..5 {
            pacer.report_success("portal.example.com").await;
        }
        let stats = pacer.stats().await;
        assert_eq!(
            stats["portal.example.com"].current_delay,
            Duration::from_millis(160)
        );
    }

    #[tokio::test]
    async fn server_errors_recover_like_rate_limits() {
        let pacer = pacer(100);
        pacer.acquire("https://portal.example.com/").await;
        pacer.report_server_error("portal.example.com").await;

        let stats = pacer.stats().await;
        assert_eq!(
            stats["portal.example.com"].current_delay,
            Duration::from_millis(150)
        );
        assert!(stats["portal.example.com"].in_backoff);

        for _ in 0..10 {
            pacer.report_success("portal.example.com").await;
        }
        let stats = pacer.stats().await;
        let s = &stats["portal.example.com"];
        assert_eq!(s.current_delay, Duration::from_millis(100));
        assert!(!s.in_backoff);
    }

    #[tokio::test]
    async fn delay_is_capped() {
        let pacer = pacer(400);
        pacer.acquire("https://portal.example.com/").await;
        for _ in 0..4 {
            pacer.report_rate_limit("portal.example.com", 429).await;
        }
        let stats = pacer.stats().await;
        assert_eq!(
            stats["portal.example.com"].current_delay,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn extract_domain_handles_bad_urls() {
        assert_eq!(
            DomainPacer::extract_domain("https://app.libdib.com/api"),
            Some("app.libdib.com".to_string())
        );
        assert_eq!(DomainPacer::extract_domain("not a url"), None);
    }
}
