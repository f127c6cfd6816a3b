//! Egress proxy pool with health tracking and weighted selection.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Weight added to every proxy's success rate so new and struggling
/// proxies still get picked occasionally.
pub const SELECTION_EPSILON: f64 = 0.1;

/// An egress proxy (`http://`, `https://` or `socks5://`).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy {
    pub url: String,
}

impl Proxy {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_string(),
        }
    }

    /// URL with any password removed, for logs.
    pub fn redacted(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut u) => {
                if u.password().is_some() {
                    let _ = u.set_password(Some("***"));
                }
                u.to_string()
            }
            Err(_) => "<invalid proxy url>".to_string(),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Proxy").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Result of a request sent through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure,
}

/// Pool configuration (`[proxies]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    /// How long a proxy stays out of rotation once blocked.
    #[serde(default = "default_block_secs")]
    pub block_duration_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

fn default_block_secs() -> u64 {
    3600
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_min_success_rate() -> f64 {
    0.5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            block_duration_secs: default_block_secs(),
            failure_threshold: default_failure_threshold(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

#[derive(Debug, Clone)]
struct ProxyHealth {
    proxy: Proxy,
    success_count: u64,
    failure_count: u64,
    is_blocked: bool,
    blocked_until: Option<DateTime<Utc>>,
}

impl ProxyHealth {
    fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            success_count: 0,
            failure_count: 0,
            is_blocked: false,
            blocked_until: None,
        }
    }

    /// Untried proxies have a rate of 0.0.
    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Lift an expired block. Returns true if the proxy was restored.
    fn expire_block(&mut self, now: DateTime<Utc>) -> bool {
        match self.blocked_until {
            Some(until) if self.is_blocked && now >= until => {
                self.is_blocked = false;
                self.blocked_until = None;
                self.failure_count = 0;
                true
            }
            _ => false,
        }
    }
}

/// Snapshot of one proxy's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyStats {
    pub proxy: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Shared proxy pool.
#[derive(Clone)]
pub struct ProxyRotator {
    config: ProxyConfig,
    pool: Arc<RwLock<Vec<ProxyHealth>>>,
}

impl ProxyRotator {
    pub fn new(config: ProxyConfig) -> Self {
        let pool = config
            .urls
            .iter()
            .filter(|u| !u.trim().is_empty())
            .map(|u| ProxyHealth::new(Proxy::new(u)))
            .collect();
        Self {
            config,
            pool: Arc::new(RwLock::new(pool)),
        }
    }

    /// A rotator with no proxies; every request goes direct.
    pub fn direct() -> Self {
        Self::new(ProxyConfig::default())
    }

    pub async fn len(&self) -> usize {
        self.pool.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pool.read().await.is_empty()
    }

    /// Pick a proxy weighted by `success_rate + ε`, or `None` to go direct.
    pub async fn select(&self) -> Option<Proxy> {
        let now = Utc::now();
        let mut pool = self.pool.write().await;

        for entry in pool.iter_mut() {
            if entry.expire_block(now) {
                info!("Proxy {} back in rotation", entry.proxy);
            }
        }

        let candidates: Vec<(&Proxy, f64)> = pool
            .iter()
            .filter(|e| !e.is_blocked)
            .map(|e| (&e.proxy, e.success_rate() + SELECTION_EPSILON))
            .collect();

        if candidates.is_empty() {
            if !pool.is_empty() {
                warn!("All {} proxies blocked, going direct", pool.len());
            }
            return None;
        }

        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        let mut pick = rand::rng().random_range(0.0..total);
        for (proxy, weight) in &candidates {
            if pick < *weight {
                return Some((*proxy).clone());
            }
            pick -= weight;
        }
        candidates.last().map(|(p, _)| (*p).clone())
    }

    /// Record the outcome of a request made through `proxy`.
    pub async fn report(&self, proxy: &Proxy, outcome: ProxyOutcome) {
        let mut pool = self.pool.write().await;
        let Some(entry) = pool.iter_mut().find(|e| &e.proxy == proxy) else {
            return;
        };

        match outcome {
            ProxyOutcome::Success => entry.success_count += 1,
            ProxyOutcome::Failure => {
                entry.failure_count += 1;
                if !entry.is_blocked
                    && entry.failure_count >= self.config.failure_threshold
                    && entry.success_rate() < self.config.min_success_rate
                {
                    let until =
                        Utc::now() + Duration::seconds(self.config.block_duration_secs as i64);
                    entry.is_blocked = true;
                    entry.blocked_until = Some(until);
                    warn!(
                        "Proxy {} blocked until {} ({} failures, {:.0}% success)",
                        entry.proxy,
                        until,
                        entry.failure_count,
                        entry.success_rate() * 100.0
                    );
                }
            }
        }
        debug!(
            "Proxy {}: {:?} ({}/{} ok)",
            entry.proxy,
            outcome,
            entry.success_count,
            entry.success_count + entry.failure_count
        );
    }

    pub async fn stats(&self) -> Vec<ProxyStats> {
        let pool = self.pool.read().await;
        pool.iter()
            .map(|e| ProxyStats {
                proxy: e.proxy.redacted(),
                success_count: e.success_count,
                failure_count: e.failure_count,
                success_rate: e.success_rate(),
                is_blocked: e.is_blocked,
                blocked_until: e.blocked_until,
            })
            .collect()
    }
}
