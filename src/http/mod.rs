//! Request executor: pacing, proxies, retries, re-authentication and caching.
//!
//! Every portal request goes through [`RequestExecutor::fetch`], which
//!
//! - waits for the host's pacing slot (base delay plus up to 50% jitter),
//! - attaches the distributor's fingerprint and session headers,
//! - sends through a proxy picked by the [`ProxyRotator`],
//! - and maps the status onto the [`ScraperError`] taxonomy.
//!
//! A 401 triggers exactly one session refresh. A 403 is final. 429s, 5xx and
//! network errors back off exponentially until `max_retries` is exhausted.

mod cache;
mod pacer;
mod response;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

pub use cache::ContentCache;
pub use pacer::{DomainPacer, DomainStats, PacerConfig};
pub use response::FetchResponse;

use crate::error::ScraperError;
use crate::proxy::{Proxy, ProxyOutcome, ProxyRotator};
use crate::session::{SessionManager, SessionMaterial};
use crate::stealth::{ContextOverrides, FingerprintContext};

/// Executor settings (`[executor]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Minimum spacing between requests to one host.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base_ms * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    1500
}

fn default_jitter_ratio() -> f64 {
    0.5
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    900
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
            ..Default::default()
        }
    }

    /// Sleep before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Method,
    /// Idempotent listing request that may be answered from the cache.
    pub cacheable: bool,
    /// Attach this distributor's fingerprint and session.
    pub distributor: Option<String>,
    pub query: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl FetchOptions {
    /// A cacheable GET on behalf of `distributor`.
    pub fn listing(distributor: &str) -> Self {
        Self {
            cacheable: true,
            distributor: Some(distributor.to_string()),
            ..Default::default()
        }
    }

    pub fn for_distributor(distributor: &str) -> Self {
        Self {
            distributor: Some(distributor.to_string()),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

enum Attempt {
    Done(FetchResponse),
    /// Retry after the given pause.
    Retry(Duration),
}

/// Shared HTTP front end for all distributor scrapers.
pub struct RequestExecutor {
    config: ExecutorConfig,
    sessions: Arc<SessionManager>,
    proxies: ProxyRotator,
    pacer: DomainPacer,
    cache: ContentCache,
    clients: RwLock<HashMap<String, Client>>,
    anonymous: FingerprintContext,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig, sessions: Arc<SessionManager>, proxies: ProxyRotator) -> Self {
        let pacer = DomainPacer::new(config.pacer_config());
        let cache = ContentCache::new(Duration::from_secs(config.cache_ttl_secs));
        let anonymous = sessions
            .stealth()
            .create_context(&ContextOverrides::default());
        Self {
            config,
            sessions,
            proxies,
            pacer,
            cache,
            clients: RwLock::new(HashMap::new()),
            anonymous,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn proxies(&self) -> &ProxyRotator {
        &self.proxies
    }

    pub fn pacer(&self) -> &DomainPacer {
        &self.pacer
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// One client per egress route, built on first use.
    async fn client_for(&self, proxy: Option<&Proxy>) -> Result<Client, reqwest::Error> {
        let route = proxy.map(|p| p.url.clone()).unwrap_or_default();
        if let Some(client) = self.clients.read().await.get(&route) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .gzip(true)
            .brotli(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy.url)?);
        }
        let client = builder.build()?;
        debug!(
            "Built HTTP client for route {}",
            proxy.map(|p| p.redacted()).unwrap_or_else(|| "direct".into())
        );
        self.clients
            .write()
            .await
            .insert(route, client.clone());
        Ok(client)
    }

    fn resolve_url(url: &str, query: &[(String, String)]) -> Result<Url, ScraperError> {
        let mut parsed = Url::parse(url)
            .map_err(|e| ScraperError::transient(url, 0, format!("invalid URL: {}", e)))?;
        if !query.is_empty() {
            parsed
                .query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(parsed)
    }

    /// Fetch `url`, retrying and re-authenticating as needed.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, ScraperError> {
        let resolved = Self::resolve_url(url, &options.query)?;
        let full_url = resolved.to_string();
        let use_cache = options.cacheable && options.method == Method::GET;

        if use_cache {
            if let Some(hit) = self.cache.get(&full_url).await {
                debug!("Cache hit for {}", full_url);
                return Ok(hit);
            }
        }

        let slug = options.distributor.as_deref();
        let fingerprint = match slug {
            Some(slug) => self.sessions.fingerprint(slug).await,
            None => self.anonymous.clone(),
        };
        let mut session = match slug {
            Some(slug) => Some(self.sessions.get_session(slug).await?),
            None => None,
        };

        let mut attempt: u32 = 0;
        let mut refreshed = false;
        loop {
            let outcome = self
                .attempt(&resolved, &options, &fingerprint, session.as_ref(), attempt)
                .await;

            match outcome {
                Ok(Attempt::Done(response)) => {
                    if use_cache {
                        self.cache.put(&full_url, &response).await;
                    }
                    return Ok(response);
                }
                Ok(Attempt::Retry(pause)) => {
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(ScraperError::AuthenticationFailed { .. }) if !refreshed && slug.is_some() => {
                    if let Some(slug) = slug {
                        info!("{}: session rejected, re-authenticating", slug);
                        session = Some(self.sessions.refresh(slug).await?);
                    }
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        options: &FetchOptions,
        fingerprint: &FingerprintContext,
        session: Option<&SessionMaterial>,
        attempt: u32,
    ) -> Result<Attempt, ScraperError> {
        let url_str = url.as_str();
        let attempts = attempt + 1;
        let can_retry = attempt < self.config.max_retries;
        let domain = self.pacer.acquire(url_str).await;
        let proxy = self.proxies.select().await;

        let sent = match self.client_for(proxy.as_ref()).await {
            Ok(client) => {
                let mut request = client
                    .request(options.method.clone(), url.clone())
                    .headers(fingerprint.request_headers());
                if let Some(session) = session {
                    for (name, value) in session.request_headers() {
                        request = request.header(name, value);
                    }
                }
                for (name, value) in &options.headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                if let Some(body) = &options.json {
                    request = request.json(body);
                }
                request.send().await
            }
            Err(e) => Err(e),
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                if let Some(proxy) = &proxy {
                    self.proxies.report(proxy, ProxyOutcome::Failure).await;
                }
                if let Some(domain) = &domain {
                    self.pacer.report_server_error(domain).await;
                }
                if !can_retry {
                    return Err(ScraperError::transient(url_str, attempts, e));
                }
                let pause = self.config.backoff(attempt);
                warn!(
                    "Request to {} failed ({}), retrying in {:?}",
                    url_str, e, pause
                );
                return Ok(Attempt::Retry(pause));
            }
        };

        let status = response.status().as_u16();
        if let Some(proxy) = &proxy {
            let outcome = match status {
                403 | 429 => Some(ProxyOutcome::Failure),
                500..=599 => None,
                _ => Some(ProxyOutcome::Success),
            };
            if let Some(outcome) = outcome {
                self.proxies.report(proxy, outcome).await;
            }
        }

        match status {
            200..=399 => {
                if let Some(domain) = &domain {
                    self.pacer.report_success(domain).await;
                }
                let headers = response::header_map(response.headers());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ScraperError::transient(url_str, attempts, e))?;
                Ok(Attempt::Done(FetchResponse {
                    url: url_str.to_string(),
                    status,
                    headers,
                    body: body.to_vec(),
                    from_cache: false,
                }))
            }
            401 => Err(ScraperError::AuthenticationFailed {
                distributor: options
                    .distributor
                    .clone()
                    .or(domain)
                    .unwrap_or_default(),
                reason: format!("HTTP 401 from {}", url_str),
            }),
            403 => {
                warn!("Blocked by {} (HTTP 403)", url_str);
                Err(ScraperError::Blocked {
                    url: url_str.to_string(),
                    status,
                })
            }
            429 => {
                if let Some(domain) = &domain {
                    self.pacer.report_rate_limit(domain, status).await;
                }
                if !can_retry {
                    return Err(ScraperError::RateLimited {
                        url: url_str.to_string(),
                        attempts,
                    });
                }
                let mut pause = self.config.backoff(attempt);
                if let Some(secs) = response::retry_after_secs(response.headers()) {
                    pause = pause
                        .max(Duration::from_secs(secs))
                        .min(Duration::from_millis(self.config.max_delay_ms));
                }
                warn!("HTTP 429 from {}, backing off {:?}", url_str, pause);
                Ok(Attempt::Retry(pause))
            }
            500..=599 => {
                if let Some(domain) = &domain {
                    self.pacer.report_server_error(domain).await;
                }
                if !can_retry {
                    return Err(ScraperError::transient(
                        url_str,
                        attempts,
                        format!("HTTP {}", status),
                    ));
                }
                let pause = self.config.backoff(attempt);
                warn!("HTTP {} from {}, retrying in {:?}", status, url_str, pause);
                Ok(Attempt::Retry(pause))
            }
            _ => Err(ScraperError::UnexpectedStatus {
                status,
                url: url_str.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use chrono::Utc;

    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore, SessionCookie, SessionTokens};
    use crate::session::testing::CountingDriver;
    use crate::session::SessionPolicy;
    use crate::stealth::StealthContextFactory;

    fn fast_config(max_retries: u32) -> ExecutorConfig {
        ExecutorConfig {
            base_delay_ms: 0,
            max_retries,
            backoff_base_ms: 1,
            max_delay_ms: 10,
            ..Default::default()
        }
    }

    fn live_credentials() -> Credentials {
        let mut creds = Credentials::password("buyer@example.com", "hunter2");
        creds.session = Some(SessionTokens {
            session_id: "stale".into(),
            csrf_token: None,
            cookies: vec![SessionCookie::new("sessionid", "stale", "127.0.0.1")],
        });
        creds.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        creds
    }

    fn executor(max_retries: u32, driver: Arc<CountingDriver>) -> RequestExecutor {
        let store = MemoryCredentialStore::with("libdib", live_credentials());
        let mut sessions = SessionManager::new(Arc::new(store), StealthContextFactory::new());
        sessions.register_login(
            "libdib",
            "http://127.0.0.1/login",
            SessionPolicy::default(),
            driver,
        );
        RequestExecutor::new(fast_config(max_retries), Arc::new(sessions), ProxyRotator::direct())
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn counted(status: StatusCode) -> (Router, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/products",
                get(move |State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (status, "[]")
                }),
            )
            .with_state(hits.clone());
        (app, hits)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ExecutorConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(4000));
        assert_eq!(config.backoff(40), Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn unauthorized_refreshes_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/products",
                get(
                    |State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let cookie = headers
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        if cookie.contains("sessionid=session-1") {
                            (StatusCode::OK, "[]")
                        } else {
                            (StatusCode::UNAUTHORIZED, "")
                        }
                    },
                ),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let driver = Arc::new(CountingDriver::default());
        let executor = executor(3, driver.clone());
        let response = executor
            .fetch(
                &format!("{}/products", base),
                FetchOptions::for_distributor("libdib"),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(driver.count(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_unauthorized_fails_without_looping() {
        let (app, hits) = counted(StatusCode::UNAUTHORIZED);
        let base = serve(app).await;

        let driver = Arc::new(CountingDriver::default());
        let executor = executor(3, driver.clone());
        let err = executor
            .fetch(
                &format!("{}/products", base),
                FetchOptions::for_distributor("libdib"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScraperError::AuthenticationFailed { .. }));
        assert_eq!(driver.count(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forbidden_is_blocked_without_retry() {
        let (app, hits) = counted(StatusCode::FORBIDDEN);
        let base = serve(app).await;

        let executor = executor(3, Arc::default());
        let err = executor
            .fetch(
                &format!("{}/products", base),
                FetchOptions::for_distributor("libdib"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScraperError::Blocked { status: 403, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn too_many_requests_retries_then_gives_up() {
        let (app, hits) = counted(StatusCode::TOO_MANY_REQUESTS);
        let base = serve(app).await;

        let executor = executor(2, Arc::default());
        let err = executor
            .fetch(&format!("{}/products", base), FetchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ScraperError::RateLimited { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_error_then_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/products",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::INTERNAL_SERVER_ERROR, "oops")
                    } else {
                        (StatusCode::OK, "[1]")
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(app).await;

        let executor = executor(3, Arc::default());
        let response = executor
            .fetch(&format!("{}/products", base), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "[1]");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cacheable_get_hits_server_once() {
        let (app, hits) = counted(StatusCode::OK);
        let base = serve(app).await;

        let executor = executor(3, Arc::default());
        let url = format!("{}/products", base);
        let first = executor
            .fetch(&url, FetchOptions::listing("libdib").query("page", 1))
            .await
            .unwrap();
        let second = executor
            .fetch(&url, FetchOptions::listing("libdib").query("page", 1))
            .await
            .unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_client_errors_are_unexpected_status() {
        let (app, _) = counted(StatusCode::NOT_FOUND);
        let base = serve(app).await;

        let executor = executor(3, Arc::default());
        let err = executor
            .fetch(&format!("{}/products", base), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScraperError::UnexpectedStatus { status: 404, .. }));
    }
}
