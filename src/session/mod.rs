//! Authenticated session lifecycle per distributor.
//!
//! Sessions are refreshed through a [`LoginDriver`] when they expire. Each
//! distributor also gets one stable [`FingerprintContext`] so the login and
//! every later request present the same browser.

mod browser;
mod form;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use browser::{BrowserLoginConfig, ChromiumLoginDriver};
pub use form::{FormLoginConfig, FormLoginDriver};

use crate::credentials::{AuthMaterial, CredentialStore, Credentials, SessionCookie, SessionTokens};
use crate::error::ScraperError;
use crate::stealth::{ContextOverrides, FingerprintContext, StealthContextFactory};

/// Session material handed to request code.
pub type SessionMaterial = Credentials;

/// How a distributor's sessions are obtained and how long they last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Login page, relative to the distributor base URL.
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Fixed session lifetime from login.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    #[serde(default = "default_csrf_cookie")]
    pub csrf_cookie: Option<String>,
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_ttl_minutes() -> i64 {
    120
}

fn default_session_cookie() -> String {
    "sessionid".to_string()
}

fn default_csrf_cookie() -> Option<String> {
    Some("csrftoken".to_string())
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            ttl_minutes: default_ttl_minutes(),
            session_cookie: default_session_cookie(),
            csrf_cookie: default_csrf_cookie(),
        }
    }
}

impl SessionPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::minutes(self.ttl_minutes)
    }

    /// Pull the session and CSRF tokens out of a login's cookies.
    pub fn tokens_from_cookies(&self, cookies: Vec<SessionCookie>) -> Option<SessionTokens> {
        let session_id = cookies
            .iter()
            .find(|c| c.name == self.session_cookie)
            .map(|c| c.value.clone())?;
        let csrf_token = self
            .csrf_cookie
            .as_ref()
            .and_then(|name| cookies.iter().find(|c| &c.name == name))
            .map(|c| c.value.clone());
        Some(SessionTokens {
            session_id,
            csrf_token,
            cookies,
        })
    }
}

/// Performs an automated login and returns the resulting cookies.
#[async_trait]
pub trait LoginDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn login(
        &self,
        login_url: &str,
        auth: &AuthMaterial,
        fingerprint: &FingerprintContext,
    ) -> Result<Vec<SessionCookie>, ScraperError>;
}

/// How long a failed login suppresses further attempts for that distributor.
pub const DEFAULT_REFRESH_COOLDOWN: StdDuration = StdDuration::from_secs(60);

struct RefreshStrategy {
    login_url: String,
    policy: SessionPolicy,
    driver: Arc<dyn LoginDriver>,
}

/// Owns session validity, expiry and refresh for all distributors.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    stealth: StealthContextFactory,
    strategies: HashMap<String, RefreshStrategy>,
    overrides: HashMap<String, ContextOverrides>,
    fingerprints: RwLock<HashMap<String, FingerprintContext>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Last failed login per slug: when, and why.
    failures: Mutex<HashMap<String, (Instant, String)>>,
    refresh_cooldown: StdDuration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, stealth: StealthContextFactory) -> Self {
        Self {
            store,
            stealth,
            strategies: HashMap::new(),
            overrides: HashMap::new(),
            fingerprints: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
        }
    }

    pub fn set_refresh_cooldown(&mut self, cooldown: StdDuration) {
        self.refresh_cooldown = cooldown;
    }

    /// Register how sessions for `slug` are refreshed.
    pub fn register_login(
        &mut self,
        slug: &str,
        login_url: &str,
        policy: SessionPolicy,
        driver: Arc<dyn LoginDriver>,
    ) {
        debug!("{}: session refresh via {} at {}", slug, driver.name(), login_url);
        self.strategies.insert(
            slug.to_string(),
            RefreshStrategy {
                login_url: login_url.to_string(),
                policy,
                driver,
            },
        );
    }

    /// Pin parts of the fingerprint used for `slug`.
    pub fn set_overrides(&mut self, slug: &str, overrides: ContextOverrides) {
        self.overrides.insert(slug.to_string(), overrides);
    }

    pub fn has_refresh(&self, slug: &str) -> bool {
        self.strategies.contains_key(slug)
    }

    pub fn stealth(&self) -> &StealthContextFactory {
        &self.stealth
    }

    /// The fingerprint this distributor is seen with, created on first use.
    pub async fn fingerprint(&self, slug: &str) -> FingerprintContext {
        if let Some(fp) = self.fingerprints.read().await.get(slug) {
            return fp.clone();
        }
        let mut fingerprints = self.fingerprints.write().await;
        fingerprints
            .entry(slug.to_string())
            .or_insert_with(|| {
                let overrides = self.overrides.get(slug).cloned().unwrap_or_default();
                self.stealth.create_context(&overrides)
            })
            .clone()
    }

    async fn slug_lock(&self, slug: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, slug: &str) -> Result<Credentials, ScraperError> {
        self.store
            .get(slug)
            .await?
            .ok_or_else(|| ScraperError::CredentialsMissing {
                distributor: slug.to_string(),
            })
    }

    /// Current session for `slug`, refreshed if expired.
    ///
    /// Refresh failures are logged and the stale session is returned; the
    /// caller finds out on the next 401.
    pub async fn get_session(&self, slug: &str) -> Result<SessionMaterial, ScraperError> {
        let creds = self.load(slug).await?;
        if creds.is_api_key() || !creds.is_expired(Utc::now()) {
            return Ok(creds);
        }
        if !self.has_refresh(slug) {
            debug!("{}: session expired but no refresh strategy", slug);
            return Ok(creds);
        }

        let lock = self.slug_lock(slug).await;
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited
        let creds = self.load(slug).await?;
        if !creds.is_expired(Utc::now()) {
            return Ok(creds);
        }
        if let Some(reason) = self.recent_failure(slug).await {
            debug!("{}: skipping refresh, last login failed: {}", slug, reason);
            return Ok(creds);
        }

        match self.login(slug, creds.clone()).await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                warn!("{}: session refresh failed, using stale session: {}", slug, e);
                Ok(creds)
            }
        }
    }

    /// Force a new login for `slug`.
    ///
    /// Fails without contacting the portal while a previous login failure is
    /// inside the refresh cooldown.
    pub async fn refresh(&self, slug: &str) -> Result<SessionMaterial, ScraperError> {
        let lock = self.slug_lock(slug).await;
        let _guard = lock.lock().await;

        let creds = self.load(slug).await?;
        if creds.is_api_key() {
            return Ok(creds);
        }
        if let Some(reason) = self.recent_failure(slug).await {
            return Err(ScraperError::AuthenticationFailed {
                distributor: slug.to_string(),
                reason: format!("recent login failed: {}", reason),
            });
        }
        self.login(slug, creds).await
    }

    async fn recent_failure(&self, slug: &str) -> Option<String> {
        let mut failures = self.failures.lock().await;
        match failures.get(slug) {
            Some((at, reason)) if at.elapsed() < self.refresh_cooldown => Some(reason.clone()),
            Some(_) => {
                failures.remove(slug);
                None
            }
            None => None,
        }
    }

    /// Log in and remember the outcome for the cooldown.
    async fn login(&self, slug: &str, creds: Credentials) -> Result<SessionMaterial, ScraperError> {
        let result = self.perform_login(slug, creds).await;
        let mut failures = self.failures.lock().await;
        match &result {
            Ok(_) => {
                failures.remove(slug);
            }
            Err(e) => {
                failures.insert(slug.to_string(), (Instant::now(), e.to_string()));
            }
        }
        result
    }

    async fn perform_login(
        &self,
        slug: &str,
        mut creds: Credentials,
    ) -> Result<SessionMaterial, ScraperError> {
        let strategy =
            self.strategies
                .get(slug)
                .ok_or_else(|| ScraperError::AuthenticationFailed {
                    distributor: slug.to_string(),
                    reason: "no login strategy configured".to_string(),
                })?;

        let fingerprint = self.fingerprint(slug).await;
        info!("{}: logging in via {}", slug, strategy.driver.name());
        let cookies = strategy
            .driver
            .login(&strategy.login_url, &creds.auth, &fingerprint)
            .await?;

        let tokens = strategy.policy.tokens_from_cookies(cookies).ok_or_else(|| {
            ScraperError::AuthenticationFailed {
                distributor: slug.to_string(),
                reason: format!("login set no '{}' cookie", strategy.policy.session_cookie),
            }
        })?;

        creds.session = Some(tokens);
        creds.expires_at = Some(Utc::now() + strategy.policy.ttl());
        if let Err(e) = self.store.put(slug, &creds).await {
            warn!("{}: could not persist refreshed session: {}", slug, e);
        }
        Ok(creds)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Driver that hands out a numbered session cookie per login.
    #[derive(Default)]
    pub struct CountingDriver {
        pub logins: AtomicUsize,
        pub fail: bool,
    }

    impl CountingDriver {
        pub fn count(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LoginDriver for CountingDriver {
        fn name(&self) -> &str {
            "counting"
        }

        async fn login(
            &self,
            login_url: &str,
            _auth: &AuthMaterial,
            _fingerprint: &FingerprintContext,
        ) -> Result<Vec<SessionCookie>, ScraperError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(ScraperError::AuthenticationFailed {
                    distributor: login_url.to_string(),
                    reason: "bad password".into(),
                });
            }
            Ok(vec![
                SessionCookie::new("sessionid", &format!("session-{}", n), "localhost"),
                SessionCookie::new("csrftoken", "csrf", "localhost"),
            ])
        }
    }
}
