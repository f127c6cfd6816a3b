//! Chromium login driver for portals that need JavaScript to sign in.
//!
//! Launches (or connects to) Chrome over CDP, applies the fingerprint and
//! evasion patches, fills the login form and reads back the session cookies.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LoginDriver;
use crate::credentials::{AuthMaterial, SessionCookie};
use crate::error::ScraperError;
use crate::stealth::{FingerprintContext, StealthContextFactory};

/// Browser settings (`[browser]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserLoginConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Explicit Chrome binary; searched for when unset.
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
    /// Remote DevTools endpoint (e.g. `ws://localhost:9222`).
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub chrome_args: Vec<String>,
    /// Directory of exported evasion scripts; manual patches are used without it.
    #[serde(default)]
    pub evasion_dir: Option<PathBuf>,
    #[serde(default = "default_email_selector")]
    pub email_selector: String,
    #[serde(default = "default_password_selector")]
    pub password_selector: String,
    #[serde(default = "default_submit_selector")]
    pub submit_selector: String,
}

fn default_headless() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_email_selector() -> String {
    "input[type=\"email\"], input[name=\"email\"], input[name=\"username\"]".to_string()
}

fn default_password_selector() -> String {
    "input[type=\"password\"]".to_string()
}

fn default_submit_selector() -> String {
    "button[type=\"submit\"], input[type=\"submit\"]".to_string()
}

impl Default for BrowserLoginConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            chrome_path: None,
            remote_url: None,
            timeout_secs: default_timeout(),
            chrome_args: Vec::new(),
            evasion_dir: None,
            email_selector: default_email_selector(),
            password_selector: default_password_selector(),
            submit_selector: default_submit_selector(),
        }
    }
}

/// CDP-driven login.
pub struct ChromiumLoginDriver {
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    config: BrowserLoginConfig,
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    stealth: StealthContextFactory,
}

impl ChromiumLoginDriver {
    pub fn new(config: BrowserLoginConfig, stealth: StealthContextFactory) -> Self {
        Self { config, stealth }
    }
}

#[cfg(feature = "browser")]
mod cdp {
    use std::path::PathBuf;
    use std::time::Duration;

    use chromiumoxide::cdp::browser_protocol::emulation::{
        SetDeviceMetricsOverrideParams, SetGeolocationOverrideParams, SetTimezoneOverrideParams,
    };
    use chromiumoxide::cdp::browser_protocol::network::{
        GetCookiesParams, SetUserAgentOverrideParams,
    };
    use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use super::BrowserLoginConfig;
    use crate::credentials::SessionCookie;
    use crate::error::ScraperError;
    use crate::stealth::{apply_patches, FingerprintContext};

    const CHROME_PATHS: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    pub(super) fn browser_err(context: &str, e: impl std::fmt::Display) -> ScraperError {
        ScraperError::Browser(format!("{}: {}", context, e))
    }

    fn find_chrome(config: &BrowserLoginConfig) -> Result<PathBuf, ScraperError> {
        if let Some(path) = &config.chrome_path {
            return Ok(path.clone());
        }
        for path in CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                debug!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }
        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }
        Err(ScraperError::Browser(
            "Chrome/Chromium not found; install it or set browser.chrome_path".to_string(),
        ))
    }

    /// Launch a browser or connect to a remote one. The handler task must
    /// outlive every page.
    pub(super) async fn open(
        config: &BrowserLoginConfig,
        fingerprint: &FingerprintContext,
    ) -> Result<(Browser, JoinHandle<()>), ScraperError> {
        let (browser, mut handler) = match &config.remote_url {
            Some(remote) => {
                let http_url = remote
                    .replace("ws://", "http://")
                    .replace("wss://", "https://");
                let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));
                let info: serde_json::Value = reqwest::get(&version_url)
                    .await
                    .map_err(|e| browser_err("remote browser unreachable", e))?
                    .json()
                    .await
                    .map_err(|e| browser_err("bad /json/version response", e))?;
                let ws_url = info
                    .get("webSocketDebuggerUrl")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ScraperError::Browser("no webSocketDebuggerUrl".into()))?;
                info!("Connecting to remote browser at {}", ws_url);
                Browser::connect(ws_url)
                    .await
                    .map_err(|e| browser_err("connect failed", e))?
            }
            None => {
                let mut builder = BrowserConfig::builder()
                    .chrome_executable(find_chrome(config)?)
                    .window_size(fingerprint.viewport.width, fingerprint.viewport.height);
                if !config.headless {
                    builder = builder.with_head();
                }
                builder = builder
                    .arg("--disable-blink-features=AutomationControlled")
                    .arg("--disable-infobars")
                    .arg("--disable-dev-shm-usage")
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check")
                    .arg("--disable-background-networking")
                    .arg("--disable-sync")
                    .arg("--disable-translate")
                    .arg("--no-sandbox")
                    .arg("--disable-gpu")
                    .arg(format!("--lang={}", fingerprint.locale));
                for arg in &config.chrome_args {
                    builder = builder.arg(arg);
                }
                let browser_config = builder
                    .build()
                    .map_err(|e| browser_err("invalid browser config", e))?;
                info!("Launching browser (headless={})", config.headless);
                Browser::launch(browser_config)
                    .await
                    .map_err(|e| browser_err("launch failed", e))?
            }
        };

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok((browser, handle))
    }

    /// Apply user agent, locale, timezone, geolocation and viewport.
    pub(super) async fn apply_fingerprint(
        page: &Page,
        fingerprint: &FingerprintContext,
    ) -> Result<(), ScraperError> {
        let ua = SetUserAgentOverrideParams::builder()
            .user_agent(fingerprint.user_agent.clone())
            .accept_language(fingerprint.accept_language())
            .platform(fingerprint.platform())
            .build()
            .map_err(|e| browser_err("user agent override", e))?;
        page.execute(ua)
            .await
            .map_err(|e| browser_err("user agent override", e))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(fingerprint.viewport.width as i64)
            .height(fingerprint.viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| browser_err("viewport override", e))?;
        if let Err(e) = page.execute(metrics).await {
            warn!("Viewport override failed: {}", e);
        }

        if let Err(e) = page
            .execute(SetTimezoneOverrideParams::new(fingerprint.timezone.clone()))
            .await
        {
            warn!("Timezone override failed: {}", e);
        }

        let geo = SetGeolocationOverrideParams::builder()
            .latitude(fingerprint.geolocation.latitude)
            .longitude(fingerprint.geolocation.longitude)
            .accuracy(fingerprint.geolocation.accuracy)
            .build();
        if let Err(e) = page.execute(geo).await {
            warn!("Geolocation override failed: {}", e);
        }
        Ok(())
    }

    pub(super) async fn navigate(
        page: &Page,
        url: &str,
        timeout: Duration,
    ) -> Result<(), ScraperError> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| browser_err("invalid URL", e))?;
        page.execute(params)
            .await
            .map_err(|e| browser_err("navigation failed", e))?;

        let ready = r#"
            new Promise((resolve) => {
                if (document.readyState === 'complete' || document.readyState === 'interactive') {
                    resolve(document.readyState);
                } else {
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), 10000);
                }
            })
        "#;
        match tokio::time::timeout(timeout, page.evaluate(ready.to_string())).await {
            Ok(Ok(_)) => debug!("Login page ready"),
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for login page"),
        }
        Ok(())
    }

    pub(super) async fn evaluate_patches(page: &Page, patches: &[String]) -> usize {
        apply_patches(patches, |script| async move {
            page.evaluate(script).await.map(|_| ())
        })
        .await
    }

    pub(super) async fn fill_and_submit(
        page: &Page,
        config: &BrowserLoginConfig,
        email: &str,
        password: &str,
    ) -> Result<(), ScraperError> {
        page.find_element(config.email_selector.as_str())
            .await
            .map_err(|e| browser_err("email field not found", e))?
            .click()
            .await
            .map_err(|e| browser_err("email field", e))?
            .type_str(email)
            .await
            .map_err(|e| browser_err("email field", e))?;
        page.find_element(config.password_selector.as_str())
            .await
            .map_err(|e| browser_err("password field not found", e))?
            .click()
            .await
            .map_err(|e| browser_err("password field", e))?
            .type_str(password)
            .await
            .map_err(|e| browser_err("password field", e))?;
        page.find_element(config.submit_selector.as_str())
            .await
            .map_err(|e| browser_err("submit button not found", e))?
            .click()
            .await
            .map_err(|e| browser_err("submit", e))?;

        let timeout = Duration::from_secs(config.timeout_secs);
        match tokio::time::timeout(timeout, page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(browser_err("post-login navigation", e)),
            Err(_) => {
                warn!("No navigation after submit; reading cookies anyway");
                Ok(())
            }
        }
    }

    pub(super) async fn session_cookies(page: &Page, fallback_url: &str) -> Vec<SessionCookie> {
        let url = match page.url().await {
            Ok(Some(u)) => u.to_string(),
            _ => fallback_url.to_string(),
        };
        let params = GetCookiesParams::builder().urls(vec![url]).build();
        let cookies = match page.execute(params).await {
            Ok(result) => result.result.cookies,
            Err(e) => {
                warn!("Failed to get cookies via CDP: {}, trying page.get_cookies()", e);
                page.get_cookies().await.unwrap_or_default()
            }
        };
        debug!("Got {} cookies from browser", cookies.len());
        cookies
            .iter()
            .map(|c| SessionCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
            })
            .collect()
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl LoginDriver for ChromiumLoginDriver {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn login(
        &self,
        login_url: &str,
        auth: &AuthMaterial,
        fingerprint: &FingerprintContext,
    ) -> Result<Vec<SessionCookie>, ScraperError> {
        use std::time::Duration;

        let AuthMaterial::Password { email, password } = auth else {
            return Err(ScraperError::AuthenticationFailed {
                distributor: login_url.to_string(),
                reason: "browser login requires email and password".to_string(),
            });
        };

        let (mut browser, handle) = cdp::open(&self.config, fingerprint).await?;
        let result = async {
            let page = browser
                .new_page("about:blank")
                .await
                .map_err(|e| cdp::browser_err("new page", e))?;
            cdp::apply_fingerprint(&page, fingerprint).await?;
            cdp::navigate(&page, login_url, Duration::from_secs(self.config.timeout_secs)).await?;

            let patches = self.stealth.evasion_patches(fingerprint);
            cdp::evaluate_patches(&page, &patches).await;

            cdp::fill_and_submit(&page, &self.config, email, password).await?;
            let cookies = cdp::session_cookies(&page, login_url).await;
            let _ = page.close().await;
            Ok(cookies)
        }
        .await;

        if self.config.remote_url.is_none() {
            let _ = browser.close().await;
        }
        handle.abort();
        result
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl LoginDriver for ChromiumLoginDriver {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn login(
        &self,
        _login_url: &str,
        _auth: &AuthMaterial,
        _fingerprint: &FingerprintContext,
    ) -> Result<Vec<SessionCookie>, ScraperError> {
        Err(ScraperError::Browser(
            "built without the 'browser' feature".to_string(),
        ))
    }
}
