//! HTTP form login for portals that render a plain HTML login form.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderValue, ACCEPT, REFERER};
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::LoginDriver;
use crate::credentials::{AuthMaterial, SessionCookie};
use crate::error::ScraperError;
use crate::stealth::FingerprintContext;

/// Field names of the login form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormLoginConfig {
    #[serde(default = "default_email_field")]
    pub email_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default = "default_csrf_field")]
    pub csrf_field: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_email_field() -> String {
    "email".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_csrf_field() -> String {
    "csrfmiddlewaretoken".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for FormLoginConfig {
    fn default() -> Self {
        Self {
            email_field: default_email_field(),
            password_field: default_password_field(),
            csrf_field: default_csrf_field(),
            timeout_secs: default_timeout(),
        }
    }
}

/// What we need from the login page.
#[derive(Debug, Default, PartialEq)]
struct LoginForm {
    action: Option<String>,
    csrf_token: Option<String>,
}

fn parse_login_form(html: &str, csrf_field: &str) -> LoginForm {
    let document = Html::parse_document(html);
    let mut form = LoginForm::default();

    if let (Ok(forms), Ok(password)) = (
        Selector::parse("form"),
        Selector::parse("input[type=\"password\"]"),
    ) {
        form.action = document
            .select(&forms)
            .find(|f| f.select(&password).next().is_some())
            .and_then(|f| f.value().attr("action"))
            .filter(|a| !a.trim().is_empty())
            .map(|a| a.to_string());
    }
    if let Ok(sel) = Selector::parse(&format!("input[name=\"{}\"]", csrf_field)) {
        form.csrf_token = document
            .select(&sel)
            .next()
            .and_then(|i| i.value().attr("value"))
            .map(|v| v.to_string());
    }
    form
}

fn cookies_for(jar: &Jar, url: &Url) -> Vec<SessionCookie> {
    let domain = url.host_str().unwrap_or_default();
    jar.cookies(url)
        .and_then(|h| h.to_str().map(|s| s.to_string()).ok())
        .map(|header| {
            header
                .split(';')
                .filter_map(|pair| pair.trim().split_once('='))
                .map(|(name, value)| SessionCookie::new(name, value, domain))
                .collect()
        })
        .unwrap_or_default()
}

/// Logs in by fetching the login page and posting its form.
#[derive(Debug, Clone, Default)]
pub struct FormLoginDriver {
    config: FormLoginConfig,
}

impl FormLoginDriver {
    pub fn new(config: FormLoginConfig) -> Self {
        Self { config }
    }

    fn auth_failed(url: &Url, reason: impl Into<String>) -> ScraperError {
        ScraperError::AuthenticationFailed {
            distributor: url.host_str().unwrap_or_default().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LoginDriver for FormLoginDriver {
    fn name(&self) -> &str {
        "form"
    }

    async fn login(
        &self,
        login_url: &str,
        auth: &AuthMaterial,
        fingerprint: &FingerprintContext,
    ) -> Result<Vec<SessionCookie>, ScraperError> {
        let url = Url::parse(login_url)
            .map_err(|e| ScraperError::transient(login_url, 0, format!("bad login URL: {}", e)))?;
        let AuthMaterial::Password { email, password } = auth else {
            return Err(Self::auth_failed(&url, "form login requires email and password"));
        };

        let jar = Arc::new(Jar::default());
        let mut headers = fingerprint.request_headers();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| ScraperError::transient(login_url, 0, e))?;

        let page = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ScraperError::transient(login_url, 1, e))?;
        if !page.status().is_success() {
            return Err(Self::auth_failed(
                &url,
                format!("login page returned HTTP {}", page.status().as_u16()),
            ));
        }
        let body = page
            .text()
            .await
            .map_err(|e| ScraperError::transient(login_url, 1, e))?;
        let form = parse_login_form(&body, &self.config.csrf_field);

        let action = match &form.action {
            Some(action) => url
                .join(action)
                .map_err(|e| Self::auth_failed(&url, format!("bad form action: {}", e)))?,
            None => url.clone(),
        };
        debug!(
            "Posting login form to {} (csrf token: {})",
            action,
            form.csrf_token.is_some()
        );

        let mut fields = vec![
            (self.config.email_field.clone(), email.clone()),
            (self.config.password_field.clone(), password.clone()),
        ];
        let mut request = client.post(action.clone()).header(REFERER, url.as_str());
        if let Some(token) = &form.csrf_token {
            fields.push((self.config.csrf_field.clone(), token.clone()));
            request = request.header("X-CSRFToken", token);
        }

        let response = request
            .form(&fields)
            .send()
            .await
            .map_err(|e| ScraperError::transient(action.as_str(), 1, e))?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(Self::auth_failed(
                &url,
                format!("login rejected with HTTP {}", status.as_u16()),
            ));
        }

        Ok(cookies_for(&jar, &url))
    }
}
