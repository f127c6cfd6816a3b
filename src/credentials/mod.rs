//! Per-distributor credentials and session material.
//!
//! Secrets never go through `Debug` or logs unredacted.

mod file;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub use file::FileCredentialStore;

/// Errors from credential backends.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid credentials file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Static auth material used to obtain or authorize a session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMaterial {
    Password { email: String, password: String },
    ApiKey { key: String },
}

impl AuthMaterial {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::ApiKey { .. } => "api_key",
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"<redacted>").finish(),
        }
    }
}

/// A cookie captured from a login flow.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: default_cookie_path(),
        }
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Tokens extracted from a successful login.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub session_id: String,
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("session_id", &"<redacted>")
            .field("csrf_token", &self.csrf_token.as_ref().map(|_| "<redacted>"))
            .field("cookies", &self.cookies)
            .finish()
    }
}

/// Everything needed to make authenticated requests to one distributor.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth: AuthMaterial,
    #[serde(default)]
    pub session: Option<SessionTokens>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(auth: AuthMaterial) -> Self {
        Self {
            auth,
            session: None,
            expires_at: None,
        }
    }

    pub fn password(email: &str, password: &str) -> Self {
        Self::new(AuthMaterial::Password {
            email: email.to_string(),
            password: password.to_string(),
        })
    }

    pub fn api_key(key: &str) -> Self {
        Self::new(AuthMaterial::ApiKey {
            key: key.to_string(),
        })
    }

    /// API keys are long-lived and never go through a login flow.
    pub fn is_api_key(&self) -> bool {
        matches!(self.auth, AuthMaterial::ApiKey { .. })
    }

    /// True when the session is missing an expiry or the expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => true,
        }
    }

    /// Headers that authorize a request with this material.
    pub fn request_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let AuthMaterial::ApiKey { key } = &self.auth {
            headers.push(("Authorization", format!("Bearer {}", key)));
            headers.push(("X-Api-Key", key.clone()));
        }
        if let Some(session) = &self.session {
            if !session.cookies.is_empty() {
                let cookie = session
                    .cookies
                    .iter()
                    .map(|c| format!("{}={}", c.name, c.value))
                    .collect::<Vec<_>>()
                    .join("; ");
                headers.push(("Cookie", cookie));
            }
            if let Some(csrf) = &session.csrf_token {
                headers.push(("X-CSRFToken", csrf.clone()));
            }
        }
        headers
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth", &self.auth)
            .field("session", &self.session)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resolves and persists per-distributor credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, slug: &str) -> Result<Option<Credentials>, CredentialError>;
    async fn put(&self, slug: &str, credentials: &Credentials) -> Result<(), CredentialError>;
}

/// In-memory credential store.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    entries: Arc<RwLock<HashMap<String, Credentials>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(slug: &str, credentials: Credentials) -> Self {
        let mut entries = HashMap::new();
        entries.insert(slug.to_string(), credentials);
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, slug: &str) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.entries.read().await.get(slug).cloned())
    }

    async fn put(&self, slug: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        self.entries
            .write()
            .await
            .insert(slug.to_string(), credentials.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn debug_redacts_secrets() {
        let mut creds = Credentials::password("buyer@example.com", "hunter2");
        creds.session = Some(SessionTokens {
            session_id: "s3cr3t".into(),
            csrf_token: Some("tok".into()),
            cookies: vec![SessionCookie::new("sessionid", "s3cr3t", "example.com")],
        });
        let out = format!("{:?}", creds);
        assert!(out.contains("buyer@example.com"));
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("s3cr3t"));
        assert!(!out.contains("\"tok\""));
    }

    #[test]
    fn missing_expiry_counts_as_expired() {
        let now = Utc::now();
        let mut creds = Credentials::password("a@b.c", "pw");
        assert!(creds.is_expired(now));
        creds.expires_at = Some(now + Duration::hours(1));
        assert!(!creds.is_expired(now));
        creds.expires_at = Some(now - Duration::seconds(1));
        assert!(creds.is_expired(now));
    }

    #[test]
    fn request_headers_carry_cookies_and_csrf() {
        let mut creds = Credentials::password("a@b.c", "pw");
        creds.session = Some(SessionTokens {
            session_id: "abc".into(),
            csrf_token: Some("xyz".into()),
            cookies: vec![
                SessionCookie::new("sessionid", "abc", "example.com"),
                SessionCookie::new("csrftoken", "xyz", "example.com"),
            ],
        });
        let headers = creds.request_headers();
        assert!(headers.contains(&("Cookie", "sessionid=abc; csrftoken=xyz".to_string())));
        assert!(headers.contains(&("X-CSRFToken", "xyz".to_string())));

        let headers = Credentials::api_key("k-1").request_headers();
        assert!(headers.contains(&("X-Api-Key", "k-1".to_string())));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.get("libdib").await.unwrap().is_none());
        store
            .put("libdib", &Credentials::api_key("k"))
            .await
            .unwrap();
        assert!(store.get("libdib").await.unwrap().unwrap().is_api_key());
    }
}
