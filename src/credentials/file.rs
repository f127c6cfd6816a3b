//! File-backed credential store.
//!
//! Auth material comes from the environment (`<SLUG>_EMAIL` +
//! `<SLUG>_PASSWORD`, or `<SLUG>_API_KEY`) or from the JSON file. Refreshed
//! session tokens are written back to the file. Auth material that only came
//! from the environment is never written to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{AuthMaterial, CredentialError, CredentialStore, Credentials, SessionTokens};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<AuthMaterial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<SessionTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// Credential store backed by a JSON file plus environment variables.
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Environment variable prefix for a slug: `json-api` -> `JSON_API`.
    pub fn env_prefix(slug: &str) -> String {
        slug.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn auth_from_env(slug: &str) -> Option<AuthMaterial> {
        let prefix = Self::env_prefix(slug);
        let var = |suffix: &str| {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .filter(|v| !v.is_empty())
        };

        if let Some(key) = var("API_KEY") {
            return Some(AuthMaterial::ApiKey { key });
        }
        match (var("EMAIL"), var("PASSWORD")) {
            (Some(email), Some(password)) => Some(AuthMaterial::Password { email, password }),
            _ => None,
        }
    }

    async fn load(&self) -> Result<HashMap<String, StoredEntry>, CredentialError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content).map_err(|source| CredentialError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, slug: &str) -> Result<Option<Credentials>, CredentialError> {
        let mut entries = self.load().await?;
        let stored = entries.remove(slug).unwrap_or_default();

        // Environment wins so rotated secrets take effect without editing the file
        let auth = match Self::auth_from_env(slug).or(stored.auth) {
            Some(auth) => auth,
            None => return Ok(None),
        };

        Ok(Some(Credentials {
            auth,
            session: stored.session,
            expires_at: stored.expires_at,
        }))
    }

    async fn put(&self, slug: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let entry = entries.entry(slug.to_string()).or_default();
        if entry.auth.is_some() {
            entry.auth = Some(credentials.auth.clone());
        }
        entry.session = credentials.session.clone();
        entry.expires_at = credentials.expires_at;

        let io_err = |source| CredentialError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(&entries).map_err(|source| {
            CredentialError::Parse {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!("Persisted session for {}", slug);
        Ok(())
    }
}
