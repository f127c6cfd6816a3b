//! Configuration loading.
//!
//! A config file is looked up in this order:
//!
//! 1. the path given with `--config`
//! 2. `./shelfsync.toml`
//! 3. `<config_dir>/shelfsync/config.toml`
//!
//! TOML, YAML and JSON are accepted, picked by file extension. With no file
//! the defaults apply. `DATABASE_URL`, `SHELFSYNC_DATA_DIR`,
//! `SHELFSYNC_PROXIES` and `SHELFSYNC_CONCURRENCY` override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::http::{ExecutorConfig, RequestExecutor};
use crate::models::Distributor;
use crate::pacing::PacingConfig;
use crate::proxy::{ProxyConfig, ProxyRotator};
use crate::reconcile::{MatchingError, ReconcileConfig, ReconciliationPipeline, TokenSimilarityMatcher};
use crate::scheduler::{DistributorPlan, Scheduler, SchedulerConfig};
use crate::scrapers::ScraperRegistry;
use crate::session::{
    BrowserLoginConfig, ChromiumLoginDriver, FormLoginConfig, FormLoginDriver, LoginDriver,
    SessionManager, SessionPolicy,
};
use crate::stealth::{ContextOverrides, ScriptDirEvasion, StealthContextFactory};
use crate::storage::StorageGateway;

/// Config file looked for in the working directory.
pub const CONFIG_FILENAME: &str = "shelfsync.toml";
pub const DEFAULT_DATABASE_FILENAME: &str = "shelfsync.db";
pub const CREDENTIALS_FILENAME: &str = "credentials.json";

/// Upper bound for request delays and timeouts.
const MAX_DELAY_SECS: u64 = 3600;
/// Upper bound for proxy blocks, cache lifetimes and session lifetimes.
const MAX_WINDOW_SECS: u64 = 366 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config {path}: {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Distributor '{slug}': {message}")]
    Distributor { slug: String, message: String },

    #[error(transparent)]
    Reconcile(#[from] MatchingError),

    #[error("Failed to create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a distributor's sessions are refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginKind {
    /// Post the portal's HTML login form.
    #[default]
    Form,
    /// Drive a real browser through the login page.
    Browser,
    /// No refresh; API keys or hand-managed sessions.
    None,
}

/// One `[distributors.<slug>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Display name; the slug when unset.
    #[serde(default)]
    pub name: Option<String>,
    pub base_url: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub login: LoginKind,
    #[serde(default)]
    pub session: SessionPolicy,
    #[serde(default)]
    pub form: FormLoginConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub fingerprint: ContextOverrides,
    /// Strategy-specific options, passed through untouched.
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_strategy() -> String {
    "libdib".to_string()
}

fn default_true() -> bool {
    true
}

impl DistributorConfig {
    pub fn to_distributor(&self, slug: &str) -> Distributor {
        let mut distributor = Distributor::new(
            slug,
            self.name.as_deref().unwrap_or(slug),
            &self.base_url,
            &self.strategy,
        );
        distributor.active = self.active;
        distributor
    }

    pub fn plan(&self, slug: &str) -> DistributorPlan {
        DistributorPlan {
            distributor: self.to_distributor(slug),
            pacing: self.pacing,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where the database and credentials live by default.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub proxies: ProxyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub browser: BrowserLoginConfig,
    #[serde(default)]
    pub distributors: BTreeMap<String, DistributorConfig>,
    /// File this config was read from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Find the config file to use, if any.
    pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let local = PathBuf::from(CONFIG_FILENAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("shelfsync").join("config.toml"))
            .filter(|p| p.is_file())
    }

    /// Discover, load and apply environment overrides.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::discover(explicit) {
            Some(path) => {
                info!("Loading config from {}", path.display());
                Self::load_from_path(&path).await?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, picking the format from its extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let mut config = Self::parse(&contents, ext).map_err(|(format, message)| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                format,
                message,
            }
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(contents: &str, ext: &str) -> Result<Self, (&'static str, String)> {
        match ext {
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ("YAML", e.to_string())),
            "json" => serde_json::from_str(contents).map_err(|e| ("JSON", e.to_string())),
            _ => toml::from_str(contents).map_err(|e| ("TOML", e.to_string())),
        }
    }

    /// Relative paths in the file are relative to the file's directory.
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.data_dir.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.credentials_path.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.browser.evasion_dir.as_mut() {
            resolve(p);
        }
    }

    /// Apply environment overrides through `var`.
    pub fn apply_env_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(dir) = var("SHELFSYNC_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(list) = var("SHELFSYNC_PROXIES") {
            self.proxies.urls = list
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if let Some(value) = var("SHELFSYNC_CONCURRENCY") {
            self.scheduler.concurrency = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidEnv {
                    var: "SHELFSYNC_CONCURRENCY".to_string(),
                    value,
                })?;
        }
        Ok(())
    }

    /// Check everything that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconcile.validate()?;
        self.validate_limits()?;
        for (slug, distributor) in &self.distributors {
            let invalid = |message: String| ConfigError::Distributor {
                slug: slug.clone(),
                message,
            };
            let url = Url::parse(&distributor.base_url)
                .map_err(|e| invalid(format!("invalid base_url '{}': {}", distributor.base_url, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
            }
            if distributor.pacing.page_size == 0 {
                return Err(invalid("page_size must be positive".to_string()));
            }
            let ttl = distributor.session.ttl_minutes;
            if ttl <= 0 || ttl as u64 > MAX_WINDOW_SECS / 60 {
                return Err(invalid(format!(
                    "session ttl_minutes must be between 1 and {}, got {}",
                    MAX_WINDOW_SECS / 60,
                    ttl
                )));
            }
        }
        Ok(())
    }

    /// Numeric executor and proxy settings that feed timers and randomness.
    fn validate_limits(&self) -> Result<(), ConfigError> {
        let e = &self.executor;
        let p = &self.proxies;
        let ratio = |field: &'static str, value: f64| {
            if value.is_finite() && (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    message: format!("expected a number between 0 and 1, got {}", value),
                })
            }
        };
        let at_most = |field: &'static str, value: u64, max: u64| {
            if value <= max {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    message: format!("{} exceeds the maximum of {}", value, max),
                })
            }
        };

        ratio("executor.jitter_ratio", e.jitter_ratio)?;
        at_most("executor.base_delay_ms", e.base_delay_ms, MAX_DELAY_SECS * 1000)?;
        at_most("executor.backoff_base_ms", e.backoff_base_ms, MAX_DELAY_SECS * 1000)?;
        at_most("executor.max_delay_ms", e.max_delay_ms, MAX_DELAY_SECS * 1000)?;
        at_most("executor.timeout_secs", e.timeout_secs, MAX_DELAY_SECS)?;
        at_most("executor.cache_ttl_secs", e.cache_ttl_secs, MAX_WINDOW_SECS)?;
        ratio("proxies.min_success_rate", p.min_success_rate)?;
        at_most("proxies.block_duration_secs", p.block_duration_secs, MAX_WINDOW_SECS)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("shelfsync")))
            .unwrap_or_else(|| PathBuf::from(".shelfsync"))
    }

    /// `DATABASE_URL` or `<data_dir>/shelfsync.db`.
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            self.data_dir()
                .join(DEFAULT_DATABASE_FILENAME)
                .display()
                .to_string()
        })
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join(CREDENTIALS_FILENAME))
    }

    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        let dir = self.data_dir();
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Directory {
            path: dir.clone(),
            source,
        })
    }

    pub fn credential_store(&self) -> FileCredentialStore {
        FileCredentialStore::new(self.credentials_path())
    }

    pub fn stealth(&self) -> StealthContextFactory {
        match &self.browser.evasion_dir {
            Some(dir) => StealthContextFactory::with_provider(Arc::new(ScriptDirEvasion::new(dir))),
            None => StealthContextFactory::new(),
        }
    }

    /// Session manager with a refresh strategy per configured distributor.
    pub fn session_manager(&self, store: Arc<dyn CredentialStore>) -> SessionManager {
        let stealth = self.stealth();
        let mut sessions = SessionManager::new(store, stealth.clone());

        for (slug, cfg) in &self.distributors {
            let driver: Arc<dyn LoginDriver> = match cfg.login {
                LoginKind::Form => Arc::new(FormLoginDriver::new(cfg.form.clone())),
                LoginKind::Browser => Arc::new(ChromiumLoginDriver::new(
                    self.browser.clone(),
                    stealth.clone(),
                )),
                LoginKind::None => continue,
            };
            let login_url = cfg.to_distributor(slug).url(&cfg.session.login_path);
            sessions.register_login(slug, &login_url, cfg.session.clone(), driver);
            if cfg.fingerprint != ContextOverrides::default() {
                sessions.set_overrides(slug, cfg.fingerprint.clone());
            }
        }
        sessions
    }

    /// Wire the whole acquisition stack around `storage` and `store`.
    pub fn scheduler(
        &self,
        storage: Arc<dyn StorageGateway>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Scheduler, ConfigError> {
        let sessions = Arc::new(self.session_manager(store));
        let executor = Arc::new(RequestExecutor::new(
            self.executor.clone(),
            sessions,
            ProxyRotator::new(self.proxies.clone()),
        ));
        let pipeline = Arc::new(ReconciliationPipeline::new(
            storage.clone(),
            Arc::new(TokenSimilarityMatcher),
            self.reconcile.clone(),
        )?);

        let mut scheduler = Scheduler::new(
            storage,
            executor,
            Arc::new(ScraperRegistry::with_defaults()),
            pipeline,
            self.scheduler.clone(),
        );
        for (slug, cfg) in &self.distributors {
            scheduler.add_distributor(cfg.plan(slug));
        }
        Ok(scheduler)
    }
}
