//! Distributor scraping strategies and run orchestration.

mod json_api;
mod libdib;
mod runner;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;

pub use json_api::{JsonApiConfig, JsonApiScraper};
pub use libdib::LibDibScraper;
pub use runner::{run, run_paced, PacedRun, RunContext, RunSummary};

use crate::error::ScraperError;
use crate::http::RequestExecutor;
use crate::models::{Distributor, RawProductRecord};

/// One distributor portal.
#[async_trait]
pub trait DistributorScraper: Send + Sync {
    fn slug(&self) -> &str;

    /// Make sure a usable session exists. Failure aborts the run.
    async fn authenticate(&self) -> Result<(), ScraperError>;

    async fn list_categories(&self) -> Result<Vec<String>, ScraperError>;

    /// One page of products. `None` for category lists everything.
    async fn list_products(
        &self,
        category: Option<&str>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<ProductPage, ScraperError>;
}

/// Records mapped from one listing page.
///
/// `rows_seen` counts every row the portal returned, including rows that
/// could not be mapped. Pagination moves by it, not by `records.len()`.
#[derive(Debug, Clone, Default)]
pub struct ProductPage {
    pub records: Vec<RawProductRecord>,
    pub rows_seen: u64,
}

impl ProductPage {
    pub fn new(records: Vec<RawProductRecord>, rows_seen: usize) -> Self {
        Self {
            rows_seen: rows_seen.max(records.len()) as u64,
            records,
        }
    }

    /// Page where every row mapped to a record.
    pub fn mapped(records: Vec<RawProductRecord>) -> Self {
        let rows_seen = records.len();
        Self::new(records, rows_seen)
    }

    pub fn skipped(&self) -> u64 {
        self.rows_seen - self.records.len() as u64
    }
}

/// Builds a scraper for a distributor from its strategy options.
pub type ScraperFactory = Box<
    dyn Fn(
            &Distributor,
            &serde_json::Value,
            Arc<RequestExecutor>,
        ) -> Result<Box<dyn DistributorScraper>, ScraperError>
        + Send
        + Sync,
>;

/// Strategy name to constructor, built once at startup.
pub struct ScraperRegistry {
    factories: HashMap<String, ScraperFactory>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("libdib", |distributor, _options, executor| {
            let scraper: Box<dyn DistributorScraper> =
                Box::new(LibDibScraper::new(distributor.clone(), executor));
            Ok(scraper)
        });
        registry.register("json_api", |distributor, options, executor| {
            let config = JsonApiConfig::from_options(options).map_err(|source| {
                ScraperError::Parse {
                    context: format!("json_api options for {}", distributor.slug),
                    source,
                }
            })?;
            let scraper: Box<dyn DistributorScraper> =
                Box::new(JsonApiScraper::new(distributor.clone(), config, executor));
            Ok(scraper)
        });
        registry
    }

    pub fn register<F>(&mut self, strategy: &str, factory: F)
    where
        F: Fn(
                &Distributor,
                &serde_json::Value,
                Arc<RequestExecutor>,
            ) -> Result<Box<dyn DistributorScraper>, ScraperError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(strategy.to_string(), Box::new(factory));
    }

    pub fn strategies(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn build(
        &self,
        distributor: &Distributor,
        options: &serde_json::Value,
        executor: Arc<RequestExecutor>,
    ) -> Result<Box<dyn DistributorScraper>, ScraperError> {
        let factory = self
            .factories
            .get(&distributor.strategy)
            .ok_or_else(|| ScraperError::UnknownStrategy(distributor.strategy.clone()))?;
        factory(distributor, options, executor)
    }
}

impl Default for ScraperRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Get a live session, forcing a login when none exists yet.
pub(crate) async fn ensure_session(
    executor: &RequestExecutor,
    slug: &str,
) -> Result<(), ScraperError> {
    let sessions = executor.sessions();
    let current = sessions.get_session(slug).await?;
    if current.is_api_key() {
        return Ok(());
    }
    if current.session.is_none() || current.is_expired(Utc::now()) {
        sessions.refresh(slug).await?;
    }
    Ok(())
}

/// Value at a dot-separated path (`data.items.0.name`).
pub fn extract_path<'a>(data: &'a serde_json::Value, path: &str) -> &'a serde_json::Value {
    if path.is_empty() {
        return data;
    }
    let mut current = data;
    for key in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(key).unwrap_or(&serde_json::Value::Null),
            serde_json::Value::Array(arr) => key
                .parse::<usize>()
                .ok()
                .and_then(|idx| arr.get(idx))
                .unwrap_or(&serde_json::Value::Null),
            _ => &serde_json::Value::Null,
        };
    }
    current
}

/// String form of a scalar (numbers and strings).
pub fn scalar_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn price_regex() -> Option<&'static Regex> {
    static PRICE: OnceLock<Option<Regex>> = OnceLock::new();
    PRICE
        .get_or_init(|| Regex::new(r"(\d[\d,]*)(?:\.(\d{1,2}))?").ok())
        .as_ref()
}

/// Price in cents from a JSON number (in currency units) or a display string
/// such as `"$1,299.5"`.
pub fn parse_price_cents(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(|f| (f * 100.0).round() as i64),
        serde_json::Value::String(s) => {
            let caps = price_regex()?.captures(s)?;
            let whole: i64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
            let cents = match caps.get(2).map(|m| m.as_str()) {
                Some(frac) if frac.len() == 1 => frac.parse::<i64>().ok()? * 10,
                Some(frac) => frac.parse::<i64>().ok()?,
                None => 0,
            };
            Some(whole * 100 + cents)
        }
        _ => None,
    }
}
