//! Storage gateway for catalog, pacing and audit data.
//!
//! The core only needs create, point lookup and append operations, so the
//! gateway is a trait with an in-memory implementation for tests and dry
//! runs and a Diesel/SQLite implementation for real deployments.

mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{
    CanonicalProduct, Distributor, InventoryHistory, MatchQueueItem, PriceHistory,
    ProductAlias, RawProductRecord, ScrapeErrorRecord, ScrapeRun,
};
use crate::pacing::ScrapePacingState;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence operations required by the acquisition pipeline.
///
/// Implementations must be safe to share across concurrent distributor tasks.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    // Distributors
    async fn upsert_distributor(&self, distributor: &Distributor) -> StorageResult<()>;
    async fn get_distributor(&self, slug: &str) -> StorageResult<Option<Distributor>>;
    async fn list_distributors(&self) -> StorageResult<Vec<Distributor>>;

    // Pacing, unique on (slug, date)
    async fn get_pacing_state(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<ScrapePacingState>>;
    async fn save_pacing_state(&self, state: &ScrapePacingState) -> StorageResult<()>;

    // Raw observations
    async fn insert_raw_record(&self, record: &RawProductRecord) -> StorageResult<()>;
    async fn get_raw_record(&self, id: &str) -> StorageResult<Option<RawProductRecord>>;
    async fn mark_raw_processed(&self, id: &str, product_id: &str) -> StorageResult<()>;

    // Catalog
    async fn get_alias(
        &self,
        source: &str,
        external_id: &str,
    ) -> StorageResult<Option<ProductAlias>>;
    /// Fails with `Conflict` if `(source, external_id)` already has an alias.
    async fn insert_alias(&self, alias: &ProductAlias) -> StorageResult<()>;
    async fn insert_product(&self, product: &CanonicalProduct) -> StorageResult<()>;
    async fn get_product(&self, id: &str) -> StorageResult<Option<CanonicalProduct>>;
    /// Products worth scoring against an observation named `name`.
    ///
    /// Only products sharing at least one [`name_tokens`] token qualify. The
    /// most shared tokens come first, then same brand, then the newest.
    async fn candidate_products(
        &self,
        name: &str,
        brand: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<CanonicalProduct>>;
    async fn count_products(&self) -> StorageResult<u64>;

    // Append-only history
    async fn append_price(&self, row: &PriceHistory) -> StorageResult<()>;
    async fn append_inventory(&self, row: &InventoryHistory) -> StorageResult<()>;
    async fn price_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<PriceHistory>>;
    async fn inventory_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<InventoryHistory>>;

    // Review queue
    async fn enqueue_match(&self, item: &MatchQueueItem) -> StorageResult<()>;
    async fn pending_matches(&self, limit: usize) -> StorageResult<Vec<MatchQueueItem>>;

    // Run audit trail
    async fn create_run(&self, run: &ScrapeRun) -> StorageResult<()>;
    async fn update_run(&self, run: &ScrapeRun) -> StorageResult<()>;
    /// Minimal write used when a full `update_run` failed.
    async fn mark_run_failed(&self, run_id: &str) -> StorageResult<()>;
    async fn get_run(&self, run_id: &str) -> StorageResult<Option<ScrapeRun>>;
    async fn recent_runs(&self, slug: &str, limit: usize) -> StorageResult<Vec<ScrapeRun>>;
    async fn add_run_error(&self, error: &ScrapeErrorRecord) -> StorageResult<()>;
    async fn run_errors(&self, run_id: &str) -> StorageResult<Vec<ScrapeErrorRecord>>;
}

/// Words that say nothing about which product it is.
const STOPWORDS: &[&str] = &["the", "and", "of", "a", "by", "with", "ml", "l", "oz"];

/// Lowercased alphanumeric words of a product name, sorted and deduplicated.
pub fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens: Vec<String> = name
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Order `(shared tokens, product)` pairs for [`StorageGateway::candidate_products`].
pub(crate) fn rank_candidates(
    mut scored: Vec<(usize, CanonicalProduct)>,
    brand: Option<&str>,
    limit: usize,
) -> Vec<CanonicalProduct> {
    let wanted = brand.map(brand_key);
    let same_brand = |p: &CanonicalProduct| {
        wanted.is_some() && p.brand.as_deref().map(brand_key) == wanted
    };
    scored.sort_by(|(a_shared, a), (b_shared, b)| {
        b_shared
            .cmp(a_shared)
            .then_with(|| same_brand(b).cmp(&same_brand(a)))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    scored.into_iter().take(limit).map(|(_, p)| p).collect()
}

/// Lowercased, whitespace-collapsed brand used for candidate lookup.
pub(crate) fn brand_key(brand: &str) -> String {
    brand
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
