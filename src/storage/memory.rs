//! In-memory storage gateway.
//!
//! Lock-based and not persisted across restarts. Used for tests and
//! `--dry-run` sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{name_tokens, rank_candidates, StorageError, StorageGateway, StorageResult};
use crate::models::{
    CanonicalProduct, Distributor, InventoryHistory, MatchQueueItem, MatchStatus, PriceHistory,
    ProductAlias, RawProductRecord, RunStatus, ScrapeErrorRecord, ScrapeRun,
};
use crate::pacing::ScrapePacingState;

#[derive(Default)]
struct State {
    distributors: HashMap<String, Distributor>,
    pacing: HashMap<(String, NaiveDate), ScrapePacingState>,
    raw: HashMap<String, RawProductRecord>,
    aliases: HashMap<(String, String), ProductAlias>,
    /// Insertion order is kept so "most recent" is well defined.
    products: Vec<CanonicalProduct>,
    prices: Vec<PriceHistory>,
    inventory: Vec<InventoryHistory>,
    queue: Vec<MatchQueueItem>,
    runs: Vec<ScrapeRun>,
    run_errors: Vec<ScrapeErrorRecord>,
}

/// In-memory storage gateway.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw records stored (all observations, processed or not).
    pub async fn raw_record_count(&self) -> usize {
        self.state.read().await.raw.len()
    }

    /// All queue items regardless of status.
    pub async fn all_matches(&self) -> Vec<MatchQueueItem> {
        self.state.read().await.queue.clone()
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn upsert_distributor(&self, distributor: &Distributor) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state
            .distributors
            .insert(distributor.slug.clone(), distributor.clone());
        Ok(())
    }

    async fn get_distributor(&self, slug: &str) -> StorageResult<Option<Distributor>> {
        Ok(self.state.read().await.distributors.get(slug).cloned())
    }

    async fn list_distributors(&self) -> StorageResult<Vec<Distributor>> {
        let state = self.state.read().await;
        let mut all: Vec<Distributor> = state.distributors.values().cloned().collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(all)
    }

    async fn get_pacing_state(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<ScrapePacingState>> {
        let state = self.state.read().await;
        Ok(state.pacing.get(&(slug.to_string(), date)).cloned())
    }

    async fn save_pacing_state(&self, pacing: &ScrapePacingState) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.pacing.insert(
            (pacing.distributor_slug.clone(), pacing.date),
            pacing.clone(),
        );
        Ok(())
    }

    async fn insert_raw_record(&self, record: &RawProductRecord) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.raw.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "raw record {} already stored",
                record.id
            )));
        }
        state.raw.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_raw_record(&self, id: &str) -> StorageResult<Option<RawProductRecord>> {
        Ok(self.state.read().await.raw.get(id).cloned())
    }

    async fn mark_raw_processed(&self, id: &str, product_id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .raw
            .get_mut(id)
            .ok_or_else(|| StorageError::Corrupt(format!("raw record {} not found", id)))?;
        record.processed = true;
        record.product_id = Some(product_id.to_string());
        Ok(())
    }

    async fn get_alias(
        &self,
        source: &str,
        external_id: &str,
    ) -> StorageResult<Option<ProductAlias>> {
        let state = self.state.read().await;
        Ok(state
            .aliases
            .get(&(source.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn insert_alias(&self, alias: &ProductAlias) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let key = (alias.source.clone(), alias.external_id.clone());
        if state.aliases.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "alias {}:{} already exists",
                alias.source, alias.external_id
            )));
        }
        state.aliases.insert(key, alias.clone());
        Ok(())
    }

    async fn insert_product(&self, product: &CanonicalProduct) -> StorageResult<()> {
        self.state.write().await.products.push(product.clone());
        Ok(())
    }

    async fn get_product(&self, id: &str) -> StorageResult<Option<CanonicalProduct>> {
        let state = self.state.read().await;
        Ok(state.products.iter().find(|p| p.id == id).cloned())
    }

    async fn candidate_products(
        &self,
        name: &str,
        brand: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<CanonicalProduct>> {
        let wanted = name_tokens(name);
        let state = self.state.read().await;
        let scored = state
            .products
            .iter()
            .filter_map(|p| {
                let shared = name_tokens(&p.name)
                    .iter()
                    .filter(|t| wanted.binary_search(*t).is_ok())
                    .count();
                (shared > 0).then(|| (shared, p.clone()))
            })
            .collect();
        Ok(rank_candidates(scored, brand, limit))
    }

    async fn count_products(&self) -> StorageResult<u64> {
        Ok(self.state.read().await.products.len() as u64)
    }

    async fn append_price(&self, row: &PriceHistory) -> StorageResult<()> {
        self.state.write().await.prices.push(row.clone());
        Ok(())
    }

    async fn append_inventory(&self, row: &InventoryHistory) -> StorageResult<()> {
        self.state.write().await.inventory.push(row.clone());
        Ok(())
    }

    async fn price_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<PriceHistory>> {
        let state = self.state.read().await;
        Ok(state
            .prices
            .iter()
            .filter(|p| p.product_id == product_id && p.distributor_slug == distributor_slug)
            .cloned()
            .collect())
    }

    async fn inventory_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<InventoryHistory>> {
        let state = self.state.read().await;
        Ok(state
            .inventory
            .iter()
            .filter(|i| i.product_id == product_id && i.distributor_slug == distributor_slug)
            .cloned()
            .collect())
    }

    async fn enqueue_match(&self, item: &MatchQueueItem) -> StorageResult<()> {
        self.state.write().await.queue.push(item.clone());
        Ok(())
    }

    async fn pending_matches(&self, limit: usize) -> StorageResult<Vec<MatchQueueItem>> {
        let state = self.state.read().await;
        Ok(state
            .queue
            .iter()
            .filter(|q| q.status == MatchStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_run(&self, run: &ScrapeRun) -> StorageResult<()> {
        self.state.write().await.runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &ScrapeRun) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| StorageError::Corrupt(format!("run {} not found", run.id)))?;
        *existing = run.clone();
        Ok(())
    }

    async fn mark_run_failed(&self, run_id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<Option<ScrapeRun>> {
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn recent_runs(&self, slug: &str, limit: usize) -> StorageResult<Vec<ScrapeRun>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.distributor_slug == slug)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_run_error(&self, error: &ScrapeErrorRecord) -> StorageResult<()> {
        self.state.write().await.run_errors.push(error.clone());
        Ok(())
    }

    async fn run_errors(&self, run_id: &str) -> StorageResult<Vec<ScrapeErrorRecord>> {
        let state = self.state.read().await;
        Ok(state
            .run_errors
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alias_is_unique_per_source_and_external_id() {
        let storage = MemoryStorage::new();
        storage
            .insert_alias(&ProductAlias::new("libdib", "42", "p1", 1.0))
            .await
            .unwrap();

        let dup = storage
            .insert_alias(&ProductAlias::new("libdib", "42", "p2", 0.9))
            .await;
        assert!(matches!(dup, Err(StorageError::Conflict(_))));

        // Same external id on another source is a different alias
        storage
            .insert_alias(&ProductAlias::new("provi", "42", "p2", 0.9))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn candidates_share_a_name_token_and_prefer_the_brand() {
        let storage = MemoryStorage::new();
        let mut a = CanonicalProduct::from_raw(&RawProductRecord::new(
            "libdib",
            "1",
            "Reposado",
            serde_json::json!({}),
        ));
        a.brand = Some("Casa  Dragones".into());
        let mut b = a.clone();
        b.id = "other".into();
        b.brand = Some("Del Maguey".into());
        b.created_at = a.created_at + chrono::Duration::seconds(1);
        let mut c = b.clone();
        c.id = "unrelated".into();
        c.name = "London Dry Gin".into();
        for p in [&a, &b, &c] {
            storage.insert_product(p).await.unwrap();
        }

        let found = storage
            .candidate_products("reposado", Some("casa dragones"), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, a.id);

        let unbranded = storage
            .candidate_products("Reposado", None, 10)
            .await
            .unwrap();
        assert_eq!(unbranded[0].id, "other"); // newest first on a tie
        assert!(storage
            .candidate_products("Blanco", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn old_product_outranks_a_large_newer_catalog() {
        let storage = MemoryStorage::new();
        let old = CanonicalProduct::from_raw(&RawProductRecord::new(
            "provi",
            "1",
            "Old Forester Rye Whiskey",
            serde_json::json!({}),
        ));
        storage.insert_product(&old).await.unwrap();
        for i in 0..50 {
            let name = format!("Filler Item {}", i);
            let raw = RawProductRecord::new("provi", &name, &name, serde_json::json!({}));
            storage
                .insert_product(&CanonicalProduct::from_raw(&raw))
                .await
                .unwrap();
        }

        let found = storage
            .candidate_products("Old Forester Rye Whiskey", None, 5)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, old.id);
    }

    #[tokio::test]
    async fn mark_run_failed_closes_running_run() {
        let storage = MemoryStorage::new();
        let run = ScrapeRun::start("libdib");
        storage.create_run(&run).await.unwrap();
        storage.mark_run_failed(&run.id).await.unwrap();

        let stored = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.completed_at.is_some());
    }
}
