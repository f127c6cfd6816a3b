//! Diesel-backed SQLite storage.
//!
//! Uses diesel-async's SyncConnectionWrapper for an async interface. SQLite
//! connections are cheap, so a fresh connection is opened per operation
//! with a busy timeout so concurrent distributor tasks queue on the write
//! lock instead of failing.

mod records;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};
use tracing::debug;

use self::records::*;
use super::{name_tokens, rank_candidates, StorageError, StorageGateway, StorageResult};
use crate::models::{
    CanonicalProduct, Distributor, InventoryHistory, MatchQueueItem, MatchStatus, PriceHistory,
    ProductAlias, RawProductRecord, RunStatus, ScrapeErrorRecord, ScrapeRun,
};
use crate::pacing::ScrapePacingState;
use crate::schema::{
    distributors, inventory_history, match_queue, price_history, product_aliases, product_tokens,
    products, raw_product_records, scrape_errors, scrape_pacing_state, scrape_runs,
};

/// Async SQLite connection.
pub type AsyncSqliteConnection = SyncConnectionWrapper<SqliteConnection>;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Table definitions applied by [`SqliteStorage::init_schema`].
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS distributors (
    slug TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    strategy TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scrape_pacing_state (
    distributor_slug TEXT NOT NULL,
    date TEXT NOT NULL,
    items_scraped BIGINT NOT NULL DEFAULT 0,
    daily_limit BIGINT NOT NULL,
    last_offset BIGINT NOT NULL DEFAULT 0,
    last_category TEXT,
    sessions_today INTEGER NOT NULL DEFAULT 0,
    last_session_at TEXT,
    PRIMARY KEY (distributor_slug, date)
);

CREATE TABLE IF NOT EXISTS raw_product_records (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL,
    source TEXT NOT NULL,
    payload TEXT NOT NULL,
    scrape_run_id TEXT,
    name TEXT NOT NULL,
    brand TEXT,
    category TEXT,
    price_cents BIGINT,
    stock_quantity BIGINT,
    in_stock INTEGER,
    observed_at TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    product_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_raw_source_external
    ON raw_product_records(source, external_id);

CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    brand TEXT,
    brand_key TEXT,
    category TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_products_brand_key ON products(brand_key);

CREATE TABLE IF NOT EXISTS product_tokens (
    token TEXT NOT NULL,
    product_id TEXT NOT NULL REFERENCES products(id),
    PRIMARY KEY (token, product_id)
);

CREATE TABLE IF NOT EXISTS product_aliases (
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    product_id TEXT NOT NULL REFERENCES products(id),
    confidence DOUBLE NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source, external_id)
);

CREATE TABLE IF NOT EXISTS price_history (
    id TEXT PRIMARY KEY,
    product_id TEXT NOT NULL,
    distributor_slug TEXT NOT NULL,
    price_cents BIGINT NOT NULL,
    observed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_price_product ON price_history(product_id, distributor_slug);

CREATE TABLE IF NOT EXISTS inventory_history (
    id TEXT PRIMARY KEY,
    product_id TEXT NOT NULL,
    distributor_slug TEXT NOT NULL,
    quantity BIGINT,
    in_stock INTEGER NOT NULL,
    observed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inventory_product
    ON inventory_history(product_id, distributor_slug);

CREATE TABLE IF NOT EXISTS match_queue (
    id TEXT PRIMARY KEY,
    raw_record_id TEXT NOT NULL,
    candidate_product_id TEXT NOT NULL,
    confidence DOUBLE NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_match_queue_status ON match_queue(status);

CREATE TABLE IF NOT EXISTS scrape_runs (
    id TEXT PRIMARY KEY,
    distributor_slug TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    products_found BIGINT NOT NULL DEFAULT 0,
    pages_fetched BIGINT NOT NULL DEFAULT 0,
    error_count BIGINT NOT NULL DEFAULT 0,
    matched BIGINT NOT NULL DEFAULT 0,
    created BIGINT NOT NULL DEFAULT 0,
    queued BIGINT NOT NULL DEFAULT 0,
    failed BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_runs_distributor ON scrape_runs(distributor_slug, started_at);

CREATE TABLE IF NOT EXISTS scrape_errors (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    category TEXT,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    occurred_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_run ON scrape_errors(run_id);
"#;

/// Map a unique-constraint violation to `Conflict`.
fn conflict_or(err: DieselError, what: impl FnOnce() -> String) -> StorageError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            StorageError::Conflict(what())
        }
        other => StorageError::Database(other),
    }
}

/// SQLite storage gateway.
#[derive(Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    /// Create a gateway for a database URL or file path.
    pub fn new(database_url: &str) -> Self {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        let url = url.strip_prefix("//").unwrap_or(url);
        Self {
            database_url: url.to_string(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string())
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Open a connection with the busy timeout applied.
    pub async fn connect(&self) -> StorageResult<AsyncSqliteConnection> {
        let mut conn = AsyncSqliteConnection::establish(&self.database_url)
            .await
            .map_err(|e| StorageError::Connection(format!("{}: {}", self.database_url, e)))?;
        conn.batch_execute(&format!("PRAGMA busy_timeout = {};", BUSY_TIMEOUT_MS))
            .await?;
        Ok(conn)
    }

    /// Create all tables if they do not exist.
    pub async fn init_schema(&self) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        conn.batch_execute("PRAGMA journal_mode = WAL;").await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        let indexed = self.index_product_tokens(&mut conn).await?;
        if indexed > 0 {
            debug!("Indexed names of {} existing products", indexed);
        }
        debug!("Schema ready at {}", self.database_url);
        Ok(())
    }

    /// Add name-token rows for products that have none.
    async fn index_product_tokens(&self, conn: &mut AsyncSqliteConnection) -> StorageResult<usize> {
        let missing: Vec<ProductRecord> = products::table
            .filter(diesel::dsl::not(
                products::id.eq_any(product_tokens::table.select(product_tokens::product_id)),
            ))
            .select(ProductRecord::as_select())
            .load(conn)
            .await?;

        let mut indexed = 0;
        for product in &missing {
            let rows = ProductTokenRecord::for_product(&product.id, &product.name);
            if rows.is_empty() {
                continue;
            }
            for row in &rows {
                diesel::insert_or_ignore_into(product_tokens::table)
                    .values(row)
                    .execute(conn)
                    .await?;
            }
            indexed += 1;
        }
        Ok(indexed)
    }
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn upsert_distributor(&self, distributor: &Distributor) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::replace_into(distributors::table)
            .values(DistributorRecord::from(distributor))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_distributor(&self, slug: &str) -> StorageResult<Option<Distributor>> {
        let mut conn = self.connect().await?;
        Ok(distributors::table
            .find(slug)
            .select(DistributorRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(Distributor::from))
    }

    async fn list_distributors(&self) -> StorageResult<Vec<Distributor>> {
        let mut conn = self.connect().await?;
        let records = distributors::table
            .order(distributors::slug.asc())
            .select(DistributorRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(Distributor::from).collect())
    }

    async fn get_pacing_state(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<ScrapePacingState>> {
        let mut conn = self.connect().await?;
        let date = date.format(DATE_FORMAT).to_string();
        scrape_pacing_state::table
            .find((slug, date.as_str()))
            .select(PacingRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(ScrapePacingState::try_from)
            .transpose()
    }

    async fn save_pacing_state(&self, state: &ScrapePacingState) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::replace_into(scrape_pacing_state::table)
            .values(PacingRecord::from(state))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_raw_record(&self, record: &RawProductRecord) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        let row = RawRecordRow::try_from(record)?;
        diesel::insert_into(raw_product_records::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(|e| conflict_or(e, || format!("raw record {} already stored", record.id)))?;
        Ok(())
    }

    async fn get_raw_record(&self, id: &str) -> StorageResult<Option<RawProductRecord>> {
        let mut conn = self.connect().await?;
        Ok(raw_product_records::table
            .find(id)
            .select(RawRecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(RawProductRecord::from))
    }

    async fn mark_raw_processed(&self, id: &str, product_id: &str) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        let rows = diesel::update(raw_product_records::table.find(id))
            .set((
                raw_product_records::processed.eq(1),
                raw_product_records::product_id.eq(Some(product_id)),
            ))
            .execute(&mut conn)
            .await?;
        if rows == 0 {
            return Err(StorageError::Corrupt(format!("raw record {} not found", id)));
        }
        Ok(())
    }

    async fn get_alias(
        &self,
        source: &str,
        external_id: &str,
    ) -> StorageResult<Option<ProductAlias>> {
        let mut conn = self.connect().await?;
        Ok(product_aliases::table
            .find((source, external_id))
            .select(AliasRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(ProductAlias::from))
    }

    async fn insert_alias(&self, alias: &ProductAlias) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(product_aliases::table)
            .values(AliasRecord::from(alias))
            .execute(&mut conn)
            .await
            .map_err(|e| {
                conflict_or(e, || {
                    format!("alias {}:{} already exists", alias.source, alias.external_id)
                })
            })?;
        Ok(())
    }

    async fn insert_product(&self, product: &CanonicalProduct) -> StorageResult<()> {
        let record = ProductRecord::from(product);
        let tokens = ProductTokenRecord::for_product(&product.id, &product.name);
        let mut conn = self.connect().await?;
        conn.transaction(|conn| {
            Box::pin(async move {
                diesel::insert_into(products::table)
                    .values(&record)
                    .execute(conn)
                    .await?;
                for row in &tokens {
                    diesel::insert_or_ignore_into(product_tokens::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }
                Ok::<_, StorageError>(())
            })
        })
        .await
    }

    async fn get_product(&self, id: &str) -> StorageResult<Option<CanonicalProduct>> {
        let mut conn = self.connect().await?;
        Ok(products::table
            .find(id)
            .select(ProductRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(CanonicalProduct::from))
    }

    async fn candidate_products(
        &self,
        name: &str,
        brand: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<CanonicalProduct>> {
        let tokens = name_tokens(name);
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connect().await?;
        let hits: Vec<String> = product_tokens::table
            .filter(product_tokens::token.eq_any(tokens))
            .select(product_tokens::product_id)
            .load(&mut conn)
            .await?;

        let mut shared: HashMap<String, usize> = HashMap::new();
        for id in hits {
            *shared.entry(id).or_default() += 1;
        }
        let mut ranked: Vec<(&String, usize)> = shared.iter().map(|(id, n)| (id, *n)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let ids: Vec<String> = ranked
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();

        let records: Vec<ProductRecord> = products::table
            .filter(products::id.eq_any(ids))
            .select(ProductRecord::as_select())
            .load(&mut conn)
            .await?;
        let scored = records
            .into_iter()
            .map(|r| (shared.get(&r.id).copied().unwrap_or(0), CanonicalProduct::from(r)))
            .collect();
        Ok(rank_candidates(scored, brand, limit))
    }

    async fn count_products(&self) -> StorageResult<u64> {
        let mut conn = self.connect().await?;
        let count: i64 = products::table.count().get_result(&mut conn).await?;
        Ok(count.max(0) as u64)
    }

    async fn append_price(&self, row: &PriceHistory) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(price_history::table)
            .values(PriceRecord::from(row))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn append_inventory(&self, row: &InventoryHistory) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(inventory_history::table)
            .values(InventoryRecord::from(row))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn price_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<PriceHistory>> {
        let mut conn = self.connect().await?;
        let records = price_history::table
            .filter(price_history::product_id.eq(product_id))
            .filter(price_history::distributor_slug.eq(distributor_slug))
            .order(price_history::observed_at.asc())
            .select(PriceRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(PriceHistory::from).collect())
    }

    async fn inventory_history(
        &self,
        product_id: &str,
        distributor_slug: &str,
    ) -> StorageResult<Vec<InventoryHistory>> {
        let mut conn = self.connect().await?;
        let records = inventory_history::table
            .filter(inventory_history::product_id.eq(product_id))
            .filter(inventory_history::distributor_slug.eq(distributor_slug))
            .order(inventory_history::observed_at.asc())
            .select(InventoryRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(InventoryHistory::from).collect())
    }

    async fn enqueue_match(&self, item: &MatchQueueItem) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(match_queue::table)
            .values(MatchQueueRecord::from(item))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_matches(&self, limit: usize) -> StorageResult<Vec<MatchQueueItem>> {
        let mut conn = self.connect().await?;
        let records = match_queue::table
            .filter(match_queue::status.eq(MatchStatus::Pending.as_str()))
            .order(match_queue::created_at.asc())
            .limit(limit as i64)
            .select(MatchQueueRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(MatchQueueItem::from).collect())
    }

    async fn create_run(&self, run: &ScrapeRun) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(scrape_runs::table)
            .values(RunRecord::from(run))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_run(&self, run: &ScrapeRun) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        let rows = diesel::update(scrape_runs::table.find(&run.id))
            .set(&RunRecord::from(run))
            .execute(&mut conn)
            .await?;
        if rows == 0 {
            return Err(StorageError::Corrupt(format!("run {} not found", run.id)));
        }
        Ok(())
    }

    async fn mark_run_failed(&self, run_id: &str) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        let now = format_ts(&Utc::now());
        diesel::update(scrape_runs::table.find(run_id))
            .set((
                scrape_runs::status.eq(RunStatus::Failed.as_str()),
                scrape_runs::completed_at.eq(Some(now)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<Option<ScrapeRun>> {
        let mut conn = self.connect().await?;
        Ok(scrape_runs::table
            .find(run_id)
            .select(RunRecord::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(ScrapeRun::from))
    }

    async fn recent_runs(&self, slug: &str, limit: usize) -> StorageResult<Vec<ScrapeRun>> {
        let mut conn = self.connect().await?;
        let records = scrape_runs::table
            .filter(scrape_runs::distributor_slug.eq(slug))
            .order(scrape_runs::started_at.desc())
            .limit(limit as i64)
            .select(RunRecord::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(ScrapeRun::from).collect())
    }

    async fn add_run_error(&self, error: &ScrapeErrorRecord) -> StorageResult<()> {
        let mut conn = self.connect().await?;
        diesel::insert_into(scrape_errors::table)
            .values(ScrapeErrorRow::from(error))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn run_errors(&self, run_id: &str) -> StorageResult<Vec<ScrapeErrorRecord>> {
        let mut conn = self.connect().await?;
        let records = scrape_errors::table
            .filter(scrape_errors::run_id.eq(run_id))
            .order(scrape_errors::occurred_at.asc())
            .select(ScrapeErrorRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(records.into_iter().map(ScrapeErrorRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_test_db() -> (SqliteStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::from_path(&dir.path().join("test.db"));
        storage.init_schema().await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let (storage, _dir) = setup_test_db().await;
        storage.init_schema().await.unwrap();
        assert_eq!(storage.count_products().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_distributor_upsert() {
        let (storage, _dir) = setup_test_db().await;
        let mut d = Distributor::new("libdib", "LibDib", "https://app.libdib.com/", "libdib");
        storage.upsert_distributor(&d).await.unwrap();

        d.active = false;
        storage.upsert_distributor(&d).await.unwrap();

        let all = storage.list_distributors().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].active);
        assert_eq!(all[0].base_url, "https://app.libdib.com");
    }

    #[tokio::test]
    async fn test_pacing_state_round_trip() {
        let (storage, _dir) = setup_test_db().await;
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert!(storage
            .get_pacing_state("libdib", date)
            .await
            .unwrap()
            .is_none());

        let mut state = ScrapePacingState::new("libdib", date, 150);
        state.items_scraped = 120;
        state.last_category = Some("spirits".into());
        state.last_offset = 60;
        state.sessions_today = 1;
        state.last_session_at = Some(Utc::now());
        storage.save_pacing_state(&state).await.unwrap();

        state.items_scraped = 180;
        storage.save_pacing_state(&state).await.unwrap();

        let stored = storage
            .get_pacing_state("libdib", date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.items_scraped, 180);
        assert_eq!(stored.last_category.as_deref(), Some("spirits"));
        assert_eq!(stored.last_offset, 60);

        // Other days are separate rows
        let tomorrow = date.succ_opt().unwrap();
        assert!(storage
            .get_pacing_state("libdib", tomorrow)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_alias_conflict() {
        let (storage, _dir) = setup_test_db().await;
        let raw = RawProductRecord::new("libdib", "42", "Mezcal", serde_json::json!({}));
        let product = CanonicalProduct::from_raw(&raw);
        storage.insert_product(&product).await.unwrap();

        let alias = ProductAlias::new("libdib", "42", &product.id, 1.0);
        storage.insert_alias(&alias).await.unwrap();
        let err = storage.insert_alias(&alias).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let found = storage.get_alias("libdib", "42").await.unwrap().unwrap();
        assert_eq!(found.product_id, product.id);
    }

    #[tokio::test]
    async fn test_raw_record_processing() {
        let (storage, _dir) = setup_test_db().await;
        let raw = RawProductRecord::new(
            "libdib",
            "42",
            "Mezcal",
            serde_json::json!({"sku": "42", "price": "$31.50"}),
        )
        .with_price_cents(Some(3150))
        .with_stock(Some(3), None);
        storage.insert_raw_record(&raw).await.unwrap();
        storage.mark_raw_processed(&raw.id, "p1").await.unwrap();

        let stored = storage.get_raw_record(&raw.id).await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.product_id.as_deref(), Some("p1"));
        assert_eq!(stored.payload["price"], "$31.50");
        assert_eq!(stored.in_stock, Some(true));
    }

    #[tokio::test]
    async fn test_candidates_by_name_tokens() {
        let (storage, _dir) = setup_test_db().await;
        for (name, brand) in [
            ("Reposado", "Casa Dragones"),
            ("Vida Mezcal", "Del Maguey"),
            ("Reposado Tequila", "Fortaleza"),
        ] {
            let raw = RawProductRecord::new("libdib", name, name, serde_json::json!({}))
                .with_brand(Some(brand.into()));
            storage
                .insert_product(&CanonicalProduct::from_raw(&raw))
                .await
                .unwrap();
        }

        let found = storage
            .candidate_products("Reposado", Some("CASA DRAGONES"), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "Reposado");

        let found = storage
            .candidate_products("Fortaleza Reposado Tequila", None, 10)
            .await
            .unwrap();
        assert_eq!(found[0].name, "Reposado Tequila");
        assert_eq!(
            storage
                .candidate_products("Reposado", None, 1)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(storage
            .candidate_products("the ml", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_candidates_reach_past_newer_products() {
        let (storage, _dir) = setup_test_db().await;
        let old = CanonicalProduct::from_raw(&RawProductRecord::new(
            "provi",
            "1",
            "Old Forester Rye Whiskey",
            serde_json::json!({}),
        ));
        storage.insert_product(&old).await.unwrap();
        for i in 0..30 {
            let name = format!("Filler Item {}", i);
            let raw = RawProductRecord::new("provi", &name, &name, serde_json::json!({}));
            storage
                .insert_product(&CanonicalProduct::from_raw(&raw))
                .await
                .unwrap();
        }

        let found = storage
            .candidate_products("old forester rye whiskey", None, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, old.id);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (storage, _dir) = setup_test_db().await;
        let mut run = ScrapeRun::start("libdib");
        storage.create_run(&run).await.unwrap();

        run.products_found = 60;
        run.error_count = 1;
        run.finish(false);
        storage.update_run(&run).await.unwrap();
        storage
            .add_run_error(&ScrapeErrorRecord::new(
                &run.id,
                Some("wine"),
                "transient",
                "connection reset",
            ))
            .await
            .unwrap();

        let stored = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.products_found, 60);
        assert_eq!(storage.run_errors(&run.id).await.unwrap().len(), 1);

        let other = ScrapeRun::start("libdib");
        storage.create_run(&other).await.unwrap();
        storage.mark_run_failed(&other.id).await.unwrap();
        let recent = storage.recent_runs("libdib", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, other.id);
        assert_eq!(recent[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_price_history_is_append_only() {
        let (storage, _dir) = setup_test_db().await;
        storage
            .append_price(&PriceHistory::new("p1", "libdib", 3150))
            .await
            .unwrap();
        storage
            .append_price(&PriceHistory::new("p1", "libdib", 2999))
            .await
            .unwrap();
        storage
            .append_inventory(&InventoryHistory::new("p1", "libdib", Some(0), false))
            .await
            .unwrap();

        let mut prices: Vec<i64> = storage
            .price_history("p1", "libdib")
            .await
            .unwrap()
            .iter()
            .map(|p| p.price_cents)
            .collect();
        prices.sort();
        assert_eq!(prices, vec![2999, 3150]);
        assert!(storage.price_history("p1", "provi").await.unwrap().is_empty());
        let inventory = storage.inventory_history("p1", "libdib").await.unwrap();
        assert!(!inventory[0].in_stock);
    }

    #[tokio::test]
    async fn test_pending_matches() {
        let (storage, _dir) = setup_test_db().await;
        storage
            .enqueue_match(&MatchQueueItem::pending("raw1", "p1", 0.7))
            .await
            .unwrap();
        let pending = storage.pending_matches(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, MatchStatus::Pending);
    }
}
