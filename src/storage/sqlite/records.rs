//! Diesel row types and their conversions to domain models.
//!
//! Timestamps are stored as RFC 3339 text, booleans as 0/1 integers.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use diesel::prelude::*;

use crate::models::{
    CanonicalProduct, Distributor, InventoryHistory, MatchQueueItem, MatchStatus, PriceHistory,
    ProductAlias, RawProductRecord, RunStatus, ScrapeErrorRecord, ScrapeRun,
};
use crate::pacing::ScrapePacingState;
use crate::schema;
use crate::storage::{brand_key, name_tokens, StorageError};

pub(super) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fixed-width timestamps so text ordering matches time ordering.
pub(super) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::distributors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DistributorRecord {
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub active: i32,
    pub strategy: String,
    pub created_at: String,
}

impl From<&Distributor> for DistributorRecord {
    fn from(d: &Distributor) -> Self {
        Self {
            slug: d.slug.clone(),
            name: d.name.clone(),
            base_url: d.base_url.clone(),
            active: d.active as i32,
            strategy: d.strategy.clone(),
            created_at: format_ts(&d.created_at),
        }
    }
}

impl From<DistributorRecord> for Distributor {
    fn from(r: DistributorRecord) -> Self {
        Distributor {
            slug: r.slug,
            name: r.name,
            base_url: r.base_url,
            active: r.active != 0,
            strategy: r.strategy,
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::scrape_pacing_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PacingRecord {
    pub distributor_slug: String,
    pub date: String,
    pub items_scraped: i64,
    pub daily_limit: i64,
    pub last_offset: i64,
    pub last_category: Option<String>,
    pub sessions_today: i32,
    pub last_session_at: Option<String>,
}

impl From<&ScrapePacingState> for PacingRecord {
    fn from(s: &ScrapePacingState) -> Self {
        Self {
            distributor_slug: s.distributor_slug.clone(),
            date: s.date.format(DATE_FORMAT).to_string(),
            items_scraped: s.items_scraped as i64,
            daily_limit: s.daily_limit as i64,
            last_offset: s.last_offset as i64,
            last_category: s.last_category.clone(),
            sessions_today: s.sessions_today as i32,
            last_session_at: s.last_session_at.as_ref().map(format_ts),
        }
    }
}

impl TryFrom<PacingRecord> for ScrapePacingState {
    type Error = StorageError;

    fn try_from(r: PacingRecord) -> Result<Self, Self::Error> {
        let date = NaiveDate::parse_from_str(&r.date, DATE_FORMAT)
            .map_err(|e| StorageError::Corrupt(format!("pacing date {:?}: {}", r.date, e)))?;
        Ok(ScrapePacingState {
            distributor_slug: r.distributor_slug,
            date,
            items_scraped: r.items_scraped.max(0) as u64,
            daily_limit: r.daily_limit.max(0) as u64,
            last_offset: r.last_offset.max(0) as u64,
            last_category: r.last_category,
            sessions_today: r.sessions_today.max(0) as u32,
            last_session_at: parse_ts_opt(r.last_session_at),
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::raw_product_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawRecordRow {
    pub id: String,
    pub external_id: String,
    pub source: String,
    pub payload: String,
    pub scrape_run_id: Option<String>,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub stock_quantity: Option<i64>,
    pub in_stock: Option<i32>,
    pub observed_at: String,
    pub processed: i32,
    pub product_id: Option<String>,
}

impl TryFrom<&RawProductRecord> for RawRecordRow {
    type Error = StorageError;

    fn try_from(r: &RawProductRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id.clone(),
            external_id: r.external_id.clone(),
            source: r.source.clone(),
            payload: serde_json::to_string(&r.payload)?,
            scrape_run_id: r.scrape_run_id.clone(),
            name: r.name.clone(),
            brand: r.brand.clone(),
            category: r.category.clone(),
            price_cents: r.price_cents,
            stock_quantity: r.stock_quantity,
            in_stock: r.in_stock.map(|b| b as i32),
            observed_at: format_ts(&r.observed_at),
            processed: r.processed as i32,
            product_id: r.product_id.clone(),
        })
    }
}

impl From<RawRecordRow> for RawProductRecord {
    fn from(r: RawRecordRow) -> Self {
        RawProductRecord {
            id: r.id,
            external_id: r.external_id,
            source: r.source,
            payload: serde_json::from_str(&r.payload).unwrap_or(serde_json::Value::Null),
            scrape_run_id: r.scrape_run_id,
            name: r.name,
            brand: r.brand,
            category: r.category,
            price_cents: r.price_cents,
            stock_quantity: r.stock_quantity,
            in_stock: r.in_stock.map(|v| v != 0),
            observed_at: parse_ts(&r.observed_at),
            processed: r.processed != 0,
            product_id: r.product_id,
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::products)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub brand_key: Option<String>,
    pub category: Option<String>,
    pub created_at: String,
}

impl From<&CanonicalProduct> for ProductRecord {
    fn from(p: &CanonicalProduct) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            brand: p.brand.clone(),
            brand_key: p.brand.as_deref().map(brand_key),
            category: p.category.clone(),
            created_at: format_ts(&p.created_at),
        }
    }
}

/// One row of the name-token index used for candidate lookup.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = schema::product_tokens)]
pub struct ProductTokenRecord {
    pub token: String,
    pub product_id: String,
}

impl ProductTokenRecord {
    pub fn for_product(id: &str, name: &str) -> Vec<Self> {
        name_tokens(name)
            .into_iter()
            .map(|token| Self {
                token,
                product_id: id.to_string(),
            })
            .collect()
    }
}

impl From<ProductRecord> for CanonicalProduct {
    fn from(r: ProductRecord) -> Self {
        CanonicalProduct {
            id: r.id,
            name: r.name,
            brand: r.brand,
            category: r.category,
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::product_aliases)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AliasRecord {
    pub source: String,
    pub external_id: String,
    pub product_id: String,
    pub confidence: f64,
    pub created_at: String,
}

impl From<&ProductAlias> for AliasRecord {
    fn from(a: &ProductAlias) -> Self {
        Self {
            source: a.source.clone(),
            external_id: a.external_id.clone(),
            product_id: a.product_id.clone(),
            confidence: a.confidence,
            created_at: format_ts(&a.created_at),
        }
    }
}

impl From<AliasRecord> for ProductAlias {
    fn from(r: AliasRecord) -> Self {
        ProductAlias {
            source: r.source,
            external_id: r.external_id,
            product_id: r.product_id,
            confidence: r.confidence,
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::price_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PriceRecord {
    pub id: String,
    pub product_id: String,
    pub distributor_slug: String,
    pub price_cents: i64,
    pub observed_at: String,
}

impl From<&PriceHistory> for PriceRecord {
    fn from(p: &PriceHistory) -> Self {
        Self {
            id: p.id.clone(),
            product_id: p.product_id.clone(),
            distributor_slug: p.distributor_slug.clone(),
            price_cents: p.price_cents,
            observed_at: format_ts(&p.observed_at),
        }
    }
}

impl From<PriceRecord> for PriceHistory {
    fn from(r: PriceRecord) -> Self {
        PriceHistory {
            id: r.id,
            product_id: r.product_id,
            distributor_slug: r.distributor_slug,
            price_cents: r.price_cents,
            observed_at: parse_ts(&r.observed_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::inventory_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct InventoryRecord {
    pub id: String,
    pub product_id: String,
    pub distributor_slug: String,
    pub quantity: Option<i64>,
    pub in_stock: i32,
    pub observed_at: String,
}

impl From<&InventoryHistory> for InventoryRecord {
    fn from(i: &InventoryHistory) -> Self {
        Self {
            id: i.id.clone(),
            product_id: i.product_id.clone(),
            distributor_slug: i.distributor_slug.clone(),
            quantity: i.quantity,
            in_stock: i.in_stock as i32,
            observed_at: format_ts(&i.observed_at),
        }
    }
}

impl From<InventoryRecord> for InventoryHistory {
    fn from(r: InventoryRecord) -> Self {
        InventoryHistory {
            id: r.id,
            product_id: r.product_id,
            distributor_slug: r.distributor_slug,
            quantity: r.quantity,
            in_stock: r.in_stock != 0,
            observed_at: parse_ts(&r.observed_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::match_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MatchQueueRecord {
    pub id: String,
    pub raw_record_id: String,
    pub candidate_product_id: String,
    pub confidence: f64,
    pub status: String,
    pub created_at: String,
}

impl From<&MatchQueueItem> for MatchQueueRecord {
    fn from(m: &MatchQueueItem) -> Self {
        Self {
            id: m.id.clone(),
            raw_record_id: m.raw_record_id.clone(),
            candidate_product_id: m.candidate_product_id.clone(),
            confidence: m.confidence,
            status: m.status.as_str().to_string(),
            created_at: format_ts(&m.created_at),
        }
    }
}

impl From<MatchQueueRecord> for MatchQueueItem {
    fn from(r: MatchQueueRecord) -> Self {
        MatchQueueItem {
            id: r.id,
            raw_record_id: r.raw_record_id,
            candidate_product_id: r.candidate_product_id,
            confidence: r.confidence,
            status: MatchStatus::from_str(&r.status).unwrap_or(MatchStatus::Pending),
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = schema::scrape_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct RunRecord {
    pub id: String,
    pub distributor_slug: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub products_found: i64,
    pub pages_fetched: i64,
    pub error_count: i64,
    pub matched: i64,
    pub created: i64,
    pub queued: i64,
    pub failed: i64,
}

impl From<&ScrapeRun> for RunRecord {
    fn from(r: &ScrapeRun) -> Self {
        Self {
            id: r.id.clone(),
            distributor_slug: r.distributor_slug.clone(),
            started_at: format_ts(&r.started_at),
            completed_at: r.completed_at.as_ref().map(format_ts),
            status: r.status.as_str().to_string(),
            products_found: r.products_found as i64,
            pages_fetched: r.pages_fetched as i64,
            error_count: r.error_count as i64,
            matched: r.matched as i64,
            created: r.created as i64,
            queued: r.queued as i64,
            failed: r.failed as i64,
        }
    }
}

impl From<RunRecord> for ScrapeRun {
    fn from(r: RunRecord) -> Self {
        ScrapeRun {
            id: r.id,
            distributor_slug: r.distributor_slug,
            started_at: parse_ts(&r.started_at),
            completed_at: parse_ts_opt(r.completed_at),
            // An unreadable status is reported as failed rather than running forever.
            status: RunStatus::from_str(&r.status).unwrap_or(RunStatus::Failed),
            products_found: r.products_found.max(0) as u64,
            pages_fetched: r.pages_fetched.max(0) as u64,
            error_count: r.error_count.max(0) as u64,
            matched: r.matched.max(0) as u64,
            created: r.created.max(0) as u64,
            queued: r.queued.max(0) as u64,
            failed: r.failed.max(0) as u64,
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::scrape_errors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScrapeErrorRow {
    pub id: String,
    pub run_id: String,
    pub category: Option<String>,
    pub kind: String,
    pub message: String,
    pub occurred_at: String,
}

impl From<&ScrapeErrorRecord> for ScrapeErrorRow {
    fn from(e: &ScrapeErrorRecord) -> Self {
        Self {
            id: e.id.clone(),
            run_id: e.run_id.clone(),
            category: e.category.clone(),
            kind: e.kind.clone(),
            message: e.message.clone(),
            occurred_at: format_ts(&e.occurred_at),
        }
    }
}

impl From<ScrapeErrorRow> for ScrapeErrorRecord {
    fn from(r: ScrapeErrorRow) -> Self {
        ScrapeErrorRecord {
            id: r.id,
            run_id: r.run_id,
            category: r.category,
            kind: r.kind,
            message: r.message,
            occurred_at: parse_ts(&r.occurred_at),
        }
    }
}
