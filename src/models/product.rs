//! Catalog models: raw observations, canonical products and their history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One item observed on a distributor portal during a run.
///
/// Immutable once persisted, except for the processed flag and the link to
/// the canonical product it was reconciled to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProductRecord {
    pub id: String,
    /// Identifier in the distributor's own identity space.
    pub external_id: String,
    /// Distributor slug the record was observed on.
    pub source: String,
    /// Unmodified payload as returned by the portal.
    pub payload: serde_json::Value,
    pub scrape_run_id: Option<String>,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    /// Listed price in cents.
    pub price_cents: Option<i64>,
    pub stock_quantity: Option<i64>,
    pub in_stock: Option<bool>,
    pub observed_at: DateTime<Utc>,
    pub processed: bool,
    pub product_id: Option<String>,
}

impl RawProductRecord {
    /// Create a new unprocessed record.
    pub fn new(source: &str, external_id: &str, name: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            external_id: external_id.to_string(),
            source: source.to_string(),
            payload,
            scrape_run_id: None,
            name: name.to_string(),
            brand: None,
            category: None,
            price_cents: None,
            stock_quantity: None,
            in_stock: None,
            observed_at: Utc::now(),
            processed: false,
            product_id: None,
        }
    }

    pub fn with_brand(mut self, brand: Option<String>) -> Self {
        self.brand = brand.filter(|b| !b.trim().is_empty());
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_price_cents(mut self, price_cents: Option<i64>) -> Self {
        self.price_cents = price_cents;
        self
    }

    pub fn with_stock(mut self, quantity: Option<i64>, in_stock: Option<bool>) -> Self {
        self.stock_quantity = quantity;
        self.in_stock = in_stock.or(quantity.map(|q| q > 0));
        self
    }

    /// True if the record carried any inventory signal.
    pub fn has_inventory(&self) -> bool {
        self.stock_quantity.is_some() || self.in_stock.is_some()
    }
}

/// Deduplicated catalog entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CanonicalProduct {
    /// Create a canonical product seeded from a raw observation.
    pub fn from_raw(raw: &RawProductRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: raw.name.trim().to_string(),
            brand: raw.brand.clone(),
            category: raw.category.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Durable mapping from `(source, external_id)` to a canonical product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAlias {
    pub source: String,
    pub external_id: String,
    pub product_id: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl ProductAlias {
    pub fn new(source: &str, external_id: &str, product_id: &str, confidence: f64) -> Self {
        Self {
            source: source.to_string(),
            external_id: external_id.to_string(),
            product_id: product_id.to_string(),
            confidence,
            created_at: Utc::now(),
        }
    }
}

/// Append-only price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub id: String,
    pub product_id: String,
    pub distributor_slug: String,
    pub price_cents: i64,
    pub observed_at: DateTime<Utc>,
}

impl PriceHistory {
    pub fn new(product_id: &str, distributor_slug: &str, price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            product_id: product_id.to_string(),
            distributor_slug: distributor_slug.to_string(),
            price_cents,
            observed_at: Utc::now(),
        }
    }
}

/// Append-only inventory observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryHistory {
    pub id: String,
    pub product_id: String,
    pub distributor_slug: String,
    pub quantity: Option<i64>,
    pub in_stock: bool,
    pub observed_at: DateTime<Utc>,
}

impl InventoryHistory {
    pub fn new(
        product_id: &str,
        distributor_slug: &str,
        quantity: Option<i64>,
        in_stock: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            product_id: product_id.to_string(),
            distributor_slug: distributor_slug.to_string(),
            quantity,
            in_stock,
            observed_at: Utc::now(),
        }
    }
}

/// Review state of a queued match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A provisional match waiting for human confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchQueueItem {
    pub id: String,
    pub raw_record_id: String,
    pub candidate_product_id: String,
    pub confidence: f64,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
}

impl MatchQueueItem {
    pub fn pending(raw_record_id: &str, candidate_product_id: &str, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            raw_record_id: raw_record_id.to_string(),
            candidate_product_id: candidate_product_id.to_string(),
            confidence,
            status: MatchStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
