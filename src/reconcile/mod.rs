//! Reconciliation of raw observations into the canonical catalog.
//!
//! Each raw record is persisted first, then resolved to a canonical product:
//!
//! 1. a known alias for `(source, external_id)` wins outright,
//! 2. otherwise the matcher's best candidate is accepted (`>= auto_accept`),
//!    accepted and queued for review (`>= queue`), or ignored,
//! 3. with no acceptable candidate a new canonical product is created.
//!
//! Price and inventory observations are appended for the resolved product.

mod matcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use matcher::{ProductMatcher, TokenSimilarityMatcher};

use crate::error::ScraperError;
use crate::models::{
    CanonicalProduct, InventoryHistory, MatchQueueItem, PriceHistory, ProductAlias,
    RawProductRecord,
};
use crate::storage::{StorageError, StorageGateway};

#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("Invalid thresholds: need 0 <= queue ({queue}) <= auto_accept ({auto_accept}) <= 1")]
    InvalidThresholds { auto_accept: f64, queue: f64 },

    #[error("Matcher returned confidence {confidence} for {product_id}")]
    InvalidScore { product_id: String, confidence: f64 },

    #[error("Matcher failed: {0}")]
    Matcher(String),
}

/// Confidence bands (`[reconcile]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_auto_accept")]
    pub auto_accept: f64,
    #[serde(default = "default_queue")]
    pub queue: f64,
    /// How many existing products the matcher sees per record, picked by
    /// shared name tokens.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
}

fn default_auto_accept() -> f64 {
    0.85
}

fn default_queue() -> f64 {
    0.60
}

fn default_candidate_limit() -> usize {
    200
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            auto_accept: default_auto_accept(),
            queue: default_queue(),
            candidate_limit: default_candidate_limit(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), MatchingError> {
        let ok = (0.0..=1.0).contains(&self.queue)
            && (0.0..=1.0).contains(&self.auto_accept)
            && self.queue <= self.auto_accept;
        if ok {
            Ok(())
        } else {
            Err(MatchingError::InvalidThresholds {
                auto_accept: self.auto_accept,
                queue: self.queue,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "exact")]
    Exact,
    #[serde(rename = "fuzzy-auto")]
    FuzzyAuto,
    #[serde(rename = "fuzzy-queued")]
    FuzzyQueued,
    #[serde(rename = "new")]
    New,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::FuzzyAuto => "fuzzy-auto",
            Self::FuzzyQueued => "fuzzy-queued",
            Self::New => "new",
        }
    }
}

/// Result of reconciling one raw record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub raw_record_id: String,
    pub matched: bool,
    pub is_new: bool,
    pub product_id: String,
    pub confidence: f64,
    pub match_type: MatchType,
}

/// Per-record failure inside a batch.
#[derive(Debug)]
pub struct RecordFailure {
    pub external_id: String,
    pub error: ScraperError,
}

/// Tally of a batch. `matched` counts exact and auto matches, `queued` the
/// provisional ones, `created` new products.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub matched: u64,
    pub created: u64,
    pub queued: u64,
    pub failed: u64,
    pub outcomes: Vec<MatchOutcome>,
    pub errors: Vec<RecordFailure>,
}

impl BatchReport {
    fn record(&mut self, outcome: MatchOutcome) {
        match outcome.match_type {
            MatchType::Exact | MatchType::FuzzyAuto => self.matched += 1,
            MatchType::FuzzyQueued => self.queued += 1,
            MatchType::New => self.created += 1,
        }
        self.outcomes.push(outcome);
    }
}

pub struct ReconciliationPipeline {
    storage: Arc<dyn StorageGateway>,
    matcher: Arc<dyn ProductMatcher>,
    config: ReconcileConfig,
}

impl ReconciliationPipeline {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        matcher: Arc<dyn ProductMatcher>,
        config: ReconcileConfig,
    ) -> Result<Self, MatchingError> {
        config.validate()?;
        Ok(Self {
            storage,
            matcher,
            config,
        })
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile one record observed on `distributor`.
    pub async fn process(
        &self,
        raw: RawProductRecord,
        distributor: &str,
    ) -> Result<MatchOutcome, ScraperError> {
        self.storage.insert_raw_record(&raw).await?;

        let outcome = self.resolve(&raw).await?;
        self.append_history(&raw, &outcome.product_id, distributor)
            .await?;
        self.storage
            .mark_raw_processed(&raw.id, &outcome.product_id)
            .await?;

        debug!(
            "{}:{} -> {} ({}, {:.2})",
            raw.source,
            raw.external_id,
            outcome.product_id,
            outcome.match_type.as_str(),
            outcome.confidence
        );
        Ok(outcome)
    }

    /// Reconcile records independently; one failure never stops the rest.
    pub async fn process_batch(
        &self,
        records: Vec<RawProductRecord>,
        distributor: &str,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for raw in records {
            let external_id = raw.external_id.clone();
            match self.process(raw, distributor).await {
                Ok(outcome) => report.record(outcome),
                Err(error) => {
                    warn!(
                        "{}: failed to reconcile {}: {}",
                        distributor, external_id, error
                    );
                    report.failed += 1;
                    report.errors.push(RecordFailure { external_id, error });
                }
            }
        }
        if report.created + report.queued > 0 {
            info!(
                "{}: {} matched, {} queued, {} new, {} failed",
                distributor, report.matched, report.queued, report.created, report.failed
            );
        }
        report
    }

    async fn resolve(&self, raw: &RawProductRecord) -> Result<MatchOutcome, ScraperError> {
        if let Some(alias) = self
            .storage
            .get_alias(&raw.source, &raw.external_id)
            .await?
        {
            return Ok(MatchOutcome {
                raw_record_id: raw.id.clone(),
                matched: true,
                is_new: false,
                product_id: alias.product_id,
                confidence: 1.0,
                match_type: MatchType::Exact,
            });
        }

        let best = self.best_candidate(raw).await?;
        let (product_id, confidence, match_type) = match best {
            Some((id, score)) if score >= self.config.auto_accept => {
                (id, score, MatchType::FuzzyAuto)
            }
            Some((id, score)) if score >= self.config.queue => (id, score, MatchType::FuzzyQueued),
            _ => {
                let product = CanonicalProduct::from_raw(raw);
                self.storage.insert_product(&product).await?;
                (product.id, 1.0, MatchType::New)
            }
        };

        let alias = ProductAlias::new(&raw.source, &raw.external_id, &product_id, confidence);
        match self.storage.insert_alias(&alias).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                // Another task aliased this id first; theirs stands.
                if let Some(existing) = self
                    .storage
                    .get_alias(&raw.source, &raw.external_id)
                    .await?
                {
                    return Ok(MatchOutcome {
                        raw_record_id: raw.id.clone(),
                        matched: true,
                        is_new: false,
                        product_id: existing.product_id,
                        confidence: 1.0,
                        match_type: MatchType::Exact,
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }

        if match_type == MatchType::FuzzyQueued {
            self.storage
                .enqueue_match(&MatchQueueItem::pending(&raw.id, &product_id, confidence))
                .await?;
        }

        Ok(MatchOutcome {
            raw_record_id: raw.id.clone(),
            matched: match_type != MatchType::New,
            is_new: match_type == MatchType::New,
            product_id,
            confidence,
            match_type,
        })
    }

    async fn best_candidate(
        &self,
        raw: &RawProductRecord,
    ) -> Result<Option<(String, f64)>, ScraperError> {
        let candidates = self
            .storage
            .candidate_products(&raw.name, raw.brand.as_deref(), self.config.candidate_limit)
            .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let scores = self
            .matcher
            .score(&raw.name, raw.brand.as_deref(), &candidates)
            .await?;
        let mut best: Option<(String, f64)> = None;
        for (product_id, confidence) in scores {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(MatchingError::InvalidScore {
                    product_id,
                    confidence,
                }
                .into());
            }
            if best.as_ref().map_or(true, |(_, b)| confidence > *b) {
                best = Some((product_id, confidence));
            }
        }
        Ok(best)
    }

    async fn append_history(
        &self,
        raw: &RawProductRecord,
        product_id: &str,
        distributor: &str,
    ) -> Result<(), StorageError> {
        if let Some(price) = raw.price_cents {
            let mut row = PriceHistory::new(product_id, distributor, price);
            row.observed_at = raw.observed_at;
            self.storage.append_price(&row).await?;
        }
        if raw.has_inventory() {
            let in_stock = raw
                .in_stock
                .unwrap_or(raw.stock_quantity.unwrap_or(0) > 0);
            let mut row =
                InventoryHistory::new(product_id, distributor, raw.stock_quantity, in_stock);
            row.observed_at = raw.observed_at;
            self.storage.append_inventory(&row).await?;
        }
        Ok(())
    }
}
