//! Runs distributor sessions: one at a time per distributor, several
//! distributors at once up to a ceiling, in batches with a pause between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ScraperError;
use crate::http::RequestExecutor;
use crate::models::{Distributor, MatchQueueItem, ScrapeErrorRecord, ScrapeRun};
use crate::pacing::{PacingConfig, PacingTracker, ScrapePacingState};
use crate::reconcile::ReconciliationPipeline;
use crate::scrapers::{run_paced, PacedRun, RunContext, RunSummary, ScraperRegistry};
use crate::storage::{StorageError, StorageGateway};

/// Why a session was not started or did not finish.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Unknown distributor '{0}'")]
    UnknownDistributor(String),

    #[error("Distributor '{0}' is inactive")]
    Inactive(String),

    #[error("Daily budget reached for '{slug}' ({items_scraped}/{daily_limit})")]
    BudgetReached {
        slug: String,
        items_scraped: u64,
        daily_limit: u64,
    },

    #[error("A session for '{0}' is already running")]
    AlreadyActive(String),

    #[error(transparent)]
    Scraper(#[from] ScraperError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ScheduleError {
    /// Refusals are expected outcomes, not failures.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::BudgetReached { .. } | Self::AlreadyActive(_) | Self::Inactive(_)
        )
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Distributors run concurrently per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_pause")]
    pub batch_pause_secs: u64,
}

fn default_concurrency() -> usize {
    3
}

fn default_batch_pause() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_pause_secs: default_batch_pause(),
        }
    }
}

/// Everything needed to start a session for one distributor.
#[derive(Debug, Clone)]
pub struct DistributorPlan {
    pub distributor: Distributor,
    pub pacing: PacingConfig,
    /// Strategy options handed to the scraper factory.
    pub options: serde_json::Value,
}

/// Removes a slug from the active set when its session ends, however it ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    slug: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.slug);
        }
    }
}

pub struct Scheduler {
    storage: Arc<dyn StorageGateway>,
    executor: Arc<RequestExecutor>,
    registry: Arc<ScraperRegistry>,
    pipeline: Arc<ReconciliationPipeline>,
    tracker: PacingTracker,
    config: SchedulerConfig,
    plans: HashMap<String, DistributorPlan>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        executor: Arc<RequestExecutor>,
        registry: Arc<ScraperRegistry>,
        pipeline: Arc<ReconciliationPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tracker: PacingTracker::new(storage.clone()),
            storage,
            executor,
            registry,
            pipeline,
            config,
            plans: HashMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_distributor(&mut self, plan: DistributorPlan) {
        self.plans.insert(plan.distributor.slug.clone(), plan);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.config.concurrency = concurrency.max(1);
    }

    /// Configured slugs, sorted.
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.plans.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    /// Slugs of active distributors, sorted.
    pub fn active_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .plans
            .values()
            .filter(|p| p.distributor.active)
            .map(|p| p.distributor.slug.clone())
            .collect();
        slugs.sort();
        slugs
    }

    /// Write every configured distributor to storage.
    pub async fn sync_distributors(&self) -> Result<usize, StorageError> {
        for plan in self.plans.values() {
            self.storage.upsert_distributor(&plan.distributor).await?;
        }
        Ok(self.plans.len())
    }

    fn claim(&self, slug: &str) -> Result<(ActiveGuard<'_>, CancellationToken), ScheduleError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| ScheduleError::AlreadyActive(slug.to_string()))?;
        if active.contains_key(slug) {
            return Err(ScheduleError::AlreadyActive(slug.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(slug.to_string(), token.clone());
        Ok((
            ActiveGuard {
                active: &self.active,
                slug: slug.to_string(),
            },
            token,
        ))
    }

    /// Run one paced session for `slug` today.
    pub async fn run_distributor(&self, slug: &str) -> Result<RunSummary, ScheduleError> {
        self.run_distributor_on(slug, PacingTracker::today()).await
    }

    /// Run one paced session for `slug` against the budget of `date`.
    pub async fn run_distributor_on(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> Result<RunSummary, ScheduleError> {
        let plan = self
            .plans
            .get(slug)
            .ok_or_else(|| ScheduleError::UnknownDistributor(slug.to_string()))?;
        if !plan.distributor.active {
            return Err(ScheduleError::Inactive(slug.to_string()));
        }

        let (_guard, cancel) = self.claim(slug)?;

        if let Some(state) = self.tracker.state(slug, date).await? {
            if state.items_scraped >= plan.pacing.daily_limit {
                info!(
                    "{}: refusing session, budget reached ({}/{})",
                    slug, state.items_scraped, plan.pacing.daily_limit
                );
                return Err(ScheduleError::BudgetReached {
                    slug: slug.to_string(),
                    items_scraped: state.items_scraped,
                    daily_limit: plan.pacing.daily_limit,
                });
            }
        }

        let scraper = self
            .registry
            .build(&plan.distributor, &plan.options, self.executor.clone())?;
        let ctx = RunContext {
            storage: self.storage.clone(),
            pipeline: self.pipeline.clone(),
        };
        let options = PacedRun {
            pacing: plan.pacing,
            date,
            cancel,
        };

        let summary = run_paced(scraper.as_ref(), &ctx, &self.tracker, &options).await?;
        info!(
            "{}: run {} {} ({} products, {} errors)",
            slug,
            summary.run.id,
            summary.run.status,
            summary.run.products_found,
            summary.run.error_count
        );
        Ok(summary)
    }

    /// Run sessions for `slugs`, `concurrency` at a time, pausing between
    /// batches. Results come back in input order.
    pub async fn run_many(
        &self,
        slugs: &[String],
    ) -> Vec<(String, Result<RunSummary, ScheduleError>)> {
        let batch_size = self.config.concurrency.max(1);
        let pause = Duration::from_secs(self.config.batch_pause_secs);
        let mut results = Vec::with_capacity(slugs.len());

        for (i, chunk) in slugs.chunks(batch_size).enumerate() {
            if i > 0 && !pause.is_zero() {
                info!("Pausing {}s before next batch", pause.as_secs());
                tokio::time::sleep(pause).await;
            }

            let futures: Vec<_> = chunk.iter().map(|slug| self.run_distributor(slug)).collect();
            let outcomes = futures::future::join_all(futures).await;

            for (slug, outcome) in chunk.iter().zip(outcomes) {
                if let Err(e) = &outcome {
                    if e.is_refusal() {
                        info!("{}: {}", slug, e);
                    } else {
                        warn!("{}: {}", slug, e);
                    }
                }
                results.push((slug.clone(), outcome));
            }
        }
        results
    }

    /// Cancel the running session for `slug`. Returns whether one was running.
    pub fn stop(&self, slug: &str) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(slug) {
                Some(token) => {
                    info!("{}: stop requested", slug);
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_running(&self, slug: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(slug))
            .unwrap_or(false)
    }

    pub async fn pacing_state(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> Result<Option<ScrapePacingState>, StorageError> {
        self.tracker.state(slug, date).await
    }

    pub async fn recent_runs(&self, slug: &str, limit: usize) -> Result<Vec<ScrapeRun>, StorageError> {
        self.storage.recent_runs(slug, limit).await
    }

    pub async fn run_errors(&self, run_id: &str) -> Result<Vec<ScrapeErrorRecord>, StorageError> {
        self.storage.run_errors(run_id).await
    }

    pub async fn pending_matches(&self, limit: usize) -> Result<Vec<MatchQueueItem>, StorageError> {
        self.storage.pending_matches(limit).await
    }
}
