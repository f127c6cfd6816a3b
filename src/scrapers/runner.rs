//! Run orchestration: authenticate, walk categories, reconcile, audit.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DistributorScraper;
use crate::error::ScraperError;
use crate::models::{RawProductRecord, ScrapeErrorRecord, ScrapeRun};
use crate::pacing::{next_category, plan_session, PacingConfig, PacingTracker, ScrapePacingState};
use crate::reconcile::ReconciliationPipeline;
use crate::storage::StorageGateway;

/// What a run needs besides the scraper.
#[derive(Clone)]
pub struct RunContext {
    pub storage: Arc<dyn StorageGateway>,
    pub pipeline: Arc<ReconciliationPipeline>,
}

/// Knobs for one paced session.
#[derive(Debug, Clone)]
pub struct PacedRun {
    pub pacing: PacingConfig,
    pub date: NaiveDate,
    pub cancel: CancellationToken,
}

/// Outcome of a run, as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: ScrapeRun,
    pub errors: Vec<ScrapeErrorRecord>,
    /// Pacing row after the session, for paced runs.
    pub pacing: Option<ScrapePacingState>,
}

/// Accumulates a run's counters and error rows.
struct RunRecorder<'a> {
    storage: &'a dyn StorageGateway,
    run: ScrapeRun,
    errors: Vec<ScrapeErrorRecord>,
}

impl<'a> RunRecorder<'a> {
    async fn start(storage: &'a dyn StorageGateway, slug: &str) -> Result<Self, ScraperError> {
        let run = ScrapeRun::start(slug);
        storage.create_run(&run).await?;
        info!("{}: run {} started", slug, run.id);
        Ok(Self {
            storage,
            run,
            errors: Vec::new(),
        })
    }

    async fn error(&mut self, category: Option<&str>, err: &ScraperError) {
        warn!(
            "{}: {} ({})",
            self.run.distributor_slug,
            err,
            category.unwrap_or("-")
        );
        let row = ScrapeErrorRecord::new(&self.run.id, category, err.kind(), &err.to_string());
        if let Err(e) = self.storage.add_run_error(&row).await {
            error!("{}: could not record run error: {}", self.run.id, e);
        }
        self.run.error_count += 1;
        self.errors.push(row);
    }

    /// Reconcile one page and fold its tally into the run.
    async fn ingest(
        &mut self,
        pipeline: &ReconciliationPipeline,
        mut records: Vec<RawProductRecord>,
        category: Option<&str>,
    ) {
        for record in &mut records {
            record.scrape_run_id = Some(self.run.id.clone());
        }
        self.run.products_found += records.len() as u64;
        self.run.pages_fetched += 1;

        let slug = self.run.distributor_slug.clone();
        let report = pipeline.process_batch(records, &slug).await;
        self.run.matched += report.matched;
        self.run.created += report.created;
        self.run.queued += report.queued;
        self.run.failed += report.failed;
        for failure in &report.errors {
            self.error(category, &failure.error).await;
        }
    }

    async fn checkpoint(&self) {
        if let Err(e) = self.storage.update_run(&self.run).await {
            warn!("{}: could not save run progress: {}", self.run.id, e);
        }
    }

    /// Close the run. A failed final write still tries to mark it failed.
    async fn finish(mut self, aborted: bool) -> RunSummary {
        self.run.finish(aborted);
        if let Err(e) = self.storage.update_run(&self.run).await {
            error!("{}: could not finalize run: {}", self.run.id, e);
            if let Err(e) = self.storage.mark_run_failed(&self.run.id).await {
                error!("{}: could not mark run failed: {}", self.run.id, e);
            }
        }
        info!(
            "{}: run {} {} ({} products, {} errors)",
            self.run.distributor_slug,
            self.run.id,
            self.run.status,
            self.run.products_found,
            self.run.error_count
        );
        RunSummary {
            run: self.run,
            errors: self.errors,
            pacing: None,
        }
    }
}

/// Full run over `categories` (or every category the portal lists).
///
/// Authentication failure aborts with zero products. Category failures are
/// recorded and the run continues, ending `partial`.
pub async fn run(
    scraper: &dyn DistributorScraper,
    ctx: &RunContext,
    categories: Option<Vec<String>>,
) -> Result<RunSummary, ScraperError> {
    let mut recorder = RunRecorder::start(ctx.storage.as_ref(), scraper.slug()).await?;

    if let Err(e) = scraper.authenticate().await {
        recorder.error(None, &e).await;
        return Ok(recorder.finish(true).await);
    }

    let categories = match categories {
        Some(c) => c,
        None => match scraper.list_categories().await {
            Ok(c) => c,
            Err(e) => {
                recorder.error(None, &e).await;
                return Ok(recorder.finish(true).await);
            }
        },
    };

    let mut stopped = false;
    for category in &categories {
        match scraper.list_products(Some(category), None, None).await {
            Ok(page) => {
                debug!(
                    "{}: {} products in {} ({} rows skipped)",
                    scraper.slug(),
                    page.records.len(),
                    category,
                    page.skipped()
                );
                recorder
                    .ingest(&ctx.pipeline, page.records, Some(category))
                    .await;
                recorder.checkpoint().await;
            }
            Err(e) => {
                recorder.error(Some(category), &e).await;
                if e.stops_session() {
                    stopped = true;
                    break;
                }
            }
        }
    }

    let aborted = stopped && recorder.run.products_found == 0;
    Ok(recorder.finish(aborted).await)
}

/// One paced session: resumes at the pacing cursor and commits after every
/// page. It stops at the daily soft cap, on cancellation, after
/// `categories_per_session` categories, or at the first category that fails.
/// A failed category keeps the cursor so the next session retries it.
pub async fn run_paced(
    scraper: &dyn DistributorScraper,
    ctx: &RunContext,
    tracker: &PacingTracker,
    options: &PacedRun,
) -> Result<RunSummary, ScraperError> {
    let slug = scraper.slug().to_string();
    let mut recorder = RunRecorder::start(ctx.storage.as_ref(), &slug).await?;

    let mut state = match tracker
        .begin_session(&slug, options.date, options.pacing.daily_limit)
        .await
    {
        Ok(state) => state,
        Err(e) => {
            recorder.error(None, &ScraperError::from(e)).await;
            return Ok(recorder.finish(true).await);
        }
    };

    let outcome = paced_pages(scraper, ctx, tracker, options, &mut recorder, &mut state).await;
    let aborted = match outcome {
        Ok(stopped) => stopped && recorder.run.products_found == 0,
        Err(e) => {
            recorder.error(state.last_category.as_deref(), &e).await;
            true
        }
    };

    let mut summary = recorder.finish(aborted).await;
    summary.pacing = Some(state);
    Ok(summary)
}

/// The page loop. Returns whether the session was cut short by a
/// session-stopping error. `Err` aborts the run.
async fn paced_pages(
    scraper: &dyn DistributorScraper,
    ctx: &RunContext,
    tracker: &PacingTracker,
    options: &PacedRun,
    recorder: &mut RunRecorder<'_>,
    state: &mut ScrapePacingState,
) -> Result<bool, ScraperError> {
    let slug = scraper.slug();
    scraper.authenticate().await?;

    let categories = scraper.list_categories().await?;
    let plan = plan_session(&categories, state, options.pacing.categories_per_session);
    if plan.is_empty() {
        info!("{}: no categories to scrape", slug);
        return Ok(false);
    }
    let page_size = options.pacing.page_size.max(1);

    for planned in plan {
        let category = planned.category.as_str();
        let mut offset = planned.start_offset;
        info!("{}: scraping {} from offset {}", slug, category, offset);

        loop {
            if options.cancel.is_cancelled() {
                info!("{}: session cancelled", slug);
                recorder.error(Some(category), &ScraperError::Cancelled).await;
                return Ok(true);
            }
            if state.budget_reached() {
                info!(
                    "{}: daily budget reached ({}/{})",
                    slug, state.items_scraped, state.daily_limit
                );
                return Ok(false);
            }

            let page = match scraper
                .list_products(Some(category), Some(page_size), Some(offset))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    recorder.error(Some(category), &e).await;
                    if e.stops_session() {
                        return Ok(true);
                    }
                    if state.last_category.as_deref() != Some(category) {
                        tracker.advance_category(state, category).await?;
                    }
                    info!("{}: ending session at failed category {}", slug, category);
                    return Ok(false);
                }
            };

            let rows = page.rows_seen;
            let items = page.records.len() as u64;
            if page.skipped() > 0 {
                debug!("{}: {} unusable rows in {}", slug, page.skipped(), category);
            }
            recorder.ingest(&ctx.pipeline, page.records, Some(category)).await;
            tracker
                .commit_page(state, category, items, offset + rows)
                .await?;
            recorder.checkpoint().await;

            if rows < page_size {
                if let Some(next) = next_category(&categories, category) {
                    tracker.advance_category(state, next).await?;
                }
                break;
            }
            offset += rows;
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::models::RunStatus;
    use crate::scrapers::ProductPage;
    use crate::pacing::PacingPhase;
    use crate::reconcile::{ReconcileConfig, TokenSimilarityMatcher};
    use crate::storage::MemoryStorage;

    /// In-memory portal: `catalog[category] = item count`.
    struct FakePortal {
        catalog: Vec<(String, u64)>,
        auth_error: bool,
        fail_category: Option<String>,
        block_after: Option<usize>,
        /// Row numbers the portal returns without a usable name.
        unnamed: Vec<u64>,
        calls: AtomicUsize,
    }

    impl FakePortal {
        fn new(catalog: &[(&str, u64)]) -> Self {
            Self {
                catalog: catalog.iter().map(|(c, n)| (c.to_string(), *n)).collect(),
                auth_error: false,
                fail_category: None,
                block_after: None,
                unnamed: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DistributorScraper for FakePortal {
        fn slug(&self) -> &str {
            "fake"
        }

        async fn authenticate(&self) -> Result<(), ScraperError> {
            if self.auth_error {
                return Err(ScraperError::AuthenticationFailed {
                    distributor: "fake".into(),
                    reason: "bad password".into(),
                });
            }
            Ok(())
        }

        async fn list_categories(&self) -> Result<Vec<String>, ScraperError> {
            Ok(self.catalog.iter().map(|(c, _)| c.clone()).collect())
        }

        async fn list_products(
            &self,
            category: Option<&str>,
            limit: Option<u64>,
            offset: Option<u64>,
        ) -> Result<ProductPage, ScraperError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block_after.is_some_and(|n| call >= n) {
                return Err(ScraperError::Blocked {
                    url: "http://fake".into(),
                    status: 403,
                });
            }
            let category = category.unwrap_or_default();
            if self.fail_category.as_deref() == Some(category) {
                return Err(ScraperError::UnexpectedStatus {
                    status: 500,
                    url: format!("http://fake/{}", category),
                });
            }
            let total = self
                .catalog
                .iter()
                .find(|(c, _)| c == category)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            let offset = offset.unwrap_or(0);
            let end = limit.map_or(total, |l| (offset + l).min(total));
            let rows = end.saturating_sub(offset) as usize;
            let records = (offset..end)
                .filter(|i| !self.unnamed.contains(i))
                .map(|i| {
                    let id = format!("{}{}", category, i);
                    RawProductRecord::new("fake", &id, &id, json!({}))
                })
                .collect();
            Ok(ProductPage::new(records, rows))
        }
    }

    fn context() -> (Arc<MemoryStorage>, RunContext) {
        let storage = Arc::new(MemoryStorage::new());
        let pipeline = ReconciliationPipeline::new(
            storage.clone(),
            Arc::new(TokenSimilarityMatcher),
            ReconcileConfig::default(),
        )
        .unwrap();
        let ctx = RunContext {
            storage: storage.clone(),
            pipeline: Arc::new(pipeline),
        };
        (storage, ctx)
    }

    fn paced(daily_limit: u64, page_size: u64) -> PacedRun {
        PacedRun {
            pacing: PacingConfig {
                daily_limit,
                page_size,
                categories_per_session: 2,
            },
            date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn auth_failure_aborts_with_one_error() {
        let (storage, ctx) = context();
        let mut portal = FakePortal::new(&[("wine", 5)]);
        portal.auth_error = true;

        let summary = run(&portal, &ctx, None).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Failed);
        assert_eq!(summary.run.products_found, 0);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, "authentication_failed");

        let stored = storage.get_run(&summary.run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn category_errors_make_the_run_partial() {
        let (_, ctx) = context();
        let mut portal = FakePortal::new(&[("wine", 3), ("beer", 2), ("cider", 4)]);
        portal.fail_category = Some("beer".into());

        let summary = run(&portal, &ctx, None).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.run.products_found, 7);
        assert_eq!(summary.run.created, 7);
        assert_eq!(summary.errors[0].category.as_deref(), Some("beer"));
    }

    #[tokio::test]
    async fn explicit_categories_skip_discovery() {
        let (_, ctx) = context();
        let portal = FakePortal::new(&[("wine", 3), ("beer", 2)]);
        let summary = run(&portal, &ctx, Some(vec!["beer".into()])).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Completed);
        assert_eq!(summary.run.products_found, 2);
    }

    #[tokio::test]
    async fn paced_session_commits_every_page() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let portal = FakePortal::new(&[("wine", 23), ("beer", 10), ("cider", 5)]);
        let options = paced(1000, 10);

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        let state = summary.pacing.unwrap();
        assert_eq!(state.items_scraped, 33);
        assert_eq!(summary.run.products_found, 33);
        // wine: 10, 10, 3; beer: 10, 0
        assert_eq!(summary.run.pages_fetched, 5);
        assert_eq!(state.last_category.as_deref(), Some("cider"));
        assert_eq!(state.last_offset, 0);
        assert_eq!(state.sessions_today, 1);
    }

    #[tokio::test]
    async fn unusable_rows_still_advance_the_offset() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let mut portal = FakePortal::new(&[("wine", 25), ("beer", 3), ("cider", 5)]);
        portal.unnamed = vec![3];
        let options = paced(1000, 10);

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        let state = summary.pacing.unwrap();
        // wine: 10 rows (9 usable), 10, 5; beer: 3
        assert_eq!(portal.calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.run.products_found, 27);
        assert_eq!(state.items_scraped, 27);
        assert_eq!(state.last_category.as_deref(), Some("cider"));
        assert_eq!(state.last_offset, 0);
    }

    #[tokio::test]
    async fn budget_stop_after_unusable_rows_resumes_at_row_offset() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let mut portal = FakePortal::new(&[("wine", 50)]);
        portal.unnamed = vec![3];
        let options = paced(15, 10);

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        let state = summary.pacing.unwrap();
        assert_eq!(state.items_scraped, 19);
        assert_eq!(state.last_category.as_deref(), Some("wine"));
        assert_eq!(state.last_offset, 20);
    }

    #[tokio::test]
    async fn failed_category_keeps_the_cursor_for_the_next_session() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let mut portal = FakePortal::new(&[("wine", 5), ("beer", 5), ("cider", 5)]);
        portal.fail_category = Some("beer".into());
        let mut options = paced(1000, 10);
        options.pacing.categories_per_session = 3;

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].category.as_deref(), Some("beer"));
        // cider is not attempted once beer fails
        assert_eq!(portal.calls.load(Ordering::SeqCst), 2);
        let state = summary.pacing.unwrap();
        assert_eq!(state.last_category.as_deref(), Some("beer"));
        assert_eq!(state.last_offset, 0);

        portal.fail_category = None;
        let retry = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        assert_eq!(retry.run.status, RunStatus::Completed);
        // beer, cider, then wine again
        assert_eq!(retry.run.products_found, 15);
        assert_eq!(retry.pacing.unwrap().items_scraped, 20);
    }

    #[tokio::test]
    async fn blocked_session_stops_and_keeps_progress() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let mut portal = FakePortal::new(&[("wine", 50)]);
        portal.block_after = Some(2);
        let options = paced(1000, 10);

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.errors.last().unwrap().kind, "blocked");
        assert_eq!(portal.calls.load(Ordering::SeqCst), 3);

        let state = tracker.state("fake", options.date).await.unwrap().unwrap();
        assert_eq!(state.items_scraped, 20);
        assert_eq!(state.last_offset, 20);
    }

    #[tokio::test]
    async fn cancelled_session_fetches_nothing() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let portal = FakePortal::new(&[("wine", 50)]);
        let options = paced(1000, 10);
        options.cancel.cancel();

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Failed);
        assert_eq!(portal.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.errors[0].kind, "cancelled");
    }

    #[tokio::test]
    async fn soft_cap_lets_a_page_straddle_the_limit() {
        let (storage, ctx) = context();
        let tracker = PacingTracker::new(storage.clone());
        let portal = FakePortal::new(&[("wine", 100)]);
        let options = paced(25, 10);

        let summary = run_paced(&portal, &ctx, &tracker, &options).await.unwrap();
        let state = summary.pacing.unwrap();
        assert_eq!(state.items_scraped, 30);
        assert_eq!(
            tracker.phase("fake", options.date).await.unwrap(),
            PacingPhase::BudgetReached
        );
    }
}
