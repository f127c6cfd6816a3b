//! End-to-end: scheduler -> libdib scraper -> executor -> fake portal ->
//! reconciliation -> storage.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use shelfsync::credentials::{CredentialStore, Credentials, MemoryCredentialStore, SessionCookie, SessionTokens};
use shelfsync::models::RunStatus;
use shelfsync::pacing::{PacingPhase, PacingTracker};
use shelfsync::scheduler::{ScheduleError, Scheduler};
use shelfsync::storage::{MemoryStorage, SqliteStorage, StorageGateway};

use common::{libdib_config, spawn_portal, Mode, EMAIL, PASSWORD};

fn password_store() -> Arc<dyn CredentialStore> {
    Arc::new(MemoryCredentialStore::with(
        "libdib",
        Credentials::password(EMAIL, PASSWORD),
    ))
}

#[tokio::test]
async fn daily_budget_spans_two_sessions_then_refuses() {
    let (base_url, portal) = spawn_portal(&[("red", 60), ("white", 60), ("rose", 60)]).await;
    let config = libdib_config(&base_url, 150, 60);

    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteStorage::from_path(&dir.path().join("shelfsync.db"));
    sqlite.init_schema().await.unwrap();
    let storage: Arc<dyn StorageGateway> = Arc::new(sqlite);
    let scheduler = config.scheduler(storage.clone(), password_store()).unwrap();
    scheduler.sync_distributors().await.unwrap();
    let today = PacingTracker::today();

    // Session 1: two categories, 120 items
    let first = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(first.run.status, RunStatus::Completed);
    assert_eq!(first.run.products_found, 120);
    assert_eq!(first.run.created, 120);
    let state = scheduler.pacing_state("libdib", today).await.unwrap().unwrap();
    assert_eq!(state.items_scraped, 120);
    assert_eq!(state.sessions_today, 1);
    assert_eq!(state.last_category.as_deref(), Some("rose"));
    assert_eq!(state.last_offset, 0);
    assert_eq!(state.phase(), PacingPhase::Active);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 1);

    // Session 2: the third category straddles the limit
    let second = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(second.run.products_found, 60);
    let state = scheduler.pacing_state("libdib", today).await.unwrap().unwrap();
    assert_eq!(state.items_scraped, 180);
    assert_eq!(state.sessions_today, 2);
    assert_eq!(state.phase(), PacingPhase::BudgetReached);

    let rose: Vec<_> = portal
        .requests()
        .into_iter()
        .filter(|(c, _)| c == "rose")
        .collect();
    assert_eq!(rose, vec![("rose".to_string(), 0)]);

    // Session 3 is refused without touching the portal
    let hits = portal.product_hits.load(Ordering::SeqCst);
    let err = scheduler.run_distributor("libdib").await.unwrap_err();
    assert!(matches!(err, ScheduleError::BudgetReached { items_scraped: 180, daily_limit: 150, .. }));
    assert_eq!(portal.product_hits.load(Ordering::SeqCst), hits);

    // Reconciled data landed in the database
    assert_eq!(storage.count_products().await.unwrap(), 180);
    let alias = storage.get_alias("libdib", "white-7").await.unwrap().unwrap();
    let prices = storage.price_history(&alias.product_id, "libdib").await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].price_cents, 1050);
    assert_eq!(scheduler.recent_runs("libdib", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn crashed_session_resumes_at_committed_cursor() {
    let (base_url, portal) = spawn_portal(&[("red", 150), ("white", 150)]).await;
    let config = libdib_config(&base_url, 1000, 50);
    let storage = Arc::new(MemoryStorage::new());
    let scheduler = Arc::new(config.scheduler(storage.clone(), password_store()).unwrap());
    let today = PacingTracker::today();

    // Third page never answers; the task dies while waiting for it
    *portal.hang_from.lock().unwrap() = Some(3);
    let session = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_distributor("libdib").await })
    };
    let mut waited = 0;
    while portal.product_hits.load(Ordering::SeqCst) < 3 && waited < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());

    let state = scheduler.pacing_state("libdib", today).await.unwrap().unwrap();
    assert_eq!(state.items_scraped, 100);
    assert_eq!(state.last_category.as_deref(), Some("red"));
    assert_eq!(state.last_offset, 100);

    // The crashed run was never finalized
    let runs = storage.recent_runs("libdib", 5).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Running);

    *portal.hang_from.lock().unwrap() = None;
    let resumed = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(resumed.run.status, RunStatus::Completed);

    let requests = portal.requests();
    assert_eq!(requests[3], ("red".to_string(), 100));
    let state = resumed.pacing.unwrap();
    assert_eq!(state.sessions_today, 2);
    // 100 before the crash, 50 + 150 after; no page counted twice
    assert_eq!(state.items_scraped, 300);
    assert_eq!(storage.count_products().await.unwrap(), 300);
}

#[tokio::test]
async fn nameless_row_does_not_cut_the_category_short() {
    let (base_url, portal) = spawn_portal(&[("red", 25)]).await;
    *portal.unnamed.lock().unwrap() = vec![3];
    let config = libdib_config(&base_url, 1000, 10);
    let storage = Arc::new(MemoryStorage::new());
    let scheduler = config.scheduler(storage.clone(), password_store()).unwrap();

    let summary = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(
        portal.requests(),
        vec![
            ("red".to_string(), 0),
            ("red".to_string(), 10),
            ("red".to_string(), 20)
        ]
    );
    let state = summary.pacing.unwrap();
    assert_eq!(state.items_scraped, 24);
    assert_eq!(state.last_category.as_deref(), Some("red"));
    assert_eq!(state.last_offset, 0);
    assert_eq!(storage.count_products().await.unwrap(), 24);
}

async fn scheduler_with(
    base_url: &str,
    store: Arc<dyn CredentialStore>,
) -> (Arc<MemoryStorage>, Scheduler) {
    let config = libdib_config(base_url, 500, 50);
    let storage = Arc::new(MemoryStorage::new());
    let scheduler = config.scheduler(storage.clone(), store).unwrap();
    (storage, scheduler)
}

#[tokio::test]
async fn stale_session_is_refreshed_once() {
    let (base_url, portal) = spawn_portal(&[("red", 10)]).await;
    let mut creds = Credentials::password(EMAIL, PASSWORD);
    creds.session = Some(SessionTokens {
        session_id: "stale".to_string(),
        csrf_token: None,
        cookies: vec![SessionCookie::new("sessionid", "stale", "127.0.0.1")],
    });
    creds.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::with("libdib", creds));
    let (_storage, scheduler) = scheduler_with(&base_url, store.clone()).await;

    let summary = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(summary.run.products_found, 10);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 1);
    // 401 then the retried request
    assert_eq!(portal.category_hits.load(Ordering::SeqCst), 2);

    let refreshed = store.get("libdib").await.unwrap().unwrap();
    assert_eq!(refreshed.session.unwrap().session_id, "session-1");
}

#[tokio::test]
async fn second_401_fails_the_run_without_looping() {
    let (base_url, portal) = spawn_portal(&[("red", 10)]).await;
    portal.set_mode(Mode::Unauthorized);
    let (_storage, scheduler) = scheduler_with(&base_url, password_store()).await;

    let summary = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Failed);
    assert_eq!(summary.run.products_found, 0);
    assert!(summary
        .errors
        .iter()
        .any(|e| e.kind == "authentication_failed"));
    // Initial login plus exactly one re-authentication
    assert_eq!(portal.logins.load(Ordering::SeqCst), 2);
    assert_eq!(portal.category_hits.load(Ordering::SeqCst), 2);
    assert_eq!(portal.product_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn forbidden_listing_blocks_without_retry() {
    let (base_url, portal) = spawn_portal(&[("red", 10), ("white", 10)]).await;
    portal.set_mode(Mode::Forbidden);
    let (storage, scheduler) = scheduler_with(&base_url, password_store()).await;

    let summary = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Failed);
    assert_eq!(portal.product_hits.load(Ordering::SeqCst), 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, "blocked");
    assert_eq!(summary.errors[0].category.as_deref(), Some("red"));

    let errors = storage.run_errors(&summary.run.id).await.unwrap();
    assert_eq!(errors.len(), 1);
    let state = summary.pacing.unwrap();
    assert_eq!(state.items_scraped, 0);
    assert_eq!(state.last_category, None);
}

#[tokio::test]
async fn missing_credentials_abort_with_zero_products() {
    let (base_url, portal) = spawn_portal(&[("red", 10)]).await;
    let (_storage, scheduler) =
        scheduler_with(&base_url, Arc::new(MemoryCredentialStore::new())).await;

    let summary = scheduler.run_distributor("libdib").await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Failed);
    assert_eq!(summary.run.products_found, 0);
    assert_eq!(summary.run.error_count, 1);
    assert_eq!(summary.errors[0].kind, "credentials_missing");
    assert_eq!(portal.logins.load(Ordering::SeqCst), 0);
    assert_eq!(portal.category_hits.load(Ordering::SeqCst), 0);
}
