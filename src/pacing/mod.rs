//! Per-distributor daily pacing.
//!
//! Each distributor gets one row per calendar day tracking how much has been
//! scraped, where to resume, and how many sessions ran. The scheduler reads
//! the row before starting a session and the session commits it after every
//! page, so a crash never loses more than the page in flight.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{StorageError, StorageGateway};

/// Lifecycle of a distributor's budget for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingPhase {
    /// No session has run today.
    NotStarted,
    /// At least one session ran and budget remains.
    Active,
    /// `items_scraped >= daily_limit`; no more sessions until tomorrow.
    BudgetReached,
}

impl PacingPhase {
    /// Phase of a possibly-missing state row.
    pub fn of(state: Option<&ScrapePacingState>) -> Self {
        match state {
            None => Self::NotStarted,
            Some(s) if s.budget_reached() => Self::BudgetReached,
            Some(_) => Self::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Active => "active",
            Self::BudgetReached => "budget_reached",
        }
    }
}

/// Budget and resume cursor for one distributor on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapePacingState {
    pub distributor_slug: String,
    pub date: NaiveDate,
    pub items_scraped: u64,
    pub daily_limit: u64,
    /// Offset of the next page to fetch within `last_category`.
    pub last_offset: u64,
    /// Category in progress.
    pub last_category: Option<String>,
    pub sessions_today: u32,
    pub last_session_at: Option<DateTime<Utc>>,
}

impl ScrapePacingState {
    pub fn new(distributor_slug: &str, date: NaiveDate, daily_limit: u64) -> Self {
        Self {
            distributor_slug: distributor_slug.to_string(),
            date,
            items_scraped: 0,
            daily_limit,
            last_offset: 0,
            last_category: None,
            sessions_today: 0,
            last_session_at: None,
        }
    }

    /// Soft cap: a page may push `items_scraped` past the limit.
    pub fn budget_reached(&self) -> bool {
        self.items_scraped >= self.daily_limit
    }

    pub fn remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.items_scraped)
    }

    pub fn phase(&self) -> PacingPhase {
        PacingPhase::of(Some(self))
    }

    fn begin_session(&mut self, now: DateTime<Utc>) {
        self.sessions_today += 1;
        self.last_session_at = Some(now);
    }

    /// Record a fetched page and move the cursor past it.
    fn commit_page(&mut self, category: &str, items: u64, next_offset: u64) {
        self.items_scraped += items;
        self.last_category = Some(category.to_string());
        self.last_offset = next_offset;
    }

    /// Point the cursor at the start of another category.
    fn advance_category(&mut self, next: &str) {
        self.last_category = Some(next.to_string());
        self.last_offset = 0;
    }
}

/// Knobs that shape one distributor's daily traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_categories_per_session")]
    pub categories_per_session: usize,
}

fn default_daily_limit() -> u64 {
    500
}

fn default_page_size() -> u64 {
    60
}

fn default_categories_per_session() -> usize {
    2
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            page_size: default_page_size(),
            categories_per_session: default_categories_per_session(),
        }
    }
}

/// One category slot in a session plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCategory {
    pub category: String,
    pub start_offset: u64,
}

/// Pick the categories a session should work through.
///
/// Starts at the cursor category (resuming at its offset), then rotates
/// through the remaining categories in order, wrapping around, for at most
/// `max` categories.
pub fn plan_session(
    categories: &[String],
    state: &ScrapePacingState,
    max: usize,
) -> Vec<PlannedCategory> {
    if categories.is_empty() || max == 0 {
        return Vec::new();
    }

    let cursor = state
        .last_category
        .as_deref()
        .and_then(|c| categories.iter().position(|cat| cat == c));

    let (start, offset) = match cursor {
        Some(idx) => (idx, state.last_offset),
        None => (0, 0),
    };

    (0..max.min(categories.len()))
        .map(|i| PlannedCategory {
            category: categories[(start + i) % categories.len()].clone(),
            start_offset: if i == 0 { offset } else { 0 },
        })
        .collect()
}

/// The category after `current` in rotation order.
pub fn next_category<'a>(categories: &'a [String], current: &str) -> Option<&'a str> {
    let idx = categories.iter().position(|c| c == current)?;
    categories
        .get((idx + 1) % categories.len())
        .map(|s| s.as_str())
}

/// Reads and commits pacing rows through the storage gateway.
#[derive(Clone)]
pub struct PacingTracker {
    storage: Arc<dyn StorageGateway>,
}

impl PacingTracker {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        Self { storage }
    }

    /// Today's calendar date for pacing purposes.
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Current state row, if a session already ran on `date`.
    pub async fn state(
        &self,
        slug: &str,
        date: NaiveDate,
    ) -> Result<Option<ScrapePacingState>, StorageError> {
        self.storage.get_pacing_state(slug, date).await
    }

    pub async fn phase(&self, slug: &str, date: NaiveDate) -> Result<PacingPhase, StorageError> {
        Ok(PacingPhase::of(self.state(slug, date).await?.as_ref()))
    }

    /// Start a session: create the row on first use and count the session.
    ///
    /// The configured daily limit always wins over the stored one so that a
    /// config change takes effect on the next session.
    pub async fn begin_session(
        &self,
        slug: &str,
        date: NaiveDate,
        daily_limit: u64,
    ) -> Result<ScrapePacingState, StorageError> {
        let mut state = match self.storage.get_pacing_state(slug, date).await? {
            Some(state) => state,
            None => {
                info!("{}: first session of {}", slug, date);
                ScrapePacingState::new(slug, date, daily_limit)
            }
        };
        state.daily_limit = daily_limit;
        state.begin_session(Utc::now());
        self.storage.save_pacing_state(&state).await?;
        Ok(state)
    }

    /// Persist a fetched page.
    pub async fn commit_page(
        &self,
        state: &mut ScrapePacingState,
        category: &str,
        items: u64,
        next_offset: u64,
    ) -> Result<(), StorageError> {
        state.commit_page(category, items, next_offset);
        self.storage.save_pacing_state(state).await?;
        debug!(
            "{}: committed {} items from {} (offset {}, {}/{})",
            state.distributor_slug,
            items,
            category,
            next_offset,
            state.items_scraped,
            state.daily_limit
        );
        Ok(())
    }

    /// Persist a cursor move to the next category.
    pub async fn advance_category(
        &self,
        state: &mut ScrapePacingState,
        next: &str,
    ) -> Result<(), StorageError> {
        state.advance_category(next);
        self.storage.save_pacing_state(state).await
    }
}
