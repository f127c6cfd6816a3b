//! Scrape run audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a scrape run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scraping attempt against a distributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: String,
    pub distributor_slug: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub products_found: u64,
    pub pages_fetched: u64,
    pub error_count: u64,
    pub matched: u64,
    pub created: u64,
    pub queued: u64,
    pub failed: u64,
}

impl ScrapeRun {
    /// Start a new run.
    pub fn start(distributor_slug: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            distributor_slug: distributor_slug.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            products_found: 0,
            pages_fetched: 0,
            error_count: 0,
            matched: 0,
            created: 0,
            queued: 0,
            failed: 0,
        }
    }

    /// Close the run with its final status.
    ///
    /// `aborted` marks a run that never got past authentication or died on
    /// an unexpected error. Otherwise the status follows the error count.
    pub fn finish(&mut self, aborted: bool) {
        self.completed_at = Some(Utc::now());
        self.status = if aborted {
            RunStatus::Failed
        } else if self.error_count == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Audit row for a single error that occurred during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeErrorRecord {
    pub id: String,
    pub run_id: String,
    pub category: Option<String>,
    /// Taxonomy name, see `ScraperError::kind`.
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ScrapeErrorRecord {
    pub fn new(run_id: &str, category: Option<&str>, kind: &str, message: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            category: category.map(|c| c.to_string()),
            kind: kind.to_string(),
            message: message.to_string(),
            occurred_at: Utc::now(),
        }
    }
}
