//! Distributor reference data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A distributor portal we acquire catalog data from.
///
/// Created from configuration; every other component only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distributor {
    /// Unique short identifier (e.g. `libdib`).
    pub slug: String,
    /// Human-readable name.
    pub name: String,
    /// Portal base URL.
    pub base_url: String,
    /// Inactive distributors are never scheduled.
    pub active: bool,
    /// Name of the scraper strategy in the registry.
    pub strategy: String,
    /// When the distributor was registered.
    pub created_at: DateTime<Utc>,
}

impl Distributor {
    /// Create a new active distributor.
    pub fn new(slug: &str, name: &str, base_url: &str, strategy: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            active: true,
            strategy: strategy.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Join a path onto the portal base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}
