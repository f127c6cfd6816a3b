//! Error taxonomy for acquisition and reconciliation.
//!
//! Operators need to tell "we are being throttled" apart from "we have been
//! detected", so rate limiting and blocking are separate variants and keep
//! separate audit names.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::storage::StorageError;

/// Errors raised while talking to a distributor portal or processing its data.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("No credentials configured for distributor '{distributor}'")]
    CredentialsMissing { distributor: String },

    #[error("Credential store error: {0}")]
    CredentialStore(#[from] CredentialError),

    #[error("Authentication failed for '{distributor}': {reason}")]
    AuthenticationFailed { distributor: String, reason: String },

    #[error("Rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("Blocked by {url} (HTTP {status})")]
    Blocked { url: String, status: u16 },

    #[error("Transient failure fetching {url} after {attempts} attempts: {message}")]
    Transient {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("Unexpected HTTP {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Failed to parse {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Matching failed: {0}")]
    Matching(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("Browser automation failed: {0}")]
    Browser(String),

    #[error("Unknown scraper strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Session cancelled")]
    Cancelled,
}

impl ScraperError {
    /// Stable audit name stored with scrape error rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CredentialsMissing { .. } => "credentials_missing",
            Self::CredentialStore(_) => "credential_store",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Blocked { .. } => "blocked",
            Self::Transient { .. } => "transient",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::Parse { .. } => "parse",
            Self::Matching(_) => "matching",
            Self::Persistence(_) => "persistence",
            Self::Browser(_) => "browser",
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::Cancelled => "cancelled",
        }
    }

    /// Errors that end a run outright instead of being accumulated.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::CredentialsMissing { .. }
                | Self::CredentialStore(_)
                | Self::AuthenticationFailed { .. }
                | Self::UnknownStrategy(_)
        )
    }

    /// Errors after which no further request should be sent in this session.
    pub fn stops_session(&self) -> bool {
        self.aborts_run() || matches!(self, Self::Blocked { .. } | Self::Cancelled)
    }

    pub(crate) fn transient(url: &str, attempts: u32, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            url: url.to_string(),
            attempts,
            message: err.to_string(),
        }
    }
}

impl From<crate::reconcile::MatchingError> for ScraperError {
    fn from(e: crate::reconcile::MatchingError) -> Self {
        Self::Matching(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_rate_limited_have_distinct_kinds() {
        let blocked = ScraperError::Blocked {
            url: "https://example.com".into(),
            status: 403,
        };
        let limited = ScraperError::RateLimited {
            url: "https://example.com".into(),
            attempts: 3,
        };
        assert_eq!(blocked.kind(), "blocked");
        assert_eq!(limited.kind(), "rate_limited");
        assert!(blocked.stops_session());
        assert!(!limited.stops_session());
    }

    #[test]
    fn only_credential_and_auth_failures_abort() {
        assert!(ScraperError::CredentialsMissing {
            distributor: "libdib".into()
        }
        .aborts_run());
        assert!(ScraperError::AuthenticationFailed {
            distributor: "libdib".into(),
            reason: "401".into()
        }
        .aborts_run());
        assert!(!ScraperError::Matching("no candidates".into()).aborts_run());
    }
}
