//! Shared helper functions for CLI commands.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use console::{style, StyledObject};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::models::RunStatus;
use crate::scheduler::Scheduler;
use crate::storage::{SqliteStorage, StorageGateway};

/// Open the configured database, creating tables if missing.
pub async fn open_storage(config: &Config) -> anyhow::Result<Arc<SqliteStorage>> {
    config.ensure_directories()?;
    let storage = SqliteStorage::new(&config.database_url());
    storage.init_schema().await?;
    Ok(Arc::new(storage))
}

/// Storage plus a scheduler wired from config.
pub async fn open_scheduler(
    config: &Config,
) -> anyhow::Result<(Arc<SqliteStorage>, Scheduler)> {
    let storage = open_storage(config).await?;
    let store: Arc<dyn CredentialStore> = Arc::new(config.credential_store());
    let gateway: Arc<dyn StorageGateway> = storage.clone();
    let scheduler = config.scheduler(gateway, store)?;
    Ok((storage, scheduler))
}

pub fn styled_status(status: RunStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        RunStatus::Completed => s.green(),
        RunStatus::Partial => s.yellow(),
        RunStatus::Failed => s.red(),
        RunStatus::Running => s.cyan(),
    }
}

pub fn format_time(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_handles_short_strings() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
