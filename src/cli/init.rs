//! Initialize command.

use console::style;

use super::helpers::open_scheduler;
use crate::config::{Config, CONFIG_FILENAME};
use crate::credentials::FileCredentialStore;

/// Create the database and register configured distributors.
pub async fn cmd_init(config: &Config) -> anyhow::Result<()> {
    let (_storage, scheduler) = open_scheduler(config).await?;
    let count = scheduler.sync_distributors().await?;

    for (slug, distributor) in &config.distributors {
        let prefix = FileCredentialStore::env_prefix(slug);
        println!(
            "  {} {} ({}, {}){}",
            style("✓").green(),
            slug,
            distributor.strategy,
            distributor.base_url,
            if distributor.active { "" } else { " [inactive]" }
        );
        println!(
            "    credentials: {}_EMAIL/{}_PASSWORD or {}_API_KEY",
            prefix, prefix, prefix
        );
    }

    if count == 0 {
        println!("{} No distributors configured", style("!").yellow());
        println!(
            "  Add a [distributors.<slug>] table to {} to get started",
            CONFIG_FILENAME
        );
    }

    println!(
        "{} Initialized shelfsync in {}",
        style("✓").green(),
        config.data_dir().display()
    );
    Ok(())
}
