//! Run command.

use std::sync::Arc;

use console::style;

use super::helpers::{open_scheduler, short_id, styled_status};
use crate::config::Config;

/// Run one paced session for each requested distributor.
pub async fn cmd_run(
    config: &Config,
    slugs: Vec<String>,
    all: bool,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let (_storage, mut scheduler) = open_scheduler(config).await?;
    if let Some(n) = concurrency {
        scheduler.set_concurrency(n);
    }

    let slugs = if all { scheduler.active_slugs() } else { slugs };
    if slugs.is_empty() {
        anyhow::bail!("No distributors given; pass one or more slugs or --all");
    }
    scheduler.sync_distributors().await?;

    println!(
        "{} Running {} distributor(s), {} at a time",
        style("→").cyan(),
        slugs.len(),
        scheduler.config().concurrency
    );

    let scheduler = Arc::new(scheduler);
    let interrupt = {
        let scheduler = scheduler.clone();
        let slugs = slugs.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Stopping after the current page...", style("!").yellow());
                for slug in &slugs {
                    scheduler.stop(slug);
                }
            }
        })
    };

    let results = scheduler.run_many(&slugs).await;
    interrupt.abort();

    let mut failures = 0;
    for (slug, result) in results {
        match result {
            Ok(summary) => {
                let run = &summary.run;
                println!(
                    "{} {} run {} {}: {} products over {} pages ({} matched, {} new, {} queued, {} failed)",
                    style("✓").green(),
                    style(&slug).bold(),
                    short_id(&run.id),
                    styled_status(run.status),
                    run.products_found,
                    run.pages_fetched,
                    run.matched,
                    run.created,
                    run.queued,
                    run.failed
                );
                if let Some(pacing) = &summary.pacing {
                    println!(
                        "    budget {}/{}, next: {} @ {}",
                        pacing.items_scraped,
                        pacing.daily_limit,
                        pacing.last_category.as_deref().unwrap_or("-"),
                        pacing.last_offset
                    );
                }
                for error in &summary.errors {
                    println!(
                        "    {} [{}] {}{}",
                        style("✗").red(),
                        error.kind,
                        error
                            .category
                            .as_deref()
                            .map(|c| format!("{}: ", c))
                            .unwrap_or_default(),
                        error.message
                    );
                }
            }
            Err(e) if e.is_refusal() => {
                println!("{} {}: {}", style("!").yellow(), slug, e);
            }
            Err(e) => {
                failures += 1;
                println!("{} {}: {}", style("✗").red(), slug, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} distributor(s) could not be run", failures);
    }
    Ok(())
}
