//! Read-only status commands.

use chrono::NaiveDate;
use console::style;

use super::helpers::{format_time, open_scheduler, short_id, styled_status};
use crate::config::Config;
use crate::pacing::{PacingPhase, PacingTracker};
use crate::storage::StorageGateway;

/// Show pacing state for one distributor and day.
pub async fn cmd_status(
    config: &Config,
    slug: &str,
    date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let (_storage, scheduler) = open_scheduler(config).await?;
    let date = date.unwrap_or_else(PacingTracker::today);
    let state = scheduler.pacing_state(slug, date).await?;
    let phase = PacingPhase::of(state.as_ref());

    println!("{} {} on {}", style("Pacing").bold(), slug, date);
    println!("  phase:     {}", phase.as_str());
    match state {
        Some(state) => {
            println!("  budget:    {}/{}", state.items_scraped, state.daily_limit);
            println!(
                "  cursor:    {} @ {}",
                state.last_category.as_deref().unwrap_or("-"),
                state.last_offset
            );
            println!("  sessions:  {}", state.sessions_today);
            if let Some(at) = &state.last_session_at {
                println!("  last:      {}", format_time(at));
            }
        }
        None => {
            if let Some(cfg) = config.distributors.get(slug) {
                println!("  budget:    0/{}", cfg.pacing.daily_limit);
            }
        }
    }

    if let Some(run) = scheduler.recent_runs(slug, 1).await?.into_iter().next() {
        println!(
            "  last run:  {} {} ({} products)",
            short_id(&run.id),
            styled_status(run.status),
            run.products_found
        );
    }
    Ok(())
}

/// List recent runs with their errors.
pub async fn cmd_runs(config: &Config, slug: &str, limit: usize) -> anyhow::Result<()> {
    let (_storage, scheduler) = open_scheduler(config).await?;
    let runs = scheduler.recent_runs(slug, limit).await?;
    if runs.is_empty() {
        println!("{} No runs for {}", style("!").yellow(), slug);
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {:<9}  {:>5} products  {:>3} pages  {:>3} errors  m{} c{} q{} f{}",
            short_id(&run.id),
            format_time(&run.started_at),
            styled_status(run.status),
            run.products_found,
            run.pages_fetched,
            run.error_count,
            run.matched,
            run.created,
            run.queued,
            run.failed
        );
        if run.error_count > 0 {
            for error in scheduler.run_errors(&run.id).await? {
                println!(
                    "    {} [{}] {}",
                    style("✗").red(),
                    error.kind,
                    error.message
                );
            }
        }
    }
    Ok(())
}

/// List provisional matches waiting for review.
pub async fn cmd_queue(config: &Config, limit: usize) -> anyhow::Result<()> {
    let (storage, scheduler) = open_scheduler(config).await?;
    let pending = scheduler.pending_matches(limit).await?;
    if pending.is_empty() {
        println!("{} Review queue is empty", style("✓").green());
        return Ok(());
    }

    for item in pending {
        let raw = storage.get_raw_record(&item.raw_record_id).await?;
        let candidate = storage.get_product(&item.candidate_product_id).await?;
        println!(
            "{}  {:.2}  {} -> {}",
            short_id(&item.id),
            item.confidence,
            raw.map(|r| format!("{}:{} {}", r.source, r.external_id, r.name))
                .unwrap_or_else(|| item.raw_record_id.clone()),
            candidate
                .map(|p| p.name)
                .unwrap_or_else(|| item.candidate_product_id.clone())
        );
    }
    Ok(())
}
