use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::fs;

use crate::db::ts;
use crate::orchestrator::RunSummary;

pub async fn record_run(pool: &SqlitePool, summary: &RunSummary) -> Result<()> {
    let summary_json = serde_json::to_string(summary).context("serializing run summary")?;
    sqlx::query(
        "INSERT INTO extraction_runs (run_id, feed_type, started_at, finished_at, status, summary_json) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (run_id) DO UPDATE SET \
           finished_at = excluded.finished_at, \
           status = excluded.status, \
           summary_json = excluded.summary_json",
    )
    .bind(summary.run_id.to_string())
    .bind(summary.feed.as_str())
    .bind(ts(summary.started_at))
    .bind(ts(summary.finished_at))
    .bind(summary.status())
    .bind(summary_json)
    .execute(pool)
    .await
    .with_context(|| format!("recording run {}", summary.run_id))?;
    Ok(())
}

pub fn brief_markdown(summary: &RunSummary) -> String {
    let mut out = format!(
        "# Extraction Brief: {feed}\n\n- Run ID: `{run}`\n- Started: {started}\n- Finished: {finished}\n- Status: {status}\n\n\
         ## Sites\n- attempted: {attempted}\n- succeeded: {succeeded}\n- transiently failed (will retry): {transient}\n\
         - permanently excluded: {excluded}\n- already up to date: {up_to_date}\n\n\
         ## Batches\n- planned: {planned}\n- attempted: {batches_attempted}\n- committed: {committed}\n- write failures: {write_failures}\n\n\
         ## Records\n- fetched: {fetched}\n- inserted: {inserted}\n- cache hits: {cache_hits}\n",
        feed = summary.feed,
        run = summary.run_id,
        started = ts(summary.started_at),
        finished = ts(summary.finished_at),
        status = summary.status(),
        attempted = summary.sites_attempted,
        succeeded = summary.sites_succeeded,
        transient = summary.sites_transient_failed,
        excluded = summary.sites_permanently_excluded,
        up_to_date = summary.sites_up_to_date,
        planned = summary.batches_planned,
        batches_attempted = summary.batches_attempted,
        committed = summary.batches_committed,
        write_failures = summary.write_failures,
        fetched = summary.records_fetched,
        inserted = summary.records_inserted,
        cache_hits = summary.cache_hits,
    );
    if let Some(reason) = summary.escalation() {
        out.push_str(&format!("\n## Escalation\n{reason}\n"));
    }
    out
}

/// `<reports_dir>/<run_id>/run_summary.json` plus `brief.md`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}
