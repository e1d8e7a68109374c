use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flowcast_core::{floor_to, FeedType, TimeRange, Watermark};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::{FeedPolicies, FeedPolicy};
use crate::db::{parse_opt_ts, ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    /// Same timestamp as before; attempt bookkeeping still refreshed.
    Unchanged,
    /// Would move `last_success` backwards; nothing was written.
    Rejected,
}

/// The range still missing for one (site, feed), or `None` when it is up to date.
///
/// Both ends land on the feed's request granularity.
pub fn compute_range(
    watermark: Option<&Watermark>,
    feed: FeedType,
    policy: &FeedPolicy,
    now: DateTime<Utc>,
) -> Option<TimeRange> {
    let granularity = feed.request_granularity();
    let end = floor_to(now - policy.availability_lag(), granularity);

    if let Some(wm) = watermark {
        if wm.consecutive_failures == 0 {
            if let Some(last_attempt) = wm.last_attempt {
                if now - last_attempt < policy.min_recheck() {
                    return None;
                }
            }
        }
    }

    let start = match watermark.and_then(|wm| wm.last_success) {
        Some(last) => floor_to(last + feed.native_step() - policy.overlap(), granularity),
        None => floor_to(end - policy.max_lookback(), granularity),
    };

    let range = TimeRange::new(start, end)?;
    if watermark.and_then(|wm| wm.last_success).is_some() && range.duration() < policy.min_recheck() {
        return None;
    }
    Some(range)
}

#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    pool: SqlitePool,
    policies: FeedPolicies,
}

fn row_to_watermark(row: &sqlx::sqlite::SqliteRow, feed: FeedType) -> Result<Watermark> {
    let failures: i64 = row.try_get("consecutive_failures")?;
    Ok(Watermark {
        site_id: row.try_get("site_id")?,
        feed,
        last_success: parse_opt_ts(row.try_get("last_success")?),
        last_attempt: parse_opt_ts(row.try_get("last_attempt")?),
        consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
    })
}

impl WatermarkTracker {
    pub fn new(pool: SqlitePool, policies: FeedPolicies) -> Self {
        Self { pool, policies }
    }

    pub async fn get(&self, site_id: &str, feed: FeedType) -> Result<Option<Watermark>> {
        let row = sqlx::query(
            "SELECT site_id, last_success, last_attempt, consecutive_failures \
             FROM watermarks WHERE site_id = ? AND feed_type = ?",
        )
        .bind(site_id)
        .bind(feed.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading watermark for {site_id}/{feed}"))?;
        row.map(|row| row_to_watermark(&row, feed)).transpose()
    }

    pub async fn load_feed(&self, feed: FeedType) -> Result<HashMap<String, Watermark>> {
        let rows = sqlx::query(
            "SELECT site_id, last_success, last_attempt, consecutive_failures \
             FROM watermarks WHERE feed_type = ?",
        )
        .bind(feed.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading watermarks for {feed}"))?;

        rows.iter()
            .map(|row| row_to_watermark(row, feed).map(|wm| (wm.site_id.clone(), wm)))
            .collect()
    }

    /// What a run should fetch for this (site, feed) now, under the tracker's policies.
    pub async fn range_needed(
        &self,
        site_id: &str,
        feed: FeedType,
        now: DateTime<Utc>,
    ) -> Result<Option<TimeRange>> {
        let watermark = self.get(site_id, feed).await?;
        Ok(compute_range(
            watermark.as_ref(),
            feed,
            self.policies.for_feed(feed),
            now,
        ))
    }

    /// Move `last_success` forward. Only call after the records are durably committed.
    pub async fn advance(
        &self,
        site_id: &str,
        feed: FeedType,
        new_watermark: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let mut tx = self.pool.begin().await.context("opening watermark transaction")?;

        let current: Option<Option<String>> = sqlx::query_scalar(
            "SELECT last_success FROM watermarks WHERE site_id = ? AND feed_type = ?",
        )
        .bind(site_id)
        .bind(feed.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("reading current watermark")?;
        let current = parse_opt_ts(current.flatten());

        let outcome = match current {
            Some(existing) if new_watermark < existing => {
                warn!(
                    site_id,
                    %feed,
                    existing = %ts(existing),
                    proposed = %ts(new_watermark),
                    "refusing to move watermark backwards"
                );
                return Ok(AdvanceOutcome::Rejected);
            }
            Some(existing) if new_watermark == existing => AdvanceOutcome::Unchanged,
            _ => AdvanceOutcome::Advanced,
        };

        sqlx::query(
            "INSERT INTO watermarks (site_id, feed_type, last_success, last_attempt, consecutive_failures) \
             VALUES (?, ?, ?, ?, 0) \
             ON CONFLICT (site_id, feed_type) DO UPDATE SET \
               last_success = excluded.last_success, \
               last_attempt = excluded.last_attempt, \
               consecutive_failures = 0",
        )
        .bind(site_id)
        .bind(feed.as_str())
        .bind(ts(new_watermark))
        .bind(ts(at))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("advancing watermark for {site_id}/{feed}"))?;
        tx.commit().await.context("committing watermark")?;

        debug!(site_id, %feed, watermark = %ts(new_watermark), ?outcome, "watermark updated");
        Ok(outcome)
    }

    /// Attempt bookkeeping only; `last_success` is left alone.
    pub async fn record_attempt(
        &self,
        site_id: &str,
        feed: FeedType,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO watermarks (site_id, feed_type, last_success, last_attempt, consecutive_failures) \
             VALUES (?, ?, NULL, ?, ?) \
             ON CONFLICT (site_id, feed_type) DO UPDATE SET \
               last_attempt = excluded.last_attempt, \
               consecutive_failures = CASE WHEN excluded.consecutive_failures = 0 \
                 THEN 0 ELSE watermarks.consecutive_failures + 1 END",
        )
        .bind(site_id)
        .bind(feed.as_str())
        .bind(ts(at))
        .bind(if succeeded { 0i64 } else { 1i64 })
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording attempt for {site_id}/{feed}"))?;
        Ok(())
    }

    pub async fn reset(&self, feed: FeedType) -> Result<u64> {
        let done = sqlx::query("DELETE FROM watermarks WHERE feed_type = ?")
            .bind(feed.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("resetting watermarks for {feed}"))?;
        Ok(done.rows_affected())
    }
}
