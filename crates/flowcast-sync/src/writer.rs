use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use flowcast_core::{FeedType, ForcingVariable, Measurement, ObservationRecord};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::db::ts;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("record for {site_id} belongs to {found}, expected {expected}")]
    FeedMismatch {
        site_id: String,
        found: FeedType,
        expected: FeedType,
    },
    #[error("record for {site_id} carries a measurement that does not fit {feed}")]
    MeasurementMismatch { site_id: String, feed: FeedType },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub inserted: u64,
    /// Rows already present under the same key.
    pub skipped: u64,
    /// Latest timestamp per site among the committed records, new or pre-existing.
    pub per_site_max: BTreeMap<String, DateTime<Utc>>,
}

/// Append-only, idempotent commits into the per-feed tables.
#[derive(Debug, Clone)]
pub struct ObservationWriter {
    pool: SqlitePool,
}

fn validate(feed: FeedType, record: &ObservationRecord) -> Result<(), WriteError> {
    if record.feed != feed {
        return Err(WriteError::FeedMismatch {
            site_id: record.site_id.clone(),
            found: record.feed,
            expected: feed,
        });
    }
    let fits = matches!(
        (&record.measurement, feed),
        (Measurement::Discharge { .. }, FeedType::StreamflowInstant | FeedType::StreamflowDaily)
            | (Measurement::Forcing(_), FeedType::WeatherHourly)
    );
    if !fits {
        return Err(WriteError::MeasurementMismatch {
            site_id: record.site_id.clone(),
            feed,
        });
    }
    Ok(())
}

fn forcing_columns() -> String {
    ForcingVariable::ALL
        .iter()
        .map(ForcingVariable::column_name)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ObservationWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist `records` in one transaction. Either every record is durable or none is;
    /// replaying the same records changes nothing.
    pub async fn commit(
        &self,
        feed: FeedType,
        records: &[ObservationRecord],
    ) -> Result<CommitReceipt, WriteError> {
        for record in records {
            validate(feed, record)?;
        }

        let mut ordered: Vec<&ObservationRecord> = records.iter().collect();
        ordered.sort_by(|a, b| {
            a.site_id
                .cmp(&b.site_id)
                .then_with(|| a.observed_at.cmp(&b.observed_at))
        });

        let mut receipt = CommitReceipt::default();
        if ordered.is_empty() {
            return Ok(receipt);
        }

        let table = feed.table_name();
        let sql = match feed {
            FeedType::WeatherHourly => format!(
                "INSERT INTO {table} (site_id, observed_at, {}, fetched_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (site_id, observed_at) DO NOTHING",
                forcing_columns()
            ),
            _ => format!(
                "INSERT INTO {table} (site_id, observed_at, discharge_cfs, qualifiers, fetched_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (site_id, observed_at) DO NOTHING"
            ),
        };

        let mut tx = self.pool.begin().await?;
        for record in ordered {
            let mut query = sqlx::query(&sql)
                .bind(&record.site_id)
                .bind(ts(record.observed_at));
            query = match &record.measurement {
                Measurement::Discharge { cfs, qualifiers } => query.bind(*cfs).bind(qualifiers.clone()),
                Measurement::Forcing(values) => ForcingVariable::ALL
                    .iter()
                    .fold(query, |q, var| q.bind(values.get(*var))),
            };
            let done = query.bind(ts(record.fetched_at)).execute(&mut *tx).await?;

            if done.rows_affected() > 0 {
                receipt.inserted += 1;
            } else {
                receipt.skipped += 1;
            }
            receipt
                .per_site_max
                .entry(record.site_id.clone())
                .and_modify(|max| *max = (*max).max(record.observed_at))
                .or_insert(record.observed_at);
        }
        tx.commit().await?;

        debug!(
            %feed,
            inserted = receipt.inserted,
            skipped = receipt.skipped,
            sites = receipt.per_site_max.len(),
            "committed observations"
        );
        Ok(receipt)
    }

    /// Drop every row of a feed table; used only for an explicit full refresh.
    pub async fn truncate(&self, feed: FeedType) -> Result<u64, WriteError> {
        let done = sqlx::query(&format!("DELETE FROM {}", feed.table_name()))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn row_count(&self, feed: FeedType) -> Result<i64, WriteError> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", feed.table_name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowcast_core::ForcingValues;

    fn discharge(site_id: &str, feed: FeedType, hour: u32) -> ObservationRecord {
        ObservationRecord {
            site_id: site_id.to_string(),
            feed,
            observed_at: Utc.with_ymd_and_hms(2025, 3, 9, hour, 0, 0).unwrap(),
            measurement: Measurement::Discharge {
                cfs: Some(120.0),
                qualifiers: Some("P".to_string()),
            },
            fetched_at: Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
        }
    }

    async fn writer(dir: &tempfile::TempDir) -> ObservationWriter {
        let url = format!("sqlite://{}", dir.path().join("writer.db").display());
        ObservationWriter::new(crate::db::connect(&url).await.expect("database"))
    }

    #[test]
    fn records_must_match_the_target_feed() {
        let daily = discharge("06800000", FeedType::StreamflowDaily, 0);
        assert!(validate(FeedType::StreamflowDaily, &daily).is_ok());
        assert!(matches!(
            validate(FeedType::StreamflowInstant, &daily),
            Err(WriteError::FeedMismatch { expected: FeedType::StreamflowInstant, .. })
        ));

        let mut forcing_in_streamflow = daily.clone();
        forcing_in_streamflow.measurement = Measurement::Forcing(ForcingValues::default());
        assert!(matches!(
            validate(FeedType::StreamflowDaily, &forcing_in_streamflow),
            Err(WriteError::MeasurementMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir).await;
        let receipt = writer.commit(FeedType::StreamflowDaily, &[]).await.expect("commit");
        assert_eq!(receipt, CommitReceipt::default());
        assert_eq!(writer.row_count(FeedType::StreamflowDaily).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn one_bad_record_refuses_the_whole_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir).await;
        let batch = vec![
            discharge("06800000", FeedType::StreamflowInstant, 1),
            discharge("06800001", FeedType::StreamflowDaily, 1),
        ];
        let err = writer.commit(FeedType::StreamflowInstant, &batch).await.expect_err("mismatch");
        assert!(matches!(err, WriteError::FeedMismatch { ref site_id, .. } if site_id == "06800001"));
        assert_eq!(writer.row_count(FeedType::StreamflowInstant).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn replayed_records_are_skipped_but_still_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = writer(&dir).await;
        let batch = vec![
            discharge("06800000", FeedType::StreamflowInstant, 2),
            discharge("06800000", FeedType::StreamflowInstant, 1),
        ];
        let first = writer.commit(FeedType::StreamflowInstant, &batch).await.expect("commit");
        assert_eq!((first.inserted, first.skipped), (2, 0));

        let replay = writer.commit(FeedType::StreamflowInstant, &batch).await.expect("commit");
        assert_eq!((replay.inserted, replay.skipped), (0, 2));
        assert_eq!(
            replay.per_site_max.get("06800000"),
            Some(&Utc.with_ymd_and_hms(2025, 3, 9, 2, 0, 0).unwrap())
        );
        assert_eq!(writer.row_count(FeedType::StreamflowInstant).await.expect("count"), 2);
    }
}
