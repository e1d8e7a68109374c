use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flowcast_core::{format_timestamp, parse_timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if needed) the sqlite database and apply embedded migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    Ok(pool)
}

pub(crate) fn ts(value: DateTime<Utc>) -> String {
    format_timestamp(value)
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_timestamp)
}
