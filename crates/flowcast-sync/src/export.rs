use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use flowcast_core::{FeedType, ForcingVariable};
use flowcast_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::fs;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Text,
    NullableText,
    Real,
    Integer,
}

struct TableLayout {
    name: &'static str,
    columns: Vec<(&'static str, ColumnKind)>,
    order_by: &'static str,
}

fn table_layouts() -> Vec<TableLayout> {
    use ColumnKind::*;

    let streamflow = |name| TableLayout {
        name,
        columns: vec![
            ("site_id", Text),
            ("observed_at", Text),
            ("discharge_cfs", Real),
            ("qualifiers", NullableText),
            ("fetched_at", Text),
        ],
        order_by: "site_id, observed_at",
    };

    let mut weather_columns = vec![("site_id", Text), ("observed_at", Text)];
    weather_columns.extend(ForcingVariable::ALL.iter().map(|v| (v.column_name(), Real)));
    weather_columns.push(("fetched_at", Text));

    vec![
        TableLayout {
            name: "sites",
            columns: vec![
                ("site_id", Text),
                ("station_name", NullableText),
                ("latitude", Real),
                ("longitude", Real),
                ("region_code", Text),
                ("huc_code", NullableText),
                ("drainage_area_sq_mi", Real),
                ("altitude_ft", Real),
                ("declared_feeds", Text),
                ("discovered_at", Text),
                ("refreshed_at", Text),
            ],
            order_by: "site_id",
        },
        TableLayout {
            name: "site_capabilities",
            columns: vec![
                ("site_id", Text),
                ("feed_type", Text),
                ("capability", Text),
                ("detail", NullableText),
                ("checked_at", Text),
            ],
            order_by: "site_id, feed_type",
        },
        TableLayout {
            name: "watermarks",
            columns: vec![
                ("site_id", Text),
                ("feed_type", Text),
                ("last_success", NullableText),
                ("last_attempt", NullableText),
                ("consecutive_failures", Integer),
            ],
            order_by: "site_id, feed_type",
        },
        streamflow(FeedType::StreamflowInstant.table_name()),
        streamflow(FeedType::StreamflowDaily.table_name()),
        TableLayout {
            name: FeedType::WeatherHourly.table_name(),
            columns: weather_columns,
            order_by: "site_id, observed_at",
        },
    ]
}

fn column_array(rows: &[SqliteRow], column: &str, kind: ColumnKind) -> Result<ArrayRef> {
    let array: ArrayRef = match kind {
        ColumnKind::Text | ColumnKind::NullableText => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<String>, _>(column))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("reading column {column}"))?;
            Arc::new(StringArray::from(values))
        }
        ColumnKind::Real => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<f64>, _>(column))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("reading column {column}"))?;
            Arc::new(Float64Array::from(values))
        }
        ColumnKind::Integer => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<i64>, _>(column))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("reading column {column}"))?;
            Arc::new(Int64Array::from(values))
        }
    };
    Ok(array)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

async fn export_table(pool: &SqlitePool, layout: &TableLayout, path: &Path) -> Result<usize> {
    let names: Vec<&str> = layout.columns.iter().map(|(name, _)| *name).collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        names.join(", "),
        layout.name,
        layout.order_by
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading {}", layout.name))?;

    let schema = Arc::new(Schema::new(
        layout.columns
            .iter()
            .map(|(name, kind)| {
                let (data_type, nullable) = match kind {
                    ColumnKind::Text => (DataType::Utf8, false),
                    ColumnKind::NullableText => (DataType::Utf8, true),
                    ColumnKind::Real => (DataType::Float64, true),
                    ColumnKind::Integer => (DataType::Int64, false),
                };
                ArrowField::new(*name, data_type, nullable)
            })
            .collect::<Vec<_>>(),
    ));
    let arrays = layout
        .columns
        .iter()
        .map(|(name, kind)| column_array(&rows, name, *kind))
        .collect::<Result<Vec<_>>>()?;

    let batch = RecordBatch::try_new(schema, arrays)
        .with_context(|| format!("building {} record batch", layout.name))?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Dump the staged tables to parquet under `out_dir`, returning the manifest path.
pub async fn export_snapshot(pool: &SqlitePool, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut files = Vec::new();
    for layout in table_layouts() {
        let path = out_dir.join(format!("{}.parquet", layout.name));
        let rows = export_table(pool, &layout, &path).await?;
        files.push(manifest_entry(layout.name, out_dir, &path, rows)?);
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}
