use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ObjectId, ReportId, SourceKind, Verdict};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object_id: ObjectId,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub object_id: ObjectId,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub prediction: Verdict,
    pub source: SourceKind,
    pub confidence: Option<f64>,
    pub sfw_confidence: Option<f64>,
    pub nsfw_confidence: Option<f64>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredReport {
    pub report_id: ReportId,
    pub prediction: Verdict,
    pub source: SourceKind,
    pub confidence: Option<f64>,
    pub sfw_confidence: Option<f64>,
    pub nsfw_confidence: Option<f64>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Writes an object, replacing any previous object under the same key.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<ObjectId> {
        if bucket.trim().is_empty() || key.trim().is_empty() {
            return Err(anyhow!("bucket and object key must not be empty"));
        }
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        let rec = sqlx::query(
            "INSERT INTO archived_objects (bucket, object_key, content_type, bytes, size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, object_key) DO UPDATE SET
                content_type = excluded.content_type,
                bytes = excluded.bytes,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at
             RETURNING id",
        )
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(bytes)
        .bind(size_bytes)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to store object '{key}' in bucket '{bucket}'"))?;
        Ok(ObjectId(rec.get::<i64, _>(0)))
    }

    pub async fn load_object(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let row = sqlx::query(
            "SELECT id, bucket, object_key, content_type, bytes, created_at
             FROM archived_objects
             WHERE bucket = ? AND object_key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredObject {
            object_id: ObjectId(r.get::<i64, _>(0)),
            bucket: r.get::<String, _>(1),
            key: r.get::<String, _>(2),
            content_type: r.get::<Option<String>, _>(3),
            bytes: r.get::<Vec<u8>, _>(4),
            created_at: r.get::<DateTime<Utc>, _>(5),
        }))
    }

    /// Newest first, payloads excluded.
    pub async fn list_objects(&self, bucket: &str, limit: u32) -> Result<Vec<ObjectSummary>> {
        let rows = sqlx::query(
            "SELECT id, bucket, object_key, content_type, size_bytes, created_at
             FROM archived_objects
             WHERE bucket = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(bucket)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ObjectSummary {
                object_id: ObjectId(r.get::<i64, _>(0)),
                bucket: r.get::<String, _>(1),
                key: r.get::<String, _>(2),
                content_type: r.get::<Option<String>, _>(3),
                size_bytes: r.get::<i64, _>(4).max(0) as u64,
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    pub async fn insert_report(&self, report: &NewReport) -> Result<ReportId> {
        let rec = sqlx::query(
            "INSERT INTO prediction_reports (prediction, source_type, confidence, sfw_confidence, nsfw_confidence, image_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(report.prediction.as_str())
        .bind(report.source.as_str())
        .bind(report.confidence)
        .bind(report.sfw_confidence)
        .bind(report.nsfw_confidence)
        .bind(report.image_url.as_deref())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert prediction report")?;
        Ok(ReportId(rec.get::<i64, _>(0)))
    }

    /// Newest first.
    pub async fn list_reports(&self, limit: u32) -> Result<Vec<StoredReport>> {
        let rows = sqlx::query(
            "SELECT id, prediction, source_type, confidence, sfw_confidence, nsfw_confidence, image_url, created_at
             FROM prediction_reports
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(report_from_row).collect()
    }
}

fn report_from_row(r: &SqliteRow) -> Result<StoredReport> {
    let prediction = r.get::<String, _>(1);
    let source = r.get::<String, _>(2);
    Ok(StoredReport {
        report_id: ReportId(r.get::<i64, _>(0)),
        prediction: Verdict::parse(&prediction)
            .ok_or_else(|| anyhow!("unknown prediction label '{prediction}' in reports table"))?,
        source: SourceKind::parse(&source)
            .ok_or_else(|| anyhow!("unknown source type '{source}' in reports table"))?,
        confidence: r.get::<Option<f64>, _>(3),
        sfw_confidence: r.get::<Option<f64>, _>(4),
        nsfw_confidence: r.get::<Option<f64>, _>(5),
        image_url: r.get::<Option<String>, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
