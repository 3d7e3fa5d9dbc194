//! PostgreSQL period repository

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tracing::debug;

use super::{PeriodRepository, Transition};
use crate::error::{IngestError, Result};
use crate::models::{FileType, PeriodKey, ProcessingPeriod, ProcessingStats};

const SELECT_COLUMNS: &str = r#"
    SELECT period_key, status, started_at, download_completed_at,
           processing_completed_at, retry_count, error_message,
           file_checksums, processing_stats, updated_at
    FROM processing_periods
"#;

/// Period repository on the `processing_periods` table
#[derive(Clone)]
pub struct PgPeriodRepository {
    pool: PgPool,
}

impl PgPeriodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: &PgRow) -> Result<ProcessingPeriod> {
    let key: String = row.try_get("period_key")?;
    let status: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let Json(file_checksums): Json<BTreeMap<FileType, String>> = row.try_get("file_checksums")?;
    let Json(processing_stats): Json<ProcessingStats> = row.try_get("processing_stats")?;

    Ok(ProcessingPeriod {
        key: key.parse()?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        download_completed_at: row.try_get("download_completed_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
        retry_count: retry_count.max(0) as u32,
        error_message: row.try_get("error_message")?,
        file_checksums,
        processing_stats,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PeriodRepository for PgPeriodRepository {
    async fn get(&self, key: PeriodKey) -> Result<Option<ProcessingPeriod>> {
        let sql = format!("{} WHERE period_key = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<ProcessingPeriod>> {
        let sql = format!("{} ORDER BY period_key DESC", SELECT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(from_row).collect()
    }

    async fn transition(
        &self,
        key: PeriodKey,
        create: bool,
        apply: Transition,
    ) -> Result<ProcessingPeriod> {
        let mut tx = self.pool.begin().await?;

        if create {
            sqlx::query(
                "INSERT INTO processing_periods (period_key) VALUES ($1) ON CONFLICT (period_key) DO NOTHING",
            )
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!("{} WHERE period_key = $1 FOR UPDATE", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("period {}", key)))?;

        let mut period = from_row(&row)?;
        // Dropping the transaction on a rejected guard rolls back the insert
        apply(&mut period)?;

        sqlx::query(
            r#"
            UPDATE processing_periods SET
                status = $2,
                started_at = $3,
                download_completed_at = $4,
                processing_completed_at = $5,
                retry_count = $6,
                error_message = $7,
                file_checksums = $8,
                processing_stats = $9,
                updated_at = $10
            WHERE period_key = $1
            "#,
        )
        .bind(key.to_string())
        .bind(period.status.as_str())
        .bind(period.started_at)
        .bind(period.download_completed_at)
        .bind(period.processing_completed_at)
        .bind(i32::try_from(period.retry_count).unwrap_or(i32::MAX))
        .bind(&period.error_message)
        .bind(Json(&period.file_checksums))
        .bind(Json(&period.processing_stats))
        .bind(period.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(period = %key, status = %period.status, "Period transition committed");
        Ok(period)
    }
}
