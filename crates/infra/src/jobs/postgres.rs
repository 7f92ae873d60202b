//! Postgres-backed job store.
//!
//! ## Schema
//!
//! One row per job in a table whose name comes from configuration
//! (`TRACKS_TABLE_NAME`). [`PostgresJobStore::ensure_schema`] creates it when missing.
//!
//! ## Conditional update
//!
//! `transition` is a single `UPDATE ... WHERE id = $1 AND status = ANY($5)`
//! statement, so the status check and the write are atomic per row. Zero affected
//! rows means either the job does not exist or its status is not an allowed
//! predecessor; a follow-up read tells the two apart.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation, `23505`) on insert | `AlreadyExists` |
//! | Any other | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use karaoke_core::{Job, JobId, JobStatus, StatusChange};

use super::store::{JobStore, JobStoreError, ScanOutput};

const COLUMNS: &str = "id, input_location, status, output_location, failure_reason, created_at, updated_at";

/// Postgres-backed job record store.
///
/// Uses the SQLx connection pool, so it is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    table: String,
    scan_limit: Option<i64>,
}

impl PostgresJobStore {
    /// Wrap an existing pool. `table` must be a plain SQL identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, JobStoreError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(JobStoreError::storage(format!("invalid table name: {table:?}")));
        }
        Ok(Self {
            pool,
            table,
            scan_limit: None,
        })
    }

    /// Connect to `database_url` and make sure the table exists.
    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        let store = Self::new(pool, table)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Cap the number of rows a scan returns; hitting the cap sets `truncated`.
    pub fn with_scan_limit(mut self, limit: i64) -> Self {
        self.scan_limit = Some(limit.max(1));
        self
    }

    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                input_location TEXT NOT NULL,
                status TEXT NOT NULL,
                output_location TEXT NULL,
                failure_reason TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            table = self.table
        );

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn current_status(&self, job_id: JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let sql = format!("SELECT status FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status").map_err(map_sqlx_error)?;
                Ok(Some(parse_status(&status)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(table = %self.table, job_id = %job.id), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );

        sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.input_location)
            .bind(job.status.as_str())
            .bind(job.output_location.as_deref())
            .bind(job.failure_reason.as_deref())
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                let duplicate = e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if duplicate {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error(e)
                }
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, change), fields(table = %self.table, to = %change.to()), err)]
    async fn transition(&self, job_id: JobId, change: &StatusChange) -> Result<Job, JobStoreError> {
        let allowed: Vec<String> = change
            .to()
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let sql = format!(
            r#"
            UPDATE {}
            SET status = $2,
                output_location = $3,
                failure_reason = $4,
                updated_at = $6
            WHERE id = $1 AND status = ANY($5)
            RETURNING {COLUMNS}
            "#,
            self.table
        );

        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(change.to().as_str())
            .bind(change.output_location())
            .bind(change.failure_reason())
            .bind(allowed)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        match self.current_status(job_id).await? {
            Some(current) => Err(JobStoreError::ConditionFailed {
                job_id,
                current,
                requested: change.to(),
            }),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn scan(&self) -> Result<ScanOutput, JobStoreError> {
        let rows = match self.scan_limit {
            Some(limit) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM {} ORDER BY created_at, id LIMIT $1",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM {} ORDER BY created_at, id", self.table);
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(map_sqlx_error)?;

        let mut items = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;

        let truncated = match self.scan_limit {
            Some(limit) if items.len() as i64 > limit => {
                items.truncate(limit as usize);
                true
            }
            _ => false,
        };

        let mut out = ScanOutput::complete(items);
        out.truncated = truncated;
        Ok(out)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let id: Uuid = row.try_get("id").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(map_sqlx_error)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        input_location: row.try_get("input_location").map_err(map_sqlx_error)?,
        status: parse_status(&status)?,
        output_location: row.try_get("output_location").map_err(map_sqlx_error)?,
        failure_reason: row.try_get("failure_reason").map_err(map_sqlx_error)?,
        created_at,
        updated_at,
    })
}

fn parse_status(value: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::parse(value)
        .ok_or_else(|| JobStoreError::storage(format!("unknown status in table: {value:?}")))
}

fn map_sqlx_error(e: sqlx::Error) -> JobStoreError {
    JobStoreError::storage(e.to_string())
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
