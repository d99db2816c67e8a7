//! Postgres-backed registry for deployments where several schedulers share one store.
//!
//! This module is feature-gated behind `registry-postgres`.

#![cfg(feature = "registry-postgres")]

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;

use infergate_kernel::{RecordUpdate, RegistryError, WorkUnitRecord, WorkUnitStatus};

use super::repository::Registry;
use super::{dt_to_ms, ms_to_dt};

const SELECT_COLUMNS: &str = "id, status, data_location, external_job_handle, job_name, \
     output_location, submit_attempts, last_error, status_observed_at_ms, created_at_ms, updated_at_ms";

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Driver(format!("{prefix}: {e}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn row_to_record(row: &PgRow) -> Result<WorkUnitRecord, RegistryError> {
    let get_err = |e: sqlx::Error| map_driver_err("decode work unit row", e);
    let status_raw: String = row.try_get(1).map_err(get_err)?;
    let status = status_raw
        .parse::<WorkUnitStatus>()
        .map_err(|e| map_driver_err("decode work unit status", e))?;
    Ok(WorkUnitRecord {
        id: row.try_get(0).map_err(get_err)?,
        status,
        data_location: row.try_get(2).map_err(get_err)?,
        external_job_handle: row.try_get(3).map_err(get_err)?,
        job_name: row.try_get(4).map_err(get_err)?,
        output_location: row.try_get(5).map_err(get_err)?,
        submit_attempts: row.try_get::<i32, _>(6).map_err(get_err)? as u32,
        last_error: row.try_get(7).map_err(get_err)?,
        status_observed_at: row
            .try_get::<Option<i64>, _>(8)
            .map_err(get_err)?
            .map(ms_to_dt)
            .transpose()?,
        created_at: ms_to_dt(row.try_get::<i64, _>(9).map_err(get_err)?)?,
        updated_at: ms_to_dt(row.try_get::<i64, _>(10).map_err(get_err)?)?,
    })
}

#[derive(Clone)]
pub struct PostgresRegistry {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    schema_ready: std::sync::Arc<OnceCell<()>>,
}

impl PostgresRegistry {
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&database_url)
            .ok();
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres registry pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            schema_ready: std::sync::Arc::new(OnceCell::new()),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            schema_ready: std::sync::Arc::new(OnceCell::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn pool(&self) -> Result<&PgPool, RegistryError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    fn table(&self) -> String {
        format!("\"{}\".work_units", self.schema)
    }

    async fn ensure_schema(&self) -> Result<&PgPool, RegistryError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }
        let pool = self.pool()?;
        self.schema_ready
            .get_or_try_init(|| async {
                let schema = &self.schema;
                let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
                let sql_table = format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\".work_units (
                        seq BIGSERIAL PRIMARY KEY,
                        id TEXT NOT NULL UNIQUE,
                        status TEXT NOT NULL,
                        data_location TEXT NOT NULL,
                        external_job_handle TEXT NULL,
                        job_name TEXT NULL,
                        output_location TEXT NULL,
                        submit_attempts INTEGER NOT NULL DEFAULT 0,
                        last_error TEXT NULL,
                        status_observed_at_ms BIGINT NULL,
                        created_at_ms BIGINT NOT NULL,
                        updated_at_ms BIGINT NOT NULL
                    )",
                    schema
                );
                let sql_status_idx = format!(
                    "CREATE INDEX IF NOT EXISTS idx_work_units_status_created
                     ON \"{}\".work_units(status, created_at_ms, seq)",
                    schema
                );
                let sql_handle_idx = format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_work_units_handle
                     ON \"{}\".work_units(external_job_handle)
                     WHERE external_job_handle IS NOT NULL",
                    schema
                );
                for sql in [&sql_schema, &sql_table, &sql_status_idx, &sql_handle_idx] {
                    sqlx::query(sql)
                        .execute(pool)
                        .await
                        .map_err(|e| map_driver_err("schema bootstrap", e))?;
                }
                Ok::<(), RegistryError>(())
            })
            .await?;
        Ok(pool)
    }

    async fn select_one(
        &self,
        where_clause: &str,
        key: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let pool = self.ensure_schema().await?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE {where_clause}",
            self.table()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_driver_err("select work unit", e))?;
        row.as_ref().map(row_to_record).transpose()
    }
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn insert(&self, record: WorkUnitRecord) -> Result<(), RegistryError> {
        record.validate()?;
        let pool = self.ensure_schema().await?;
        if self.select_one("id = $1", &record.id).await?.is_some() {
            return Err(RegistryError::DuplicateId(record.id));
        }
        let sql = format!(
            "INSERT INTO {} (id, status, data_location, external_job_handle, job_name,
               output_location, submit_attempts, last_error, status_observed_at_ms,
               created_at_ms, updated_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.status.as_str())
            .bind(&record.data_location)
            .bind(&record.external_job_handle)
            .bind(&record.job_name)
            .bind(&record.output_location)
            .bind(record.submit_attempts as i32)
            .bind(&record.last_error)
            .bind(record.status_observed_at.map(dt_to_ms))
            .bind(dt_to_ms(record.created_at))
            .bind(dt_to_ms(record.updated_at))
            .execute(pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                if record.external_job_handle.is_some() {
                    Err(RegistryError::DuplicateHandle(
                        record.external_job_handle.unwrap_or_default(),
                    ))
                } else {
                    Err(RegistryError::DuplicateId(record.id))
                }
            }
            Err(e) => Err(map_driver_err("insert work unit", e)),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<WorkUnitRecord>, RegistryError> {
        self.select_one("id = $1", id).await
    }

    async fn find_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        self.select_one("external_job_handle = $1", handle).await
    }

    async fn query_by_status(
        &self,
        status: WorkUnitStatus,
        limit: usize,
    ) -> Result<Vec<WorkUnitRecord>, RegistryError> {
        let pool = self.ensure_schema().await?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {}
             WHERE status = $1
             ORDER BY created_at_ms ASC, seq ASC
             LIMIT $2",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(pool)
            .await
            .map_err(|e| map_driver_err("query by status", e))?;
        rows.iter().map(row_to_record).collect()
    }

    async fn update_fields(&self, id: &str, update: RecordUpdate) -> Result<bool, RegistryError> {
        let pool = self.ensure_schema().await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_driver_err("begin update tx", e))?;

        let select_sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
            self.table()
        );
        let row = sqlx::query(&select_sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_driver_err("lock work unit", e))?;
        let current = match row {
            Some(row) => row_to_record(&row)?,
            None => return Err(RegistryError::RecordNotFound(id.to_string())),
        };
        if !update.guard_matches(&current) {
            return Ok(false);
        }
        let next = update.applied_to(&current)?;

        let update_sql = format!(
            "UPDATE {}
             SET status = $2, external_job_handle = $3, job_name = $4, output_location = $5,
                 submit_attempts = $6, last_error = $7, status_observed_at_ms = $8,
                 updated_at_ms = $9
             WHERE id = $1",
            self.table()
        );
        let result = sqlx::query(&update_sql)
            .bind(id)
            .bind(next.status.as_str())
            .bind(&next.external_job_handle)
            .bind(&next.job_name)
            .bind(&next.output_location)
            .bind(next.submit_attempts as i32)
            .bind(&next.last_error)
            .bind(next.status_observed_at.map(dt_to_ms))
            .bind(dt_to_ms(next.updated_at))
            .execute(&mut *tx)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(RegistryError::DuplicateHandle(
                    next.external_job_handle.unwrap_or_default(),
                ));
            }
            Err(e) => return Err(map_driver_err("update work unit", e)),
        }

        tx.commit()
            .await
            .map_err(|e| map_driver_err("commit update tx", e))?;
        Ok(true)
    }

    async fn status_counts(&self) -> Result<BTreeMap<WorkUnitStatus, u64>, RegistryError> {
        let pool = self.ensure_schema().await?;
        let sql = format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(|e| map_driver_err("status counts", e))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row
                .try_get(0)
                .map_err(|e| map_driver_err("decode status count", e))?;
            let count: i64 = row
                .try_get(1)
                .map_err(|e| map_driver_err("decode status count", e))?;
            let status = status
                .parse::<WorkUnitStatus>()
                .map_err(|e| map_driver_err("decode status count", e))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}
