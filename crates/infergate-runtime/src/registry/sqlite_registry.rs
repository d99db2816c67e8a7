//! SQLite-backed registry for single-host deployments.

#![cfg(feature = "sqlite-persistence")]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use infergate_kernel::{RecordUpdate, RegistryError, WorkUnitRecord, WorkUnitStatus};

use super::repository::Registry;
use super::{dt_to_ms, ms_to_dt};

const SELECT_COLUMNS: &str = "id, status, data_location, external_job_handle, job_name, \
     output_location, submit_attempts, last_error, status_observed_at_ms, created_at_ms, updated_at_ms";

fn map_rusqlite_err(e: rusqlite::Error) -> RegistryError {
    RegistryError::Driver(e.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<WorkUnitRecord> {
    let status_raw: String = row.get(1)?;
    let status = status_raw
        .parse::<WorkUnitStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(WorkUnitRecord {
        id: row.get(0)?,
        status,
        data_location: row.get(2)?,
        external_job_handle: row.get(3)?,
        job_name: row.get(4)?,
        output_location: row.get(5)?,
        submit_attempts: row.get::<_, i64>(6)? as u32,
        last_error: row.get(7)?,
        status_observed_at: row
            .get::<_, Option<i64>>(8)?
            .map(|ms| timestamp(8, ms))
            .transpose()?,
        created_at: timestamp(9, row.get(9)?)?,
        updated_at: timestamp(10, row.get(10)?)?,
    })
}

fn timestamp(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    ms_to_dt(ms)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}

#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    pub fn new(db_path: &str) -> Result<Self, RegistryError> {
        let conn = Connection::open(db_path)
            .map_err(|e| RegistryError::Driver(format!("open sqlite registry: {}", e)))?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Driver("sqlite registry lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_units (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              status TEXT NOT NULL,
              data_location TEXT NOT NULL,
              external_job_handle TEXT NULL,
              job_name TEXT NULL,
              output_location TEXT NULL,
              submit_attempts INTEGER NOT NULL DEFAULT 0,
              last_error TEXT NULL,
              status_observed_at_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_work_units_status_created
              ON work_units(status, created_at_ms, seq);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_work_units_handle
              ON work_units(external_job_handle) WHERE external_job_handle IS NOT NULL;
            "#,
        )
        .map_err(|e| RegistryError::Driver(format!("init sqlite registry schema: {}", e)))?;
        Ok(())
    }

    fn select_one(
        conn: &Connection,
        where_clause: &str,
        key: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM work_units WHERE {where_clause}");
        conn.query_row(&sql, params![key], row_to_record)
            .optional()
            .map_err(map_rusqlite_err)
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn insert(&self, record: WorkUnitRecord) -> Result<(), RegistryError> {
        record.validate()?;
        let conn = self.lock()?;
        if Self::select_one(&conn, "id = ?1", &record.id)?.is_some() {
            return Err(RegistryError::DuplicateId(record.id));
        }
        let result = conn.execute(
            "INSERT INTO work_units (id, status, data_location, external_job_handle, job_name,
               output_location, submit_attempts, last_error, status_observed_at_ms,
               created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.status.as_str(),
                record.data_location,
                record.external_job_handle,
                record.job_name,
                record.output_location,
                record.submit_attempts as i64,
                record.last_error,
                record.status_observed_at.map(dt_to_ms),
                dt_to_ms(record.created_at),
                dt_to_ms(record.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(RegistryError::DuplicateHandle(
                record.external_job_handle.unwrap_or_default(),
            )),
            Err(e) => Err(RegistryError::Driver(format!("insert work unit: {}", e))),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let conn = self.lock()?;
        Self::select_one(&conn, "id = ?1", id)
    }

    async fn find_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let conn = self.lock()?;
        Self::select_one(&conn, "external_job_handle = ?1", handle)
    }

    async fn query_by_status(
        &self,
        status: WorkUnitStatus,
        limit: usize,
    ) -> Result<Vec<WorkUnitRecord>, RegistryError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM work_units
             WHERE status = ?1
             ORDER BY created_at_ms ASC, seq ASC
             LIMIT ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| RegistryError::Driver(format!("prepare query by status: {}", e)))?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], row_to_record)
            .map_err(|e| RegistryError::Driver(format!("query by status: {}", e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| RegistryError::Driver(format!("scan query by status: {}", e)))
    }

    async fn update_fields(&self, id: &str, update: RecordUpdate) -> Result<bool, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| RegistryError::Driver(format!("begin update tx: {}", e)))?;

        let current = Self::select_one(&tx, "id = ?1", id)?
            .ok_or_else(|| RegistryError::RecordNotFound(id.to_string()))?;
        if !update.guard_matches(&current) {
            return Ok(false);
        }
        let next = update.applied_to(&current)?;

        let result = tx.execute(
            "UPDATE work_units
             SET status = ?2, external_job_handle = ?3, job_name = ?4, output_location = ?5,
                 submit_attempts = ?6, last_error = ?7, status_observed_at_ms = ?8,
                 updated_at_ms = ?9
             WHERE id = ?1 AND status = ?10",
            params![
                id,
                next.status.as_str(),
                next.external_job_handle,
                next.job_name,
                next.output_location,
                next.submit_attempts as i64,
                next.last_error,
                next.status_observed_at.map(dt_to_ms),
                dt_to_ms(next.updated_at),
                current.status.as_str(),
            ],
        );
        let updated = match result {
            Ok(n) => n,
            Err(e) if is_constraint_violation(&e) => {
                return Err(RegistryError::DuplicateHandle(
                    next.external_job_handle.unwrap_or_default(),
                ));
            }
            Err(e) => return Err(RegistryError::Driver(format!("update work unit: {}", e))),
        };
        tx.commit()
            .map_err(|e| RegistryError::Driver(format!("commit update tx: {}", e)))?;
        Ok(updated == 1)
    }

    async fn status_counts(&self) -> Result<BTreeMap<WorkUnitStatus, u64>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM work_units GROUP BY status")
            .map_err(|e| RegistryError::Driver(format!("prepare status counts: {}", e)))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| RegistryError::Driver(format!("query status counts: {}", e)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.map_err(map_rusqlite_err)?;
            let status = status
                .parse::<WorkUnitStatus>()
                .map_err(|e| RegistryError::Driver(e.to_string()))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}
