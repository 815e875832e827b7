mod configs;
mod permissions;
mod templates;
mod works;

pub use configs::{
    find_config_revision, find_latest_config, insert_config, latest_version, list_config_revisions,
    soft_delete_config_revision,
};
pub use permissions::{
    find_active_permission_by_pair, find_permission, insert_permission, soft_delete_permission,
    update_permission,
};
pub use templates::{
    find_active_template_by_key, find_project_template, find_project_type, insert_project_template,
    insert_project_type, soft_delete_project_template,
};
pub use works::{
    find_phase_in_work_stream, find_product_template, find_work_stream, insert_phase, insert_phase_product,
    insert_product_template, insert_work_stream, link_phase_to_work_stream, list_phase_products,
    shift_sibling_orders,
};

use crate::errors::{AppError, AppResult};
use crate::models::Audit;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Every read and uniqueness check appends this predicate explicitly.
pub(crate) const ACTIVE: &str = "deleted_at IS NULL";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `work` as one unit of work. The transaction is opened IMMEDIATE so
    /// the write lock is held from the first read; it commits when `work`
    /// returns `Ok` and rolls back otherwise.
    pub fn transaction<T, F>(&self, work: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match work(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback() {
                    tracing::warn!(error = %rollback_error, "transaction rollback failed");
                }
                Err(error)
            }
        }
    }

    /// Plain access for single-statement reads.
    pub fn read<T, F>(&self, work: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T>,
    {
        let conn = self.lock()?;
        work(&conn)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

pub(crate) fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

pub(crate) fn parse_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error))
    })
}

pub(crate) fn parse_optional_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> rusqlite::Result<Option<T>> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error))
        })
    })
    .transpose()
}

pub(crate) fn parse_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Audit> {
    Ok(Audit {
        created_at: parse_time(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_time(&row.get::<_, String>("updated_at")?)?,
        created_by: row.get("created_by")?,
        updated_by: row.get("updated_by")?,
        deleted_at: parse_optional_time(row.get("deleted_at")?)?,
        deleted_by: row.get("deleted_by")?,
    })
}
