use super::{parse_audit, parse_json, ACTIVE};
use crate::errors::AppResult;
use crate::models::{Audit, ConfigKind, VersionedConfig};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

const CONFIG_COLUMNS: &str =
    "id, key, version, revision, config_json, created_at, updated_at, created_by, updated_by, deleted_at, deleted_by";

/// Latest active revision for `(key, version)`.
pub fn find_latest_config(
    conn: &Connection,
    kind: ConfigKind,
    key: &str,
    version: i64,
) -> AppResult<Option<VersionedConfig>> {
    let query = format!(
        "SELECT {CONFIG_COLUMNS} FROM {} WHERE key = ?1 AND version = ?2 AND {ACTIVE}
         ORDER BY revision DESC LIMIT 1",
        kind.table()
    );
    let found = conn
        .query_row(&query, params![key, version], parse_config_row)
        .optional()?;
    Ok(found)
}

/// Highest version of `key` that still has an active revision.
pub fn latest_version(conn: &Connection, kind: ConfigKind, key: &str) -> AppResult<Option<i64>> {
    let query = format!("SELECT MAX(version) FROM {} WHERE key = ?1 AND {ACTIVE}", kind.table());
    Ok(conn.query_row(&query, [key], |row| row.get::<_, Option<i64>>(0))?)
}

pub fn insert_config(
    conn: &Connection,
    kind: ConfigKind,
    key: &str,
    version: i64,
    revision: i64,
    config: &serde_json::Value,
    user_id: i64,
) -> AppResult<VersionedConfig> {
    let audit = Audit::created_now(user_id);
    let query = format!(
        "INSERT INTO {} (key, version, revision, config_json, created_at, updated_at, created_by, updated_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        kind.table()
    );
    conn.execute(
        &query,
        params![
            key,
            version,
            revision,
            serde_json::to_string(config)?,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(VersionedConfig {
        id: conn.last_insert_rowid(),
        key: key.to_string(),
        version,
        revision,
        config: config.clone(),
        audit,
    })
}

pub fn list_config_revisions(
    conn: &Connection,
    kind: ConfigKind,
    key: &str,
    version: i64,
) -> AppResult<Vec<VersionedConfig>> {
    let query = format!(
        "SELECT {CONFIG_COLUMNS} FROM {} WHERE key = ?1 AND version = ?2 AND {ACTIVE}
         ORDER BY revision DESC",
        kind.table()
    );
    let mut statement = conn.prepare(&query)?;
    let rows = statement
        .query_map(params![key, version], parse_config_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_config_revision(
    conn: &Connection,
    kind: ConfigKind,
    key: &str,
    version: i64,
    revision: i64,
) -> AppResult<Option<VersionedConfig>> {
    let query = format!(
        "SELECT {CONFIG_COLUMNS} FROM {} WHERE key = ?1 AND version = ?2 AND revision = ?3 AND {ACTIVE}",
        kind.table()
    );
    let found = conn
        .query_row(&query, params![key, version, revision], parse_config_row)
        .optional()?;
    Ok(found)
}

pub fn soft_delete_config_revision(
    conn: &Connection,
    kind: ConfigKind,
    key: &str,
    version: i64,
    revision: i64,
    user_id: i64,
) -> AppResult<bool> {
    let now = Utc::now().to_rfc3339();
    let query = format!(
        "UPDATE {} SET deleted_at = ?1, deleted_by = ?2, updated_at = ?1
         WHERE key = ?3 AND version = ?4 AND revision = ?5 AND {ACTIVE}",
        kind.table()
    );
    let changed = conn.execute(&query, params![now, user_id, key, version, revision])?;
    Ok(changed > 0)
}

fn parse_config_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionedConfig> {
    Ok(VersionedConfig {
        id: row.get("id")?,
        key: row.get("key")?,
        version: row.get("version")?,
        revision: row.get("revision")?,
        config: parse_json(&row.get::<_, String>("config_json")?)?,
        audit: parse_audit(row)?,
    })
}
