use super::{parse_audit, parse_json, ACTIVE};
use crate::errors::AppResult;
use crate::models::{Audit, CreatePermissionPayload, WorkManagementPermission};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

const PERMISSION_COLUMNS: &str = "id, policy, permission_json, project_template_id,
     created_at, updated_at, created_by, updated_by, deleted_at, deleted_by";

pub fn insert_permission(
    conn: &Connection,
    payload: &CreatePermissionPayload,
    user_id: i64,
) -> AppResult<WorkManagementPermission> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO work_management_permissions (
           policy, permission_json, project_template_id, created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            payload.policy,
            serde_json::to_string(&payload.permission)?,
            payload.project_template_id,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(WorkManagementPermission {
        id: conn.last_insert_rowid(),
        policy: payload.policy.clone(),
        permission: payload.permission.clone(),
        project_template_id: payload.project_template_id,
        audit,
    })
}

pub fn find_permission(conn: &Connection, permission_id: i64) -> AppResult<Option<WorkManagementPermission>> {
    let found = conn
        .query_row(
            &format!("SELECT {PERMISSION_COLUMNS} FROM work_management_permissions WHERE id = ?1 AND {ACTIVE}"),
            [permission_id],
            parse_permission_row,
        )
        .optional()?;
    Ok(found)
}

/// Active row holding `(policy, project_template_id)`, other than `exclude_id`.
pub fn find_active_permission_by_pair(
    conn: &Connection,
    policy: &str,
    project_template_id: i64,
    exclude_id: Option<i64>,
) -> AppResult<Option<WorkManagementPermission>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {PERMISSION_COLUMNS} FROM work_management_permissions
                 WHERE policy = ?1 AND project_template_id = ?2 AND (?3 IS NULL OR id != ?3) AND {ACTIVE}
                 LIMIT 1"
            ),
            params![policy, project_template_id, exclude_id],
            parse_permission_row,
        )
        .optional()?;
    Ok(found)
}

/// Persists the mutable columns of `permission`. Creation audit columns are
/// never written here.
pub fn update_permission(conn: &Connection, permission: &WorkManagementPermission) -> AppResult<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE work_management_permissions
             SET policy = ?1, permission_json = ?2, project_template_id = ?3, updated_at = ?4, updated_by = ?5
             WHERE id = ?6 AND {ACTIVE}"
        ),
        params![
            permission.policy,
            serde_json::to_string(&permission.permission)?,
            permission.project_template_id,
            permission.audit.updated_at.to_rfc3339(),
            permission.audit.updated_by,
            permission.id,
        ],
    )?;
    Ok(changed > 0)
}

pub fn soft_delete_permission(conn: &Connection, permission_id: i64, user_id: i64) -> AppResult<bool> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        &format!(
            "UPDATE work_management_permissions SET deleted_at = ?1, deleted_by = ?2, updated_at = ?1
             WHERE id = ?3 AND {ACTIVE}"
        ),
        params![now, user_id, permission_id],
    )?;
    Ok(changed > 0)
}

fn parse_permission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkManagementPermission> {
    Ok(WorkManagementPermission {
        id: row.get("id")?,
        policy: row.get("policy")?,
        permission: parse_json(&row.get::<_, String>("permission_json")?)?,
        project_template_id: row.get("project_template_id")?,
        audit: parse_audit(row)?,
    })
}
