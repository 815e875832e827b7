use super::{parse_audit, parse_json, parse_optional_json, ACTIVE};
use crate::errors::AppResult;
use crate::models::{Audit, CreateProjectTemplatePayload, NewProjectType, ProjectTemplate, ProjectType};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

const TEMPLATE_COLUMNS: &str = "id, name, key, category, type, icon, question, info, aliases_json, disabled, hidden,
     scope_json, phases_json, form_json, price_config_json, plan_config_json,
     created_at, updated_at, created_by, updated_by, deleted_at, deleted_by";

pub fn insert_project_type(conn: &Connection, project_type: &NewProjectType, user_id: i64) -> AppResult<ProjectType> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO project_types (
           key, display_name, icon, question, info, aliases_json, metadata_json,
           created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            project_type.key,
            project_type.display_name,
            project_type.icon,
            project_type.question,
            project_type.info,
            serde_json::to_string(&project_type.aliases)?,
            serde_json::to_string(&project_type.metadata)?,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(ProjectType {
        key: project_type.key.clone(),
        display_name: project_type.display_name.clone(),
        icon: project_type.icon.clone(),
        question: project_type.question.clone(),
        info: project_type.info.clone(),
        aliases: project_type.aliases.clone(),
        metadata: project_type.metadata.clone(),
        audit,
    })
}

pub fn find_project_type(conn: &Connection, key: &str) -> AppResult<Option<ProjectType>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT key, display_name, icon, question, info, aliases_json, metadata_json,
                        created_at, updated_at, created_by, updated_by, deleted_at, deleted_by
                 FROM project_types WHERE key = ?1 AND {ACTIVE}"
            ),
            [key],
            |row| {
                Ok(ProjectType {
                    key: row.get("key")?,
                    display_name: row.get("display_name")?,
                    icon: row.get("icon")?,
                    question: row.get("question")?,
                    info: row.get("info")?,
                    aliases: parse_optional_json(row.get("aliases_json")?)?.unwrap_or_default(),
                    metadata: parse_json(&row.get::<_, String>("metadata_json")?)?,
                    audit: parse_audit(row)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}

pub fn insert_project_template(
    conn: &Connection,
    payload: &CreateProjectTemplatePayload,
    user_id: i64,
) -> AppResult<ProjectTemplate> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO project_templates (
           name, key, category, type, icon, question, info, aliases_json, disabled, hidden,
           scope_json, phases_json, form_json, price_config_json, plan_config_json,
           created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            payload.name,
            payload.key,
            payload.category,
            payload.project_type,
            payload.icon,
            payload.question,
            payload.info,
            serde_json::to_string(&payload.aliases)?,
            payload.disabled,
            payload.hidden,
            to_optional_json(&payload.scope)?,
            to_optional_json(&payload.phases)?,
            to_optional_json(&payload.form)?,
            to_optional_json(&payload.price_config)?,
            to_optional_json(&payload.plan_config)?,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(ProjectTemplate {
        id: conn.last_insert_rowid(),
        name: payload.name.clone(),
        key: payload.key.clone(),
        category: payload.category.clone(),
        project_type: payload.project_type.clone(),
        icon: payload.icon.clone(),
        question: payload.question.clone(),
        info: payload.info.clone(),
        aliases: payload.aliases.clone(),
        disabled: payload.disabled,
        hidden: payload.hidden,
        scope: payload.scope.clone(),
        phases: payload.phases.clone(),
        form: payload.form.clone(),
        price_config: payload.price_config.clone(),
        plan_config: payload.plan_config.clone(),
        audit,
    })
}

pub fn find_project_template(conn: &Connection, template_id: i64) -> AppResult<Option<ProjectTemplate>> {
    let found = conn
        .query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM project_templates WHERE id = ?1 AND {ACTIVE}"),
            [template_id],
            parse_template_row,
        )
        .optional()?;
    Ok(found)
}

pub fn find_active_template_by_key(conn: &Connection, key: &str) -> AppResult<Option<ProjectTemplate>> {
    let found = conn
        .query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM project_templates WHERE key = ?1 AND {ACTIVE}"),
            [key],
            parse_template_row,
        )
        .optional()?;
    Ok(found)
}

pub fn soft_delete_project_template(conn: &Connection, template_id: i64, user_id: i64) -> AppResult<bool> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        &format!(
            "UPDATE project_templates SET deleted_at = ?1, deleted_by = ?2, updated_at = ?1
             WHERE id = ?3 AND {ACTIVE}"
        ),
        params![now, user_id, template_id],
    )?;
    Ok(changed > 0)
}

fn to_optional_json<T: serde::Serialize>(value: &Option<T>) -> AppResult<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn parse_template_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectTemplate> {
    Ok(ProjectTemplate {
        id: row.get("id")?,
        name: row.get("name")?,
        key: row.get("key")?,
        category: row.get("category")?,
        project_type: row.get("type")?,
        icon: row.get("icon")?,
        question: row.get("question")?,
        info: row.get("info")?,
        aliases: parse_optional_json(row.get("aliases_json")?)?.unwrap_or_default(),
        disabled: row.get("disabled")?,
        hidden: row.get("hidden")?,
        scope: parse_optional_json(row.get("scope_json")?)?,
        phases: parse_optional_json(row.get("phases_json")?)?,
        form: parse_optional_json(row.get("form_json")?)?,
        price_config: parse_optional_json(row.get("price_config_json")?)?,
        plan_config: parse_optional_json(row.get("plan_config_json")?)?,
        audit: parse_audit(row)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::ConfigReference;

    fn template_payload(key: &str) -> CreateProjectTemplatePayload {
        CreateProjectTemplatePayload {
            name: "template 1".to_string(),
            key: key.to_string(),
            category: "generic".to_string(),
            project_type: None,
            icon: "http://example.com/icon1.ico".to_string(),
            question: "question 1".to_string(),
            info: "info 1".to_string(),
            aliases: vec![serde_json::json!("key-1")],
            disabled: false,
            hidden: true,
            scope: None,
            phases: None,
            form: Some(ConfigReference {
                key: "test".to_string(),
                version: Some(1),
            }),
            price_config: None,
            plan_config: None,
        }
    }

    #[test]
    fn template_round_trips_json_columns() {
        let db = Database::in_memory().expect("db");
        let created = db
            .transaction(|conn| insert_project_template(conn, &template_payload("key 1"), 40))
            .expect("insert");

        let loaded = db
            .read(|conn| find_project_template(conn, created.id))
            .expect("read")
            .expect("template exists");
        assert_eq!(loaded.form, created.form);
        assert!(loaded.scope.is_none());
        assert!(loaded.hidden);
        assert_eq!(loaded.aliases, vec![serde_json::json!("key-1")]);
    }

    #[test]
    fn deleted_template_frees_its_key() {
        let db = Database::in_memory().expect("db");
        let first = db
            .transaction(|conn| insert_project_template(conn, &template_payload("dup"), 1))
            .expect("insert");
        db.transaction(|conn| soft_delete_project_template(conn, first.id, 2))
            .expect("delete");

        assert!(db
            .read(|conn| find_active_template_by_key(conn, "dup"))
            .expect("read")
            .is_none());
        db.transaction(|conn| insert_project_template(conn, &template_payload("dup"), 1))
            .expect("key reusable after soft delete");
    }
}
