use super::{parse_audit, parse_json, parse_optional_json, parse_optional_time, ACTIVE};
use crate::errors::AppResult;
use crate::models::{
    Audit, CreateWorkPayload, NewProductTemplate, NewWorkStream, PhaseProduct, ProductTemplate, ProjectPhase,
    WorkStream,
};
use rusqlite::{params, Connection, OptionalExtension};

const PHASE_COLUMNS: &str = "p.id, p.project_id, p.name, p.description, p.requirements, p.status,
     p.start_date, p.end_date, p.duration, p.budget, p.spent_budget, p.progress, p.details_json, p.\"order\",
     p.created_at, p.updated_at, p.created_by, p.updated_by, p.deleted_at, p.deleted_by";

pub fn insert_work_stream(conn: &Connection, stream: &NewWorkStream, user_id: i64) -> AppResult<WorkStream> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO work_streams (project_id, name, type, status, created_at, updated_at, created_by, updated_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            stream.project_id,
            stream.name,
            stream.stream_type,
            stream.status,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(WorkStream {
        id: conn.last_insert_rowid(),
        project_id: stream.project_id,
        name: stream.name.clone(),
        stream_type: stream.stream_type.clone(),
        status: stream.status.clone(),
        audit,
    })
}

pub fn find_work_stream(conn: &Connection, work_stream_id: i64, project_id: i64) -> AppResult<Option<WorkStream>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT id, project_id, name, type, status,
                        created_at, updated_at, created_by, updated_by, deleted_at, deleted_by
                 FROM work_streams WHERE id = ?1 AND project_id = ?2 AND {ACTIVE}"
            ),
            params![work_stream_id, project_id],
            |row| {
                Ok(WorkStream {
                    id: row.get("id")?,
                    project_id: row.get("project_id")?,
                    name: row.get("name")?,
                    stream_type: row.get("type")?,
                    status: row.get("status")?,
                    audit: parse_audit(row)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}

pub fn insert_phase(
    conn: &Connection,
    project_id: i64,
    payload: &CreateWorkPayload,
    user_id: i64,
) -> AppResult<ProjectPhase> {
    let audit = Audit::created_now(user_id);
    let details_json = payload.details.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO project_phases (
           project_id, name, description, requirements, status, start_date, end_date,
           duration, budget, spent_budget, progress, details_json, \"order\",
           created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            project_id,
            payload.name,
            payload.description,
            payload.requirements,
            payload.status,
            payload.start_date.map(|date| date.to_rfc3339()),
            payload.end_date.map(|date| date.to_rfc3339()),
            payload.duration,
            payload.budget,
            payload.spent_budget,
            payload.progress,
            details_json,
            payload.order,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(ProjectPhase {
        id: conn.last_insert_rowid(),
        project_id,
        name: payload.name.clone(),
        description: payload.description.clone(),
        requirements: payload.requirements.clone(),
        status: payload.status.clone(),
        start_date: payload.start_date,
        end_date: payload.end_date,
        duration: payload.duration,
        budget: payload.budget,
        spent_budget: payload.spent_budget,
        progress: payload.progress,
        details: payload.details.clone(),
        order: payload.order,
        products: None,
        audit,
    })
}

pub fn link_phase_to_work_stream(conn: &Connection, work_stream_id: i64, phase_id: i64) -> AppResult<()> {
    conn.execute(
        "INSERT INTO phase_work_streams (work_stream_id, phase_id) VALUES (?1, ?2)",
        params![work_stream_id, phase_id],
    )?;
    Ok(())
}

/// Bumps `order` by one for every active phase of the project at or after
/// `order`, except `phase_id`. Returns the number of shifted siblings.
pub fn shift_sibling_orders(conn: &Connection, project_id: i64, phase_id: i64, order: i64) -> AppResult<usize> {
    let shifted = conn.execute(
        &format!(
            "UPDATE project_phases SET \"order\" = \"order\" + 1
             WHERE project_id = ?1 AND id != ?2 AND \"order\" >= ?3 AND {ACTIVE}"
        ),
        params![project_id, phase_id, order],
    )?;
    Ok(shifted)
}

/// Active phase `phase_id` linked to the given work stream of the project.
pub fn find_phase_in_work_stream(
    conn: &Connection,
    project_id: i64,
    work_stream_id: i64,
    phase_id: i64,
) -> AppResult<Option<ProjectPhase>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {PHASE_COLUMNS}
                 FROM project_phases p
                 JOIN phase_work_streams l ON l.phase_id = p.id
                 WHERE p.id = ?1 AND p.project_id = ?2 AND l.work_stream_id = ?3 AND p.{ACTIVE}"
            ),
            params![phase_id, project_id, work_stream_id],
            parse_phase_row,
        )
        .optional()?;
    Ok(found)
}

pub fn insert_product_template(
    conn: &Connection,
    template: &NewProductTemplate,
    user_id: i64,
) -> AppResult<ProductTemplate> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO product_templates (
           name, product_key, category, template_json, created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            template.name,
            template.product_key,
            template.category,
            serde_json::to_string(&template.template)?,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(ProductTemplate {
        id: conn.last_insert_rowid(),
        name: template.name.clone(),
        product_key: template.product_key.clone(),
        category: template.category.clone(),
        template: template.template.clone(),
        audit,
    })
}

pub fn find_product_template(conn: &Connection, template_id: i64) -> AppResult<Option<ProductTemplate>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT id, name, product_key, category, template_json,
                        created_at, updated_at, created_by, updated_by, deleted_at, deleted_by
                 FROM product_templates WHERE id = ?1 AND {ACTIVE}"
            ),
            [template_id],
            |row| {
                Ok(ProductTemplate {
                    id: row.get("id")?,
                    name: row.get("name")?,
                    product_key: row.get("product_key")?,
                    category: row.get("category")?,
                    template: parse_json(&row.get::<_, String>("template_json")?)?,
                    audit: parse_audit(row)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}

/// Creates the product of a phase from `template`, copying its name and key.
pub fn insert_phase_product(
    conn: &Connection,
    phase: &ProjectPhase,
    template: &ProductTemplate,
    user_id: i64,
) -> AppResult<PhaseProduct> {
    let audit = Audit::created_now(user_id);
    conn.execute(
        "INSERT INTO phase_products (
           phase_id, project_id, template_id, name, type, created_at, updated_at, created_by, updated_by
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            phase.id,
            phase.project_id,
            template.id,
            template.name,
            template.product_key,
            audit.created_at.to_rfc3339(),
            audit.updated_at.to_rfc3339(),
            audit.created_by,
            audit.updated_by,
        ],
    )?;

    Ok(PhaseProduct {
        id: conn.last_insert_rowid(),
        phase_id: phase.id,
        project_id: phase.project_id,
        template_id: template.id,
        name: template.name.clone(),
        product_type: template.product_key.clone(),
        audit,
    })
}

pub fn list_phase_products(conn: &Connection, phase_id: i64) -> AppResult<Vec<PhaseProduct>> {
    let mut statement = conn.prepare(&format!(
        "SELECT id, phase_id, project_id, template_id, name, type,
                created_at, updated_at, created_by, updated_by, deleted_at, deleted_by
         FROM phase_products WHERE phase_id = ?1 AND {ACTIVE} ORDER BY id ASC"
    ))?;
    let rows = statement
        .query_map([phase_id], |row| {
            Ok(PhaseProduct {
                id: row.get("id")?,
                phase_id: row.get("phase_id")?,
                project_id: row.get("project_id")?,
                template_id: row.get("template_id")?,
                name: row.get("name")?,
                product_type: row.get("type")?,
                audit: parse_audit(row)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_phase_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectPhase> {
    Ok(ProjectPhase {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        requirements: row.get("requirements")?,
        status: row.get("status")?,
        start_date: parse_optional_time(row.get("start_date")?)?,
        end_date: parse_optional_time(row.get("end_date")?)?,
        duration: row.get("duration")?,
        budget: row.get("budget")?,
        spent_budget: row.get("spent_budget")?,
        progress: row.get("progress")?,
        details: parse_optional_json(row.get("details_json")?)?,
        order: row.get("order")?,
        products: None,
        audit: parse_audit(row)?,
    })
}
