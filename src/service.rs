use crate::db::{self, Database};
use crate::errors::{AppError, AppResult};
use crate::events::{DomainEvent, EventPublisher, PROJECT_PHASE_ADDED, ROUTE_WORK};
use crate::models::{
    ConfigKind, ConfigPayload, ConfigReference, CreatePermissionPayload, CreateProjectTemplatePayload,
    CreateWorkPayload, ProjectPhase, ProjectTemplate, UpdatePermissionPayload, VersionedConfig,
    WorkManagementPermission,
};
use crate::policy::{AuthUser, PolicyEngine};
use chrono::Utc;
use rusqlite::Connection;
use std::sync::Arc;

/// Per-request facts every operation needs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user: AuthUser,
}

#[derive(Clone)]
pub struct MetadataService {
    db: Arc<Database>,
    policy: PolicyEngine,
    events: Arc<EventPublisher>,
}

impl MetadataService {
    pub fn new(db: Arc<Database>, policy: PolicyEngine, events: Arc<EventPublisher>) -> Self {
        Self { db, policy, events }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn authorize(&self, policy: &str, ctx: &RequestContext) -> AppResult<()> {
        self.policy.authorize(policy, &ctx.user)
    }

    pub fn create_config_version(
        &self,
        ctx: &RequestContext,
        kind: ConfigKind,
        key: &str,
        payload: ConfigPayload,
    ) -> AppResult<VersionedConfig> {
        let user_id = ctx.user.user_id;
        self.db.transaction(|conn| {
            let version = db::latest_version(conn, kind, key)?.map_or(1, |latest| latest + 1);
            db::insert_config(conn, kind, key, version, 1, &payload.config, user_id)
        })
    }

    /// Appends a revision to an existing `(key, version)`. Earlier revisions
    /// are never touched.
    pub fn create_config_revision(
        &self,
        ctx: &RequestContext,
        kind: ConfigKind,
        key: &str,
        version: i64,
        payload: ConfigPayload,
    ) -> AppResult<VersionedConfig> {
        let user_id = ctx.user.user_id;
        self.db.transaction(|conn| {
            let Some(base) = db::find_latest_config(conn, kind, key, version)? else {
                return Err(AppError::NotFound(format!(
                    "{} not exists for key {} version {}",
                    kind.label(),
                    key,
                    version
                )));
            };
            let revision = base.revision + 1;
            tracing::debug!(kind = kind.as_str(), key = %key, version = base.version, revision, "creating config revision");
            db::insert_config(conn, kind, key, base.version, revision, &payload.config, user_id)
        })
    }

    pub fn list_config_revisions(&self, kind: ConfigKind, key: &str, version: i64) -> AppResult<Vec<VersionedConfig>> {
        self.db.read(|conn| db::list_config_revisions(conn, kind, key, version))
    }

    pub fn get_config_revision(
        &self,
        kind: ConfigKind,
        key: &str,
        version: i64,
        revision: i64,
    ) -> AppResult<VersionedConfig> {
        self.db
            .read(|conn| db::find_config_revision(conn, kind, key, version, revision))?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "{} not found for key {} version {} revision {}",
                    kind.label(),
                    key,
                    version,
                    revision
                ))
            })
    }

    pub fn delete_config_revision(
        &self,
        ctx: &RequestContext,
        kind: ConfigKind,
        key: &str,
        version: i64,
        revision: i64,
    ) -> AppResult<()> {
        let user_id = ctx.user.user_id;
        let deleted = self
            .db
            .transaction(|conn| db::soft_delete_config_revision(conn, kind, key, version, revision, user_id))?;
        if !deleted {
            return Err(AppError::NotFound(format!(
                "{} not found for key {} version {} revision {}",
                kind.label(),
                key,
                version,
                revision
            )));
        }
        Ok(())
    }

    pub fn create_project_template(
        &self,
        ctx: &RequestContext,
        payload: CreateProjectTemplatePayload,
    ) -> AppResult<ProjectTemplate> {
        match (&payload.scope, &payload.form) {
            (Some(_), Some(_)) => {
                return Err(AppError::Validation(
                    "Only one of scope or form may be defined".to_string(),
                ))
            }
            (None, None) => {
                return Err(AppError::Validation("One of scope or form must be defined".to_string()))
            }
            _ => {}
        }

        let user_id = ctx.user.user_id;
        self.db.transaction(|conn| {
            ensure_project_type(conn, &payload.category)?;
            if let Some(project_type) = &payload.project_type {
                ensure_project_type(conn, project_type)?;
            }
            if let Some(form) = &payload.form {
                ensure_config_reference(conn, ConfigKind::Form, form)?;
            }
            if let Some(price_config) = &payload.price_config {
                ensure_config_reference(conn, ConfigKind::PriceConfig, price_config)?;
            }
            if let Some(plan_config) = &payload.plan_config {
                ensure_config_reference(conn, ConfigKind::PlanConfig, plan_config)?;
            }
            if db::find_active_template_by_key(conn, &payload.key)?.is_some() {
                return Err(AppError::Validation(format!(
                    "Project template with key {} already exists",
                    payload.key
                )));
            }
            db::insert_project_template(conn, &payload, user_id)
        })
    }

    pub fn get_project_template(&self, template_id: i64) -> AppResult<ProjectTemplate> {
        self.db
            .read(|conn| db::find_project_template(conn, template_id))?
            .ok_or_else(|| AppError::NotFound(format!("Project template not found for id {}", template_id)))
    }

    pub fn delete_project_template(&self, ctx: &RequestContext, template_id: i64) -> AppResult<()> {
        let user_id = ctx.user.user_id;
        let deleted = self
            .db
            .transaction(|conn| db::soft_delete_project_template(conn, template_id, user_id))?;
        if !deleted {
            return Err(AppError::NotFound(format!("Project template not found for id {}", template_id)));
        }
        Ok(())
    }

    pub fn create_work_management_permission(
        &self,
        ctx: &RequestContext,
        payload: CreatePermissionPayload,
    ) -> AppResult<WorkManagementPermission> {
        let user_id = ctx.user.user_id;
        self.db.transaction(|conn| {
            ensure_project_template(conn, payload.project_template_id)?;
            ensure_pair_available(conn, &payload.policy, payload.project_template_id, None)?;
            db::insert_permission(conn, &payload, user_id)
        })
    }

    /// Merges the supplied fields onto the stored permission. Creation audit
    /// fields always keep their stored values.
    pub fn update_work_management_permission(
        &self,
        ctx: &RequestContext,
        permission_id: i64,
        payload: UpdatePermissionPayload,
    ) -> AppResult<WorkManagementPermission> {
        let user_id = ctx.user.user_id;
        self.db.transaction(|conn| {
            let Some(existing) = db::find_permission(conn, permission_id)? else {
                return Err(AppError::NotFound(format!(
                    "Work Management Permission not found for id {}",
                    permission_id
                )));
            };

            let mut merged = existing.clone();
            if let Some(policy) = payload.policy {
                merged.policy = policy;
            }
            if let Some(permission) = payload.permission {
                merged.permission = permission;
            }
            if let Some(project_template_id) = payload.project_template_id {
                merged.project_template_id = project_template_id;
            }

            if merged.project_template_id != existing.project_template_id {
                ensure_project_template(conn, merged.project_template_id)?;
            }
            if merged.policy != existing.policy || merged.project_template_id != existing.project_template_id {
                ensure_pair_available(conn, &merged.policy, merged.project_template_id, Some(existing.id))?;
            }

            merged.audit.updated_at = Utc::now();
            merged.audit.updated_by = user_id;
            db::update_permission(conn, &merged)?;
            Ok(merged)
        })
    }

    pub fn get_work_management_permission(&self, permission_id: i64) -> AppResult<WorkManagementPermission> {
        self.db
            .read(|conn| db::find_permission(conn, permission_id))?
            .ok_or_else(|| {
                AppError::NotFound(format!("Work Management Permission not found for id {}", permission_id))
            })
    }

    pub fn delete_work_management_permission(&self, ctx: &RequestContext, permission_id: i64) -> AppResult<()> {
        let user_id = ctx.user.user_id;
        let deleted = self
            .db
            .transaction(|conn| db::soft_delete_permission(conn, permission_id, user_id))?;
        if !deleted {
            return Err(AppError::NotFound(format!(
                "Work Management Permission not found for id {}",
                permission_id
            )));
        }
        Ok(())
    }

    /// Adds a phase to a work stream. Phase insert, stream link, sibling
    /// reorder and product creation share one transaction; the phase-added
    /// event goes out only after it committed.
    pub fn create_work(
        &self,
        ctx: &RequestContext,
        project_id: i64,
        work_stream_id: i64,
        payload: CreateWorkPayload,
    ) -> AppResult<ProjectPhase> {
        let user_id = ctx.user.user_id;
        tracing::debug!(request_id = %ctx.request_id, project_id, work_stream_id, "create work: starting transaction");

        let phase = self.db.transaction(|conn| {
            let Some(work_stream) = db::find_work_stream(conn, work_stream_id, project_id)? else {
                return Err(AppError::NotFound(format!(
                    "active work stream not found for project id {} and work stream id {}",
                    project_id, work_stream_id
                )));
            };

            if let (Some(start), Some(end)) = (payload.start_date, payload.end_date) {
                if start > end {
                    return Err(AppError::Validation("startDate must not be after endDate.".to_string()));
                }
            }

            let mut phase = db::insert_phase(conn, project_id, &payload, user_id)?;
            db::link_phase_to_work_stream(conn, work_stream.id, phase.id)?;

            if let Some(order) = phase.order {
                let shifted = db::shift_sibling_orders(conn, project_id, phase.id, order)?;
                tracing::debug!(phase_id = phase.id, order, shifted, "re-ordered sibling phases");
            }

            if let Some(product_template_id) = payload.product_template_id {
                let Some(template) = db::find_product_template(conn, product_template_id)? else {
                    return Err(AppError::Validation(format!(
                        "Product template does not exist with id = {}",
                        product_template_id
                    )));
                };
                let product = db::insert_phase_product(conn, &phase, &template, user_id)?;
                phase.products = Some(vec![product]);
            }

            Ok(phase)
        })?;

        let entity = serde_json::to_value(&phase)?;
        tracing::debug!(request_id = %ctx.request_id, phase_id = phase.id, "sending phase added event");
        self.events
            .publish(&DomainEvent::new(PROJECT_PHASE_ADDED, ROUTE_WORK, &ctx.request_id, entity))?;

        Ok(phase)
    }

    pub fn get_work(&self, project_id: i64, work_stream_id: i64, work_id: i64) -> AppResult<ProjectPhase> {
        self.db.read(|conn| {
            let Some(mut phase) = db::find_phase_in_work_stream(conn, project_id, work_stream_id, work_id)? else {
                return Err(AppError::NotFound(format!(
                    "work not found for project id {}, work stream id {} and work id {}",
                    project_id, work_stream_id, work_id
                )));
            };
            phase.products = Some(db::list_phase_products(conn, phase.id)?);
            Ok(phase)
        })
    }
}

fn ensure_project_type(conn: &Connection, key: &str) -> AppResult<()> {
    if db::find_project_type(conn, key)?.is_none() {
        return Err(AppError::Validation(format!("Project type not found for key {}", key)));
    }
    Ok(())
}

fn ensure_config_reference(conn: &Connection, kind: ConfigKind, reference: &ConfigReference) -> AppResult<()> {
    let version = match reference.version {
        Some(version) => Some(version),
        None => db::latest_version(conn, kind, &reference.key)?,
    };
    let exists = match version {
        Some(version) => db::find_latest_config(conn, kind, &reference.key, version)?.is_some(),
        None => false,
    };
    if !exists {
        return Err(AppError::Validation(format!(
            "{} not found for key {}{}",
            kind.label(),
            reference.key,
            reference
                .version
                .map(|version| format!(" version {}", version))
                .unwrap_or_default()
        )));
    }
    Ok(())
}

fn ensure_project_template(conn: &Connection, template_id: i64) -> AppResult<()> {
    if db::find_project_template(conn, template_id)?.is_none() {
        return Err(AppError::Validation(format!("Project template not found for id {}", template_id)));
    }
    Ok(())
}

fn ensure_pair_available(
    conn: &Connection,
    policy: &str,
    project_template_id: i64,
    exclude_id: Option<i64>,
) -> AppResult<()> {
    if db::find_active_permission_by_pair(conn, policy, project_template_id, exclude_id)?.is_some() {
        return Err(AppError::Validation(format!(
            "Work Management Permission already exists for policy {} and project template id {}",
            policy, project_template_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::events::InProcessSink;
    use crate::models::{NewProductTemplate, NewProjectType, NewWorkStream};
    use serde_json::json;

    const ADMIN: i64 = 40051333;

    fn setup() -> (MetadataService, InProcessSink) {
        let db = Arc::new(Database::in_memory().expect("db"));
        let in_process = InProcessSink::new(16);
        let publisher = EventPublisher::new(&EventsConfig::default()).with_sink(Arc::new(in_process.clone()));
        (MetadataService::new(db, PolicyEngine::new(), Arc::new(publisher)), in_process)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "req-1".to_string(),
            user: AuthUser {
                user_id: ADMIN,
                roles: vec!["administrator".to_string()],
            },
        }
    }

    fn config(value: serde_json::Value) -> ConfigPayload {
        ConfigPayload { config: value }
    }

    fn seed_project_type(service: &MetadataService, key: &str) {
        service
            .db()
            .transaction(|conn| {
                db::insert_project_type(
                    conn,
                    &NewProjectType {
                        key: key.to_string(),
                        display_name: key.to_string(),
                        ..NewProjectType::default()
                    },
                    1,
                )
            })
            .expect("seed project type");
    }

    fn template_payload(key: &str) -> CreateProjectTemplatePayload {
        CreateProjectTemplatePayload {
            name: "template 1".to_string(),
            key: key.to_string(),
            category: "generic".to_string(),
            project_type: None,
            icon: "http://example.com/icon1.ico".to_string(),
            question: "question 1".to_string(),
            info: "info 1".to_string(),
            aliases: vec![json!("key-1"), json!("key_1")],
            disabled: true,
            hidden: true,
            scope: Some(json!({ "scope1": { "subScope1A": 1 } })),
            phases: Some(json!({ "phase1": { "name": "phase 1" } })),
            form: None,
            price_config: None,
            plan_config: None,
        }
    }

    fn seed_template(service: &MetadataService, key: &str) -> ProjectTemplate {
        service
            .db()
            .transaction(|conn| db::insert_project_template(conn, &template_payload(key), 1))
            .expect("seed template")
    }

    fn seed_permission(service: &MetadataService, policy: &str, template_id: i64) -> WorkManagementPermission {
        service
            .db()
            .transaction(|conn| {
                db::insert_permission(
                    conn,
                    &CreatePermissionPayload {
                        policy: policy.to_string(),
                        permission: json!({ "allowRule": { "projectRoles": ["customer", "copilot"] } }),
                        project_template_id: template_id,
                    },
                    1,
                )
            })
            .expect("seed permission")
    }

    fn seed_work_stream(service: &MetadataService, project_id: i64) -> i64 {
        service
            .db()
            .transaction(|conn| {
                db::insert_work_stream(
                    conn,
                    &NewWorkStream {
                        project_id,
                        name: "stream".to_string(),
                        stream_type: "generic".to_string(),
                        status: "active".to_string(),
                    },
                    1,
                )
            })
            .expect("seed work stream")
            .id
    }

    fn work(name: &str, order: Option<i64>) -> CreateWorkPayload {
        CreateWorkPayload {
            name: name.to_string(),
            status: "open".to_string(),
            order,
            ..CreateWorkPayload::default()
        }
    }

    fn phase_count(service: &MetadataService) -> i64 {
        service
            .db()
            .read(|conn| Ok(conn.query_row("SELECT COUNT(1) FROM project_phases", [], |row| row.get(0))?))
            .expect("count phases")
    }

    fn phase_order(service: &MetadataService, phase_id: i64) -> Option<i64> {
        service
            .db()
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT \"order\" FROM project_phases WHERE id = ?1",
                    [phase_id],
                    |row| row.get(0),
                )?)
            })
            .expect("phase order")
    }

    #[test]
    fn revision_increments_previous_and_keeps_version() {
        let (service, _) = setup();
        service
            .db()
            .transaction(|conn| db::insert_config(conn, ConfigKind::PriceConfig, "test", 1, 1, &json!({}), 1))
            .expect("seed base");

        let created = service
            .create_config_revision(&ctx(), ConfigKind::PriceConfig, "test", 1, config(json!({"a": 1})))
            .expect("create revision");
        assert_eq!(created.key, "test");
        assert_eq!(created.version, 1);
        assert_eq!(created.revision, 2);
        assert_eq!(created.config, json!({"a": 1}));
        assert_eq!(created.audit.created_by, ADMIN);
        assert_eq!(created.audit.updated_by, ADMIN);

        let listed = service
            .list_config_revisions(ConfigKind::PriceConfig, "test", 1)
            .expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].config, json!({}));
    }

    #[test]
    fn revision_without_base_is_not_found() {
        let (service, _) = setup();
        service
            .db()
            .transaction(|conn| db::insert_config(conn, ConfigKind::PlanConfig, "test", 1, 1, &json!({}), 1))
            .expect("seed other version");

        let missing_version = service.create_config_revision(&ctx(), ConfigKind::PlanConfig, "test", 2, config(json!({})));
        assert!(matches!(missing_version, Err(AppError::NotFound(_))));
        let other_kind = service.create_config_revision(&ctx(), ConfigKind::Form, "test", 1, config(json!({})));
        assert!(matches!(other_kind, Err(AppError::NotFound(_))));
    }

    #[test]
    fn versions_start_at_one_and_increment() {
        let (service, _) = setup();
        let first = service
            .create_config_version(&ctx(), ConfigKind::Form, "intake", config(json!({"v": 1})))
            .expect("first version");
        let second = service
            .create_config_version(&ctx(), ConfigKind::Form, "intake", config(json!({"v": 2})))
            .expect("second version");
        assert_eq!((first.version, first.revision), (1, 1));
        assert_eq!((second.version, second.revision), (2, 1));
    }

    #[test]
    fn revision_after_deleting_the_latest_continues_from_active_base() {
        let (service, _) = setup();
        service
            .create_config_version(&ctx(), ConfigKind::PriceConfig, "test", config(json!({})))
            .expect("version");
        service
            .create_config_revision(&ctx(), ConfigKind::PriceConfig, "test", 1, config(json!({"r": 2})))
            .expect("revision 2");
        service
            .delete_config_revision(&ctx(), ConfigKind::PriceConfig, "test", 1, 2)
            .expect("delete");

        assert!(matches!(
            service.get_config_revision(ConfigKind::PriceConfig, "test", 1, 2),
            Err(AppError::NotFound(_))
        ));
        let next = service
            .create_config_revision(&ctx(), ConfigKind::PriceConfig, "test", 1, config(json!({"r": 3})))
            .expect("next revision");
        assert_eq!(next.revision, 2);

        let active: Vec<i64> = service
            .list_config_revisions(ConfigKind::PriceConfig, "test", 1)
            .expect("list")
            .into_iter()
            .map(|revision| revision.revision)
            .collect();
        assert_eq!(active, vec![2, 1]);
        assert_eq!(
            service
                .get_config_revision(ConfigKind::PriceConfig, "test", 1, 2)
                .expect("active revision 2")
                .config,
            json!({"r": 3})
        );
        assert!(matches!(
            service.delete_config_revision(&ctx(), ConfigKind::PriceConfig, "test", 1, 3),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn unversioned_reference_resolves_to_latest_active_version() {
        let (service, _) = setup();
        seed_project_type(&service, "generic");
        service
            .create_config_version(&ctx(), ConfigKind::Form, "intake", config(json!({"v": 1})))
            .expect("version 1");
        service
            .create_config_version(&ctx(), ConfigKind::Form, "intake", config(json!({"v": 2})))
            .expect("version 2");
        service
            .delete_config_revision(&ctx(), ConfigKind::Form, "intake", 2, 1)
            .expect("delete version 2");

        let mut payload = template_payload("form ref");
        payload.scope = None;
        payload.form = Some(ConfigReference {
            key: "intake".to_string(),
            version: None,
        });
        assert!(service.create_project_template(&ctx(), payload).is_ok());
    }

    #[test]
    fn template_requires_exactly_one_of_scope_or_form() {
        let (service, _) = setup();
        seed_project_type(&service, "generic");
        service
            .create_config_version(&ctx(), ConfigKind::Form, "test", config(json!({"test": "test1"})))
            .expect("seed form");

        let created = service
            .create_project_template(&ctx(), template_payload("scope only"))
            .expect("scope only");
        assert!(created.scope.is_some());
        assert!(created.form.is_none());
        assert_eq!(created.audit.created_by, ADMIN);

        let mut form_only = template_payload("form only");
        form_only.scope = None;
        form_only.form = Some(ConfigReference {
            key: "test".to_string(),
            version: Some(1),
        });
        assert!(service.create_project_template(&ctx(), form_only).is_ok());

        let mut both = template_payload("both");
        both.form = Some(ConfigReference {
            key: "test".to_string(),
            version: None,
        });
        assert!(matches!(
            service.create_project_template(&ctx(), both),
            Err(AppError::Validation(_))
        ));

        let mut neither = template_payload("neither");
        neither.scope = None;
        assert!(matches!(
            service.create_project_template(&ctx(), neither),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn template_references_must_exist() {
        let (service, _) = setup();
        seed_project_type(&service, "generic");

        let mut unknown_category = template_payload("a");
        unknown_category.category = "not_exist".to_string();
        assert!(matches!(
            service.create_project_template(&ctx(), unknown_category),
            Err(AppError::Validation(_))
        ));

        let mut unknown_type = template_payload("b");
        unknown_type.project_type = Some("not_exist".to_string());
        assert!(matches!(
            service.create_project_template(&ctx(), unknown_type),
            Err(AppError::Validation(_))
        ));

        let mut missing_price_config = template_payload("c");
        missing_price_config.price_config = Some(ConfigReference {
            key: "test".to_string(),
            version: None,
        });
        assert!(matches!(
            service.create_project_template(&ctx(), missing_price_config),
            Err(AppError::Validation(_))
        ));

        service
            .create_project_template(&ctx(), template_payload("dup"))
            .expect("first");
        assert!(matches!(
            service.create_project_template(&ctx(), template_payload("dup")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn permission_update_merges_only_supplied_fields() {
        let (service, _) = setup();
        let template = seed_template(&service, "key 2");
        let original = seed_permission(&service, "work.create", template.id);

        let updated = service
            .update_work_management_permission(
                &ctx(),
                original.id,
                UpdatePermissionPayload {
                    policy: Some("work.edit".to_string()),
                    ..UpdatePermissionPayload::default()
                },
            )
            .expect("update");
        assert_eq!(updated.policy, "work.edit");
        assert_eq!(updated.permission, original.permission);
        assert_eq!(updated.project_template_id, template.id);
        assert_eq!(updated.audit.created_by, original.audit.created_by);
        assert_eq!(updated.audit.created_at, original.audit.created_at);
        assert_eq!(updated.audit.updated_by, ADMIN);

        let stored = service
            .get_work_management_permission(original.id)
            .expect("stored");
        assert_eq!(stored.policy, "work.edit");
        assert_eq!(stored.audit.created_by, original.audit.created_by);
        assert_eq!(stored.audit.updated_by, ADMIN);
    }

    #[test]
    fn permission_pair_must_be_unique_among_active_rows() {
        let (service, _) = setup();
        let template = seed_template(&service, "key 2");
        let target = seed_permission(&service, "work.create", template.id);
        seed_permission(&service, "work.edit", template.id);

        let conflict = service.update_work_management_permission(
            &ctx(),
            target.id,
            UpdatePermissionPayload {
                policy: Some("work.edit".to_string()),
                ..UpdatePermissionPayload::default()
            },
        );
        assert!(matches!(conflict, Err(AppError::Validation(_))));

        let deleted = seed_permission(&service, "work.delete", template.id);
        service
            .delete_work_management_permission(&ctx(), deleted.id)
            .expect("soft delete");
        let reused = service
            .update_work_management_permission(
                &ctx(),
                target.id,
                UpdatePermissionPayload {
                    policy: Some("work.delete".to_string()),
                    ..UpdatePermissionPayload::default()
                },
            )
            .expect("pair of a deleted row is free");
        assert_eq!(reused.policy, "work.delete");
    }

    #[test]
    fn permission_update_unchanged_pair_skips_uniqueness() {
        let (service, _) = setup();
        let template = seed_template(&service, "key 2");
        let target = seed_permission(&service, "work.create", template.id);

        let updated = service
            .update_work_management_permission(
                &ctx(),
                target.id,
                UpdatePermissionPayload {
                    policy: Some("work.create".to_string()),
                    permission: Some(json!({ "denyRule": { "projectRoles": ["copilot"] } })),
                    project_template_id: Some(template.id),
                },
            )
            .expect("same pair");
        assert_eq!(updated.permission, json!({ "denyRule": { "projectRoles": ["copilot"] } }));
    }

    #[test]
    fn permission_update_missing_or_deleted_is_not_found() {
        let (service, _) = setup();
        let template = seed_template(&service, "key 2");
        let permission = seed_permission(&service, "work.create", template.id);
        service
            .delete_work_management_permission(&ctx(), permission.id)
            .expect("delete");

        for permission_id in [1234, permission.id] {
            let result = service.update_work_management_permission(
                &ctx(),
                permission_id,
                UpdatePermissionPayload {
                    policy: Some("work.edit".to_string()),
                    ..UpdatePermissionPayload::default()
                },
            );
            assert!(matches!(result, Err(AppError::NotFound(_))));
        }
    }

    #[test]
    fn work_insert_shifts_siblings_at_or_after_order() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        let first = service
            .create_work(&ctx(), 10, stream_id, work("first", Some(1)))
            .expect("first");
        let second = service
            .create_work(&ctx(), 10, stream_id, work("second", Some(2)))
            .expect("second");
        let inserted = service
            .create_work(&ctx(), 10, stream_id, work("inserted", Some(1)))
            .expect("inserted");

        assert_eq!(phase_order(&service, inserted.id), Some(1));
        assert_eq!(phase_order(&service, first.id), Some(2));
        assert_eq!(phase_order(&service, second.id), Some(3));

        let unordered = service
            .create_work(&ctx(), 10, stream_id, work("unordered", None))
            .expect("unordered");
        assert_eq!(phase_order(&service, unordered.id), None);
        assert_eq!(phase_order(&service, second.id), Some(3));
    }

    #[test]
    fn work_with_inverted_dates_is_rejected_before_any_write() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        let mut payload = work("late", Some(1));
        payload.start_date = Some("2024-02-01T00:00:00Z".parse().expect("date"));
        payload.end_date = Some("2024-01-01T00:00:00Z".parse().expect("date"));

        let result = service.create_work(&ctx(), 10, stream_id, payload);
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(phase_count(&service), 0);
    }

    #[test]
    fn work_may_start_and_end_at_the_same_instant() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        let mut payload = work("same day", None);
        payload.start_date = Some("2024-01-01T00:00:00Z".parse().expect("date"));
        payload.end_date = payload.start_date;

        let phase = service
            .create_work(&ctx(), 10, stream_id, payload)
            .expect("equal dates accepted");
        assert_eq!(phase.start_date, phase.end_date);
        assert_eq!(phase_count(&service), 1);
    }

    #[test]
    fn work_requires_active_work_stream_of_the_project() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        assert!(matches!(
            service.create_work(&ctx(), 11, stream_id, work("w", None)),
            Err(AppError::NotFound(_))
        ));

        service
            .db()
            .transaction(|conn| {
                conn.execute(
                    "UPDATE work_streams SET deleted_at = ?1, deleted_by = 1 WHERE id = ?2",
                    rusqlite::params![Utc::now().to_rfc3339(), stream_id],
                )?;
                Ok(())
            })
            .expect("delete stream");
        assert!(matches!(
            service.create_work(&ctx(), 10, stream_id, work("w", None)),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(phase_count(&service), 0);
    }

    #[test]
    fn missing_product_template_rolls_back_phase_and_reorder() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        let existing = service
            .create_work(&ctx(), 10, stream_id, work("existing", Some(1)))
            .expect("existing");

        let mut payload = work("with product", Some(1));
        payload.product_template_id = Some(999);
        let result = service.create_work(&ctx(), 10, stream_id, payload);
        assert!(matches!(result, Err(AppError::Validation(_))));

        assert_eq!(phase_count(&service), 1);
        assert_eq!(phase_order(&service, existing.id), Some(1));
        let links: i64 = service
            .db()
            .read(|conn| Ok(conn.query_row("SELECT COUNT(1) FROM phase_work_streams", [], |row| row.get(0))?))
            .expect("links");
        assert_eq!(links, 1);
    }

    #[test]
    fn product_template_cascades_into_one_phase_product() {
        let (service, _) = setup();
        let stream_id = seed_work_stream(&service, 10);
        let template = service
            .db()
            .transaction(|conn| {
                db::insert_product_template(
                    conn,
                    &NewProductTemplate {
                        name: "Website design".to_string(),
                        product_key: "website".to_string(),
                        category: "design".to_string(),
                        template: json!({}),
                    },
                    1,
                )
            })
            .expect("seed product template");

        let mut payload = work("with product", None);
        payload.product_template_id = Some(template.id);
        let phase = service
            .create_work(&ctx(), 10, stream_id, payload)
            .expect("create work");

        let products = phase.products.clone().expect("products attached");
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].name, "Website design");
        assert_eq!(products[0].product_type, "website");
        assert_eq!(products[0].phase_id, phase.id);
        assert_eq!(products[0].project_id, 10);
        assert_eq!(products[0].template_id, template.id);

        let loaded = service.get_work(10, stream_id, phase.id).expect("get work");
        assert_eq!(loaded.products, Some(products));
    }

    #[test]
    fn committed_work_emits_created_event_with_request_id() {
        let (service, in_process) = setup();
        let mut receiver = in_process.subscribe();
        let stream_id = seed_work_stream(&service, 10);
        let phase = service
            .create_work(&ctx(), 10, stream_id, work("W1", Some(2)))
            .expect("create work");

        let event = receiver.try_recv().expect("event emitted");
        assert_eq!(event.name, PROJECT_PHASE_ADDED);
        assert_eq!(event.correlation_id, "req-1");
        assert_eq!(event.payload["created"]["id"], json!(phase.id));
        assert!(event.payload["created"].get("deletedAt").is_none());
    }

    #[test]
    fn rejected_work_emits_nothing() {
        let (service, in_process) = setup();
        let mut receiver = in_process.subscribe();
        let result = service.create_work(&ctx(), 10, 77, work("W1", None));
        assert!(result.is_err());
        assert!(receiver.try_recv().is_err());
    }
}
