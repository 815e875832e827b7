pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod policy;
pub mod response;
pub mod service;
pub mod validation;

use crate::config::{AppConfig, LogConfig};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::events::{EventPublisher, InProcessSink, LoggingBus, MessageBusSink};
use crate::models::{
    ConfigKind, ConfigPayload, CreatePermissionPayload, CreateProjectTemplatePayload, CreateWorkPayload,
    UpdatePermissionPayload,
};
use crate::policy::{AuthUser, PolicyEngine};
use crate::response::{request_id, ApiError, Wrapped};
use crate::service::{MetadataService, RequestContext};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use jsonschema::JSONSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const MAX_KEY_LENGTH: usize = 45;

#[derive(Clone)]
pub struct AppState {
    service: MetadataService,
}

impl AppState {
    pub fn new(service: MetadataService) -> Self {
        Self { service }
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut metadata: Router<AppState> = Router::new()
        .route("/projectTemplates", post(create_project_template))
        .route(
            "/projectTemplates/:template_id",
            get(get_project_template).delete(delete_project_template),
        )
        .route("/workManagementPermission", post(create_work_management_permission))
        .route(
            "/workManagementPermission/:permission_id",
            get(get_work_management_permission)
                .patch(update_work_management_permission)
                .delete(delete_work_management_permission),
        );
    for kind in ConfigKind::ALL {
        metadata = metadata.nest(
            &format!("/{}", kind.route_segment()),
            config_routes().layer(Extension(kind)),
        );
    }

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v4/projects/metadata", metadata)
        .route(
            "/v4/projects/:project_id/workstreams/:work_stream_id/works",
            post(create_work),
        )
        .route(
            "/v4/projects/:project_id/workstreams/:work_stream_id/works/:work_id",
            get(get_work),
        )
        .with_state(state)
}

fn config_routes() -> Router<AppState> {
    Router::new()
        .route("/:key/versions", post(create_config_version))
        .route(
            "/:key/versions/:version/revisions",
            post(create_config_revision).get(list_config_revisions),
        )
        .route(
            "/:key/versions/:version/revisions/:revision",
            get(get_config_revision).delete(delete_config_revision),
        )
}

async fn healthz() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_config_version(
    State(state): State<AppState>,
    Extension(kind): Extension<ConfigKind>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let key = path_params(&request_id, path)?;
    check_key(&request_id, &key)?;
    let payload: ConfigPayload = decode_body(&request_id, &validation::CONFIG_BODY, body)?;
    authorize(&state, &kind.policy("create"), &ctx)?;

    let service = state.service.clone();
    let created = run_blocking(&request_id, move || {
        service.create_config_version(&ctx, kind, &key, payload)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::CREATED, created)
}

async fn create_config_revision(
    State(state): State<AppState>,
    Extension(kind): Extension<ConfigKind>,
    headers: HeaderMap,
    path: Result<Path<(String, i64)>, PathRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (key, version) = path_params(&request_id, path)?;
    check_key(&request_id, &key)?;
    check_positive(&request_id, "version", version)?;
    let payload: ConfigPayload = decode_body(&request_id, &validation::CONFIG_BODY, body)?;
    authorize(&state, &kind.policy("create"), &ctx)?;

    let service = state.service.clone();
    let created = run_blocking(&request_id, move || {
        service.create_config_revision(&ctx, kind, &key, version, payload)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::CREATED, created)
}

async fn list_config_revisions(
    State(state): State<AppState>,
    Extension(kind): Extension<ConfigKind>,
    headers: HeaderMap,
    path: Result<Path<(String, i64)>, PathRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (key, version) = path_params(&request_id, path)?;
    check_key(&request_id, &key)?;
    check_positive(&request_id, "version", version)?;
    authorize(&state, &kind.policy("view"), &ctx)?;

    let service = state.service.clone();
    let revisions = run_blocking(&request_id, move || service.list_config_revisions(kind, &key, version)).await?;
    Wrapped::list(request_id, &revisions)
}

async fn get_config_revision(
    State(state): State<AppState>,
    Extension(kind): Extension<ConfigKind>,
    headers: HeaderMap,
    path: Result<Path<(String, i64, i64)>, PathRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (key, version, revision) = path_params(&request_id, path)?;
    check_key(&request_id, &key)?;
    check_positive(&request_id, "version", version)?;
    check_positive(&request_id, "revision", revision)?;
    authorize(&state, &kind.policy("view"), &ctx)?;

    let service = state.service.clone();
    let found = run_blocking(&request_id, move || {
        service.get_config_revision(kind, &key, version, revision)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::OK, found)
}

async fn delete_config_revision(
    State(state): State<AppState>,
    Extension(kind): Extension<ConfigKind>,
    headers: HeaderMap,
    path: Result<Path<(String, i64, i64)>, PathRejection>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (key, version, revision) = path_params(&request_id, path)?;
    check_key(&request_id, &key)?;
    check_positive(&request_id, "version", version)?;
    check_positive(&request_id, "revision", revision)?;
    authorize(&state, &kind.policy("delete"), &ctx)?;

    let service = state.service.clone();
    run_blocking(&request_id, move || {
        service.delete_config_revision(&ctx, kind, &key, version, revision)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn create_project_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let payload: CreateProjectTemplatePayload =
        decode_body(&request_id, &validation::PROJECT_TEMPLATE_BODY, body)?;
    authorize(&state, "projectTemplate.create", &ctx)?;

    let service = state.service.clone();
    let created = run_blocking(&request_id, move || service.create_project_template(&ctx, payload)).await?;
    Wrapped::new(request_id, StatusCode::CREATED, created)
}

async fn get_project_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let template_id = path_params(&request_id, path)?;
    check_positive(&request_id, "templateId", template_id)?;
    authorize(&state, "projectTemplate.view", &ctx)?;

    let service = state.service.clone();
    let found = run_blocking(&request_id, move || service.get_project_template(template_id)).await?;
    Wrapped::new(request_id, StatusCode::OK, found)
}

async fn delete_project_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let template_id = path_params(&request_id, path)?;
    check_positive(&request_id, "templateId", template_id)?;
    authorize(&state, "projectTemplate.delete", &ctx)?;

    let service = state.service.clone();
    run_blocking(&request_id, move || service.delete_project_template(&ctx, template_id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn create_work_management_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let payload: CreatePermissionPayload =
        decode_body(&request_id, &validation::CREATE_PERMISSION_BODY, body)?;
    authorize(&state, "workManagementPermission.create", &ctx)?;

    let service = state.service.clone();
    let created = run_blocking(&request_id, move || {
        service.create_work_management_permission(&ctx, payload)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::CREATED, created)
}

async fn get_work_management_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let permission_id = path_params(&request_id, path)?;
    check_positive(&request_id, "permissionId", permission_id)?;
    authorize(&state, "workManagementPermission.view", &ctx)?;

    let service = state.service.clone();
    let found = run_blocking(&request_id, move || {
        service.get_work_management_permission(permission_id)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::OK, found)
}

async fn update_work_management_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let permission_id = path_params(&request_id, path)?;
    check_positive(&request_id, "permissionId", permission_id)?;
    let payload: UpdatePermissionPayload =
        decode_body(&request_id, &validation::UPDATE_PERMISSION_BODY, body)?;
    authorize(&state, "workManagementPermission.edit", &ctx)?;

    let service = state.service.clone();
    let updated = run_blocking(&request_id, move || {
        service.update_work_management_permission(&ctx, permission_id, payload)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::OK, updated)
}

async fn delete_work_management_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let permission_id = path_params(&request_id, path)?;
    check_positive(&request_id, "permissionId", permission_id)?;
    authorize(&state, "workManagementPermission.delete", &ctx)?;

    let service = state.service.clone();
    run_blocking(&request_id, move || {
        service.delete_work_management_permission(&ctx, permission_id)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn create_work(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<(i64, i64)>, PathRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (project_id, work_stream_id) = path_params(&request_id, path)?;
    check_positive(&request_id, "projectId", project_id)?;
    check_positive(&request_id, "workStreamId", work_stream_id)?;
    let payload: CreateWorkPayload = decode_body(&request_id, &validation::CREATE_WORK_BODY, body)?;
    authorize(&state, "work.create", &ctx)?;

    let service = state.service.clone();
    let created = run_blocking(&request_id, move || {
        service.create_work(&ctx, project_id, work_stream_id, payload)
    })
    .await?;
    Wrapped::new(request_id, StatusCode::CREATED, created)
}

async fn get_work(
    State(state): State<AppState>,
    headers: HeaderMap,
    path: Result<Path<(i64, i64, i64)>, PathRejection>,
) -> Result<Wrapped, ApiError> {
    let request_id = request_id(&headers);
    let ctx = authenticate(&request_id, &headers)?;
    let (project_id, work_stream_id, work_id) = path_params(&request_id, path)?;
    check_positive(&request_id, "projectId", project_id)?;
    check_positive(&request_id, "workStreamId", work_stream_id)?;
    check_positive(&request_id, "workId", work_id)?;
    authorize(&state, "work.view", &ctx)?;

    let service = state.service.clone();
    let found = run_blocking(&request_id, move || service.get_work(project_id, work_stream_id, work_id)).await?;
    Wrapped::new(request_id, StatusCode::OK, found)
}

fn authenticate(request_id: &str, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let user = AuthUser::from_headers(headers).map_err(|error| ApiError::new(request_id.to_string(), error))?;
    Ok(RequestContext {
        request_id: request_id.to_string(),
        user,
    })
}

fn authorize(state: &AppState, policy: &str, ctx: &RequestContext) -> Result<(), ApiError> {
    state
        .service
        .authorize(policy, ctx)
        .map_err(|error| ApiError::new(ctx.request_id.clone(), error))
}

fn path_params<T>(request_id: &str, path: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    path.map(|Path(value)| value).map_err(|rejection| {
        ApiError::new(
            request_id.to_string(),
            AppError::Validation(format!("Validation error: {}", rejection.body_text())),
        )
    })
}

fn check_key(request_id: &str, key: &str) -> Result<(), ApiError> {
    if key.is_empty() || key.chars().count() > MAX_KEY_LENGTH {
        return Err(ApiError::new(
            request_id.to_string(),
            AppError::Validation(format!("Validation error: key must be 1..={} characters", MAX_KEY_LENGTH)),
        ));
    }
    Ok(())
}

fn check_positive(request_id: &str, name: &str, value: i64) -> Result<(), ApiError> {
    if value <= 0 {
        return Err(ApiError::new(
            request_id.to_string(),
            AppError::Validation(format!("Validation error: {} must be a positive integer", name)),
        ));
    }
    Ok(())
}

fn decode_body<T: DeserializeOwned>(
    request_id: &str,
    schema: &JSONSchema,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<T, ApiError> {
    let to_api_error = |error: AppError| ApiError::new(request_id.to_string(), error);
    let Json(mut body) = body
        .map_err(|rejection| AppError::Validation(format!("Validation error: {}", rejection.body_text())))
        .map_err(to_api_error)?;
    validation::validate_body(schema, &mut body).map_err(to_api_error)?;
    validation::decode_param(body).map_err(to_api_error)
}

/// Runs a unit of work on the blocking pool; SQLite calls never run on the
/// async workers.
async fn run_blocking<T, F>(request_id: &str, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AppError::Internal(format!("worker task failed: {}", error)))
        .and_then(|result| result)
        .map_err(|error| ApiError::new(request_id.to_string(), error))
}

/// Wires the service from configuration: database, policies and both event
/// sinks. The returned sink feeds in-process listeners.
pub fn build_service(config: &AppConfig) -> AppResult<(MetadataService, InProcessSink)> {
    let db = Arc::new(Database::new(&config.database_path)?);
    let policy = PolicyEngine::new().with_overrides(&config.policies);
    let in_process = InProcessSink::new(config.events.in_process_capacity);
    let publisher = EventPublisher::new(&config.events)
        .with_sink(Arc::new(MessageBusSink::new(Arc::new(LoggingBus))))
        .with_sink(Arc::new(in_process.clone()));
    Ok((MetadataService::new(db, policy, Arc::new(publisher)), in_process))
}

pub async fn run() -> AppResult<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.log)?;

    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|error| AppError::Validation(format!("invalid bind address {}: {}", config.bind, error)))?;
    let (service, in_process) = build_service(&config)?;

    let mut listener_events = in_process.subscribe();
    tokio::spawn(async move {
        loop {
            match listener_events.recv().await {
                Ok(event) => {
                    tracing::info!(
                        target: "events",
                        event = %event.name,
                        correlation_id = %event.correlation_id,
                        "domain event"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "in-process event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let app = build_router(AppState::new(service));
    tracing::info!(%addr, database = %config.database_path.display(), "projects metadata api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(log: &LogConfig) -> AppResult<()> {
    let writer = match &log.directory {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "projects-metadata.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            BoxMakeWriter::new(non_blocking)
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let filter = tracing_subscriber::EnvFilter::try_new(&log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|error| AppError::Internal(error.to_string()))
}
