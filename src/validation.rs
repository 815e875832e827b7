use crate::errors::{AppError, AppResult};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Audit fields callers may send but never set.
pub const AUDIT_FIELDS: [&str; 6] = ["createdAt", "updatedAt", "deletedAt", "createdBy", "updatedBy", "deletedBy"];

fn compile(schema: Value) -> JSONSchema {
    JSONSchema::compile(&schema).expect("valid request schema")
}

/// Wraps the `param` object schema in the request envelope.
fn envelope(param: Value) -> Value {
    json!({
        "type": "object",
        "properties": { "param": param },
        "required": ["param"]
    })
}

fn config_reference() -> Value {
    json!({
        "type": "object",
        "properties": {
            "key": { "type": "string", "minLength": 1, "maxLength": 45 },
            "version": { "type": "integer", "minimum": 1 }
        },
        "required": ["key"],
        "additionalProperties": false
    })
}

pub static CONFIG_BODY: Lazy<JSONSchema> = Lazy::new(|| {
    compile(envelope(json!({
        "type": "object",
        "properties": {
            "config": { "type": "object" }
        },
        "required": ["config"]
    })))
});

pub static PROJECT_TEMPLATE_BODY: Lazy<JSONSchema> = Lazy::new(|| {
    compile(envelope(json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "minLength": 1, "maxLength": 255 },
            "key": { "type": "string", "minLength": 1, "maxLength": 45 },
            "category": { "type": "string", "minLength": 1, "maxLength": 45 },
            "type": { "type": "string", "minLength": 1, "maxLength": 45 },
            "icon": { "type": "string", "maxLength": 255 },
            "question": { "type": "string", "maxLength": 255 },
            "info": { "type": "string", "maxLength": 255 },
            "aliases": { "type": "array" },
            "disabled": { "type": "boolean" },
            "hidden": { "type": "boolean" },
            "scope": { "type": "object" },
            "phases": { "type": "object" },
            "form": config_reference(),
            "priceConfig": config_reference(),
            "planConfig": config_reference()
        },
        "required": ["name", "key", "category", "icon", "question", "info", "aliases"]
    })))
});

pub static CREATE_PERMISSION_BODY: Lazy<JSONSchema> = Lazy::new(|| {
    compile(envelope(json!({
        "type": "object",
        "properties": {
            "policy": { "type": "string", "minLength": 1, "maxLength": 255 },
            "permission": { "type": "object" },
            "projectTemplateId": { "type": "integer", "minimum": 1 }
        },
        "required": ["policy", "permission", "projectTemplateId"],
        "additionalProperties": false
    })))
});

pub static UPDATE_PERMISSION_BODY: Lazy<JSONSchema> = Lazy::new(|| {
    compile(envelope(json!({
        "type": "object",
        "properties": {
            "policy": { "type": "string", "minLength": 1, "maxLength": 255 },
            "permission": { "type": "object" },
            "projectTemplateId": { "type": "integer", "minimum": 1 }
        },
        "additionalProperties": false,
        "minProperties": 1
    })))
});

pub static CREATE_WORK_BODY: Lazy<JSONSchema> = Lazy::new(|| {
    compile(envelope(json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "minLength": 1 },
            "description": { "type": "string" },
            "requirements": { "type": "string" },
            "status": { "type": "string", "minLength": 1 },
            "startDate": { "type": "string", "format": "date-time" },
            "endDate": { "type": "string", "format": "date-time" },
            "duration": { "type": "number", "minimum": 0 },
            "budget": { "type": "number", "minimum": 0 },
            "spentBudget": { "type": "number", "minimum": 0 },
            "progress": { "type": "number", "minimum": 0 },
            "details": {},
            "order": { "type": "integer" },
            "productTemplateId": { "type": "integer", "minimum": 1 }
        },
        "required": ["name", "status"],
        "additionalProperties": false
    })))
});

/// Strips caller-supplied audit fields from `param`, then checks the body
/// against `schema`. Every violation is reported.
pub fn validate_body(schema: &JSONSchema, body: &mut Value) -> AppResult<()> {
    strip_audit_fields(body);

    let errors: Vec<String> = schema
        .validate(body)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::InvalidFields(errors))
    }
}

pub fn strip_audit_fields(body: &mut Value) {
    if let Some(param) = body.get_mut("param").and_then(Value::as_object_mut) {
        for field in AUDIT_FIELDS {
            param.remove(field);
        }
    }
}

/// Decodes `param` into the typed payload of a route.
pub fn decode_param<T: DeserializeOwned>(mut body: Value) -> AppResult<T> {
    let param = body
        .get_mut("param")
        .map(Value::take)
        .ok_or_else(|| AppError::Validation("Validation error: param is required".to_string()))?;
    serde_json::from_value(param).map_err(|error| AppError::Validation(format!("Validation error: {}", error)))
}
