use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit columns shared by every metadata table. The tombstone pair is never
/// serialized in API output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: i64,
    pub updated_by: i64,
    #[serde(skip_serializing, default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing, default)]
    pub deleted_by: Option<i64>,
}

impl Audit {
    pub fn created_now(user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            created_by: user_id,
            updated_by: user_id,
            deleted_at: None,
            deleted_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigKind {
    PriceConfig,
    PlanConfig,
    Form,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 3] = [Self::PriceConfig, Self::PlanConfig, Self::Form];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriceConfig => "priceConfig",
            Self::PlanConfig => "planConfig",
            Self::Form => "form",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PriceConfig => "PriceConfig",
            Self::PlanConfig => "PlanConfig",
            Self::Form => "Form",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::PriceConfig => "price_configs",
            Self::PlanConfig => "plan_configs",
            Self::Form => "forms",
        }
    }

    /// Collection segment used in the metadata routes.
    pub fn route_segment(self) -> &'static str {
        match self {
            Self::PriceConfig => "priceConfigs",
            Self::PlanConfig => "planConfigs",
            Self::Form => "forms",
        }
    }

    pub fn policy(self, action: &str) -> String {
        format!("{}.{}", self.as_str(), action)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionedConfig {
    pub id: i64,
    pub key: String,
    pub version: i64,
    pub revision: i64,
    pub config: serde_json::Value,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigPayload {
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectType {
    pub key: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub question: Option<String>,
    pub info: Option<String>,
    pub aliases: Vec<serde_json::Value>,
    pub metadata: serde_json::Value,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Default)]
pub struct NewProjectType {
    pub key: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub question: Option<String>,
    pub info: Option<String>,
    pub aliases: Vec<serde_json::Value>,
    pub metadata: serde_json::Value,
}

/// Pointer from a template to a versioned config. A missing version means
/// "latest".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReference {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTemplate {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub category: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    pub icon: String,
    pub question: String,
    pub info: String,
    pub aliases: Vec<serde_json::Value>,
    pub disabled: bool,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<ConfigReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_config: Option<ConfigReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_config: Option<ConfigReference>,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectTemplatePayload {
    pub name: String,
    pub key: String,
    pub category: String,
    #[serde(rename = "type")]
    pub project_type: Option<String>,
    pub icon: String,
    pub question: String,
    pub info: String,
    pub aliases: Vec<serde_json::Value>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub hidden: bool,
    pub scope: Option<serde_json::Value>,
    pub phases: Option<serde_json::Value>,
    pub form: Option<ConfigReference>,
    pub price_config: Option<ConfigReference>,
    pub plan_config: Option<ConfigReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkManagementPermission {
    pub id: i64,
    pub policy: String,
    pub permission: serde_json::Value,
    pub project_template_id: i64,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermissionPayload {
    pub policy: String,
    pub permission: serde_json::Value,
    pub project_template_id: i64,
}

/// Partial update: absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePermissionPayload {
    pub policy: Option<String>,
    pub permission: Option<serde_json::Value>,
    pub project_template_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkStream {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub status: String,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone)]
pub struct NewWorkStream {
    pub project_id: i64,
    pub name: String,
    pub stream_type: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductTemplate {
    pub id: i64,
    pub name: String,
    pub product_key: String,
    pub category: String,
    pub template: serde_json::Value,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone)]
pub struct NewProductTemplate {
    pub name: String,
    pub product_key: String,
    pub category: String,
    pub template: serde_json::Value,
}

/// Product attached to a phase. `name` and `type` are copied from the
/// product template when the phase is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProduct {
    pub id: i64,
    pub phase_id: i64,
    pub project_id: i64,
    pub template_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub product_type: String,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPhase {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub status: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub budget: Option<f64>,
    pub spent_budget: Option<f64>,
    pub progress: Option<f64>,
    pub details: Option<serde_json::Value>,
    pub order: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<PhaseProduct>>,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkPayload {
    pub name: String,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub status: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub budget: Option<f64>,
    pub spent_budget: Option<f64>,
    pub progress: Option<f64>,
    pub details: Option<serde_json::Value>,
    pub order: Option<i64>,
    pub product_template_id: Option<i64>,
}
