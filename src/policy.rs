use crate::errors::{AppError, AppResult};
use axum::http::HeaderMap;
use std::collections::{BTreeMap, BTreeSet};

pub const USER_ID_HEADER: &str = "x-auth-user-id";
pub const USER_ROLES_HEADER: &str = "x-auth-user-roles";

pub const ROLE_ADMINISTRATOR: &str = "administrator";
pub const ROLE_CONNECT_ADMIN: &str = "Connect Admin";
pub const ROLE_CONNECT_MANAGER: &str = "Connect Manager";
pub const ROLE_COPILOT: &str = "copilot";
pub const ROLE_CUSTOMER: &str = "customer";

const METADATA_ACTIONS: [&str; 4] = ["create", "view", "edit", "delete"];
const METADATA_RESOURCES: [&str; 5] = [
    "priceConfig",
    "planConfig",
    "form",
    "projectTemplate",
    "workManagementPermission",
];

/// Identity established by the gateway in front of this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn from_headers(headers: &HeaderMap) -> AppResult<Self> {
        let raw_id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Unauthenticated("No authenticated user on request".to_string()))?;
        let user_id = raw_id
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| AppError::Unauthenticated(format!("Invalid authenticated user id '{}'", raw_id)))?;

        let roles = headers
            .get(USER_ROLES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|role| !role.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { user_id, roles })
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policies: BTreeMap<String, BTreeSet<String>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        let admins = [ROLE_ADMINISTRATOR, ROLE_CONNECT_ADMIN];
        let mut policies = BTreeMap::new();
        for resource in METADATA_RESOURCES {
            for action in METADATA_ACTIONS {
                policies.insert(format!("{}.{}", resource, action), normalize_roles(admins));
            }
        }

        let work_roles = [
            ROLE_ADMINISTRATOR,
            ROLE_CONNECT_ADMIN,
            ROLE_CONNECT_MANAGER,
            ROLE_COPILOT,
            ROLE_CUSTOMER,
        ];
        policies.insert("work.create".to_string(), normalize_roles(work_roles));
        policies.insert("work.view".to_string(), normalize_roles(work_roles));

        Self { policies }
    }

    /// Replaces the role list of each named policy.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (policy, roles) in overrides {
            self.policies
                .insert(policy.clone(), normalize_roles(roles.iter().map(String::as_str)));
        }
        self
    }

    pub fn authorize(&self, policy: &str, user: &AuthUser) -> AppResult<()> {
        let Some(allowed) = self.policies.get(policy) else {
            return Err(AppError::Forbidden(format!("Unknown policy '{}'", policy)));
        };

        if user
            .roles
            .iter()
            .any(|role| allowed.contains(&role.to_lowercase()))
        {
            return Ok(());
        }

        Err(AppError::Forbidden(format!(
            "User {} is not allowed to perform '{}'",
            user.user_id, policy
        )))
    }
}

fn normalize_roles<'a>(roles: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    roles.into_iter().map(str::to_lowercase).collect()
}
