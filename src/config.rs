use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "PROJECTS_METADATA_CONFIG";
pub const BIND_ENV: &str = "PROJECTS_METADATA_BIND";
pub const DATABASE_ENV: &str = "PROJECTS_METADATA_DB";
pub const LOG_ENV: &str = "PROJECTS_METADATA_LOG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub bind: String,
    pub database_path: PathBuf,
    pub log: LogConfig,
    pub events: EventsConfig,
    /// Role lists replacing the built-in ones, keyed by policy name.
    pub policies: BTreeMap<String, Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            database_path: PathBuf::from("data/projects-metadata.sqlite"),
            log: LogConfig::default(),
            events: EventsConfig::default(),
            policies: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    /// When set, logs also go to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsConfig {
    /// Attempts per sink before a publish failure is given up on.
    pub publish_attempts: u32,
    /// Routes whose publish failures fail the request after commit.
    pub strict_routes: BTreeSet<String>,
    pub in_process_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            publish_attempts: 1,
            strict_routes: BTreeSet::new(),
            in_process_capacity: 256,
        }
    }
}

impl AppConfig {
    /// File named by `PROJECTS_METADATA_CONFIG` (if any), then env overrides.
    pub fn load() -> AppResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup(BIND_ENV).filter(|value| !value.trim().is_empty()) {
            self.bind = bind.trim().to_string();
        }
        if let Some(path) = lookup(DATABASE_ENV).filter(|value| !value.trim().is_empty()) {
            self.database_path = PathBuf::from(path.trim());
        }
        if let Some(level) = lookup(LOG_ENV).filter(|value| !value.trim().is_empty()) {
            self.log.level = level.trim().to_string();
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.bind.trim().is_empty() {
            return Err(AppError::Validation("bind address must not be empty".to_string()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(AppError::Validation("databasePath must not be empty".to_string()));
        }
        if self.events.publish_attempts == 0 {
            return Err(AppError::Validation("events.publishAttempts must be at least 1".to_string()));
        }
        if self.events.in_process_capacity == 0 {
            return Err(AppError::Validation("events.inProcessCapacity must be at least 1".to_string()));
        }
        if let Some((policy, _)) = self.policies.iter().find(|(_, roles)| roles.is_empty()) {
            return Err(AppError::Validation(format!("policy '{}' has no roles", policy)));
        }
        Ok(())
    }
}
