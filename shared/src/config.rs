use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batcher::BatchConfig;
use crate::capabilities::http::ValidatedUrl;
use crate::capabilities::kv::validate_key;
use crate::lock::LockConfig;
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Collector routes, relative to `api_host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiRoutes {
    pub events: String,
    pub people: String,
    pub groups: String,
}

impl Default for ApiRoutes {
    fn default() -> Self {
        Self {
            events: "track/".to_string(),
            people: "engage/".to_string(),
            groups: "groups/".to_string(),
        }
    }
}

/// Top-level settings for one project's outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub token: String,
    pub api_host: String,
    pub api_routes: ApiRoutes,
    pub batch: BatchConfig,
    pub lock: LockConfig,
    pub queue: QueueConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_host: String::new(),
            api_routes: ApiRoutes::default(),
            batch: BatchConfig::default(),
            lock: LockConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl OutboxConfig {
    pub fn new(token: impl Into<String>, api_host: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_host: api_host.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::invalid("token", "must not be empty"));
        }
        validate_key(&self.token).map_err(|e| ConfigError::invalid("token", e.to_string()))?;
        self.api_host_url()?;
        for (field, route) in [
            ("api_routes.events", &self.api_routes.events),
            ("api_routes.people", &self.api_routes.people),
            ("api_routes.groups", &self.api_routes.groups),
        ] {
            if route.trim().is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }
        self.batch.validate()?;
        self.lock.validate()?;
        self.queue.validate()?;
        Ok(())
    }

    pub fn api_host_url(&self) -> Result<ValidatedUrl, ConfigError> {
        ValidatedUrl::new(self.api_host.as_str())
            .map_err(|e| ConfigError::invalid("api_host", e.to_string()))
    }
}
