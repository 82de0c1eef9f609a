//! Service configuration.
//!
//! A [`ServiceConfig`] travels to the transport as JSON when a service asks
//! for another one to be created, and is handed to the new service's init
//! function on the other side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ServiceError};

/// Parameters for creating a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name. Unique services are registered under it.
    pub name: String,

    /// Kind of service to create, as registered with the transport.
    pub kind: String,

    /// Register the name for [`query_service`](crate::ServiceContext::query_service).
    #[serde(default)]
    pub unique: bool,

    /// Preferred worker, 0 lets the transport choose.
    #[serde(default)]
    pub worker_hint: u32,

    /// Free-form parameters for the service's init function.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl ServiceConfig {
    /// Create a config for a service of `kind` named `name`.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            unique: false,
            worker_hint: 0,
            params: Map::new(),
        }
    }

    /// Register the service under its name.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Ask for a specific worker.
    pub fn worker_hint(mut self, worker: u32) -> Self {
        self.worker_hint = worker;
        self
    }

    /// Add one init parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up one init parameter.
    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// `Config` if the name or kind is empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ServiceError::Config("name is required".to_string()));
        }
        if self.kind.is_empty() {
            return Err(ServiceError::Config("kind is required".to_string()));
        }
        Ok(())
    }

    /// Encode as the JSON blob handed to the transport.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the JSON blob produced by [`to_json`](Self::to_json).
    pub fn from_json(blob: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(blob)
            .map_err(|e| ServiceError::Config(format!("invalid service config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
