//! Configuration validation seam.
//!
//! The service that turns an API description into callable tool definitions
//! lives outside this crate. The supervisor only needs a yes/no answer plus a
//! list of messages, which is what [`SpecValidator`] models.
//! [`BasicValidator`] performs the structural checks that do not need that service.

use crate::config::ServerSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of validating a submitted server definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }

    /// Single human-readable message
    pub fn message(&self) -> String {
        if self.errors.is_empty() {
            "invalid configuration".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

#[async_trait]
pub trait SpecValidator: Send + Sync {
    async fn validate(&self, spec: &ServerSpec) -> ValidationOutcome;
}

/// Structural checks on a server definition
#[derive(Debug, Clone, Default)]
pub struct BasicValidator;

#[async_trait]
impl SpecValidator for BasicValidator {
    async fn validate(&self, spec: &ServerSpec) -> ValidationOutcome {
        let mut errors = Vec::new();

        if spec.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        } else if spec
            .name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            errors.push(format!(
                "name '{}' may only contain letters, digits, '-', '_' and '.'",
                spec.name
            ));
        }

        if spec.version.trim().is_empty() {
            errors.push("version must not be empty".to_string());
        }

        if spec.launch.command.as_os_str().is_empty() {
            errors.push("command must not be empty".to_string());
        }

        if spec.port == Some(0) {
            errors.push("port must be between 1 and 65535".to_string());
        }

        if let Some(ref cwd) = spec.launch.cwd {
            if !cwd.is_dir() {
                errors.push(format!("working directory does not exist: {}", cwd.display()));
            }
        }

        if let Some(ref path) = spec.launch.health_path {
            if !path.starts_with('/') {
                errors.push(format!("health_path must start with '/': {}", path));
            }
        }

        if !(spec.config.is_null() || spec.config.is_object()) {
            errors.push("config must be an object".to_string());
        }

        if errors.is_empty() {
            ValidationOutcome::ok()
        } else {
            ValidationOutcome::failed(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;

    #[tokio::test]
    async fn test_valid_spec() {
        let spec = ServerSpec::new("weather-api", Transport::Stream, "/bin/sleep");
        let outcome = BasicValidator.validate(&spec).await;
        assert!(outcome.valid, "{:?}", outcome.errors);
    }

    #[tokio::test]
    async fn test_invalid_spec_collects_all_errors() {
        let mut spec = ServerSpec::new("bad name!", Transport::Stream, "");
        spec.port = Some(0);
        spec.config = serde_json::json!([1, 2]);

        let outcome = BasicValidator.validate(&spec).await;
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 4);
        assert!(outcome.message().contains("port"));
    }
}
