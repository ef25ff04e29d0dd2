//! Configuration loading and validation for certmill.
//!
//! Configuration is read from a KDL file (the primary format) or a TOML
//! file, selected by extension. When no file is given, an embedded default
//! configuration is used: it enables only the self-hosted ACME provider.
//!
//! # Example
//!
//! ```kdl
//! polling {
//!     interval-secs 300
//!     max-attempts 60
//! }
//!
//! providers {
//!     preference "commercial" "cloud" "free-acme"
//!     commercial {
//!         api-url "https://api.reseller.example/v1"
//!         username "certmill"
//!         password-env "CERTMILL_COMMERCIAL_PASSWORD"
//!     }
//!     free-acme
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

mod kdl;
mod sections;
pub mod validate;

pub use sections::{
    ChallengeValidationConfig, CloudCaConfig, CommercialCaConfig, EabConfig, EngineConfig,
    FreeAcmeConfig, OrderConfig, PollingConfig, ProvidersConfig, RenewalConfig,
};
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Embedded configuration used when no file is specified
const DEFAULT_CONFIG_KDL: &str = include_str!("default.kdl");

/// Complete certmill configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub engine: EngineConfig,
    pub orders: OrderConfig,
    pub validation: ChallengeValidationConfig,
    pub polling: PollingConfig,
    pub renewal: RenewalConfig,
    pub eab: EabConfig,
    pub providers: ProvidersConfig,
}

impl Config {
    /// Load configuration from a `.kdl` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            Some("kdl") | None => Self::from_kdl(&content)?,
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "Unsupported configuration format '.{}' (expected .kdl or .toml)",
                    other
                ));
            }
        };

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse a KDL document
    pub fn from_kdl(content: &str) -> Result<Self> {
        kdl::parse_config(content)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// Embedded default configuration
    pub fn default_embedded() -> Result<Self> {
        debug!("Using embedded default configuration");
        Self::from_kdl(DEFAULT_CONFIG_KDL)
    }

    /// Run field-level and semantic validation.
    ///
    /// Errors are fatal; warnings are logged by the caller.
    pub fn check(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        let field_checks = [
            ("engine", self.engine.validate()),
            ("orders", self.orders.validate()),
            ("validation", self.validation.validate()),
            ("polling", self.polling.validate()),
            ("renewal", self.renewal.validate()),
        ];
        for (section, outcome) in field_checks {
            if let Err(errors) = outcome {
                result.add_error(ValidationError::new(
                    ErrorCategory::Field,
                    format!("Invalid '{}' section: {}", section, errors),
                ));
            }
        }

        result.merge(validate::providers::validate_providers(self));
        result.merge(validate::preference::validate_preference(self));
        result.merge(validate::lint::lint_config(self));
        result
    }

    /// Validate and turn errors into a single `Err`
    pub fn validate(&self) -> Result<()> {
        let result = self.check();
        if result.errors.is_empty() {
            Ok(())
        } else {
            let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
            Err(anyhow::anyhow!(
                "Configuration has {} error(s):\n  - {}",
                messages.len(),
                messages.join("\n  - ")
            ))
        }
    }
}
