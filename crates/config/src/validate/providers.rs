//! Provider validation
//!
//! Checks that at least one provider is usable and that every configured
//! provider has credentials and well-formed endpoints.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use validator::Validate;

/// Validate provider blocks
pub fn validate_providers(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let providers = &config.providers;

    if providers.configured().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Provider,
            "No certificate provider is configured and listed in 'preference'",
        ));
    }

    if let Some(ref commercial) = providers.commercial {
        if let Err(e) = commercial.validate() {
            result.add_error(ValidationError::new(
                ErrorCategory::Provider,
                format!("Invalid 'commercial' provider: {}", e),
            ));
        }
        if commercial.api_url.starts_with("http://") {
            result.add_warning(ValidationWarning::new(
                "Commercial provider API URL is not HTTPS; credentials are sent in clear text",
            ));
        }
    }

    if let Some(ref cloud) = providers.cloud {
        if let Err(e) = cloud.validate() {
            result.add_error(ValidationError::new(
                ErrorCategory::Provider,
                format!("Invalid 'cloud' provider: {}", e),
            ));
        }
        if cloud.operation_poll_secs > cloud.operation_timeout_secs {
            result.add_error(ValidationError::new(
                ErrorCategory::Provider,
                format!(
                    "Cloud provider operation-poll-secs ({}) exceeds operation-timeout-secs ({})",
                    cloud.operation_poll_secs, cloud.operation_timeout_secs
                ),
            ));
        }
    }

    if let Some(ref free_acme) = providers.free_acme {
        match free_acme.signer_url.as_deref() {
            Some(raw) if url::Url::parse(raw).is_err() => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Provider,
                    format!("Invalid 'free-acme' signer-url '{}'", raw),
                ));
            }
            None if free_acme.enabled => {
                result.add_warning(ValidationWarning::new(
                    "Provider 'free-acme' has no signer-url; ready orders cannot be finalized",
                ));
            }
            _ => {}
        }
    }

    result
}
