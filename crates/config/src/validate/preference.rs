//! Preference list validation
//!
//! Every provider named in `preference` must have a configuration block;
//! configured providers missing from the list go last.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use certmill_common::ProviderKind;

/// Validate the provider preference order
pub fn validate_preference(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let providers = &config.providers;

    let mut seen = Vec::new();
    for kind in &providers.preference {
        if seen.contains(kind) {
            result.add_error(ValidationError::new(
                ErrorCategory::Preference,
                format!("Provider '{}' listed more than once in 'preference'", kind),
            ));
            continue;
        }
        seen.push(*kind);

        if !providers.is_configured(*kind) {
            result.add_warning(ValidationWarning::new(format!(
                "Provider '{}' is listed in 'preference' but not configured; it will be skipped",
                kind
            )));
        }
    }

    for kind in ProviderKind::ALL {
        if providers.is_configured(kind) && !providers.preference.contains(&kind) {
            result.add_warning(ValidationWarning::new(format!(
                "Provider '{}' is configured but missing from 'preference'; it is tried after the listed providers",
                kind
            )));
        }
    }

    result
}
