//! Configuration linting for risky operational settings
//!
//! Nothing here is fatal; every finding is a warning.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint configuration for settings that are legal but likely mistakes
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let configured = config.providers.configured();
    if configured.len() == 1 {
        result.add_warning(ValidationWarning::new(format!(
            "Only one provider ('{}') is configured; failed issuances have no fallback",
            configured[0]
        )));
    }

    let polling = &config.polling;
    let ceiling_secs = polling.interval_secs.saturating_mul(u64::from(polling.max_attempts));
    if ceiling_secs < 3600 {
        result.add_warning(ValidationWarning::new(format!(
            "Polling gives up after {}s; commercial OV/EV orders routinely take hours",
            ceiling_secs
        )));
    }

    let renew_window_secs = u64::from(config.renewal.renew_before_days) * 86_400;
    if renew_window_secs <= ceiling_secs {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal window ({} days) is not longer than the polling ceiling ({}s)",
            config.renewal.renew_before_days, ceiling_secs
        )));
    }

    let validation = &config.validation;
    if validation.http_attempts == 1 {
        result.add_warning(ValidationWarning::new(
            "HTTP-01 validation makes a single attempt; transient network errors will fail challenges",
        ));
    }

    if config.eab.basic > config.eab.professional || config.eab.professional > config.eab.enterprise {
        result.add_warning(ValidationWarning::new(
            "EAB quotas are not increasing with plan tier (basic <= professional <= enterprise)",
        ));
    }

    result
}
