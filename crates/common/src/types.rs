//! Shared vocabulary: certificate providers, validation levels and
//! circuit breaker settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing one of the string-tagged enums fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

// ============================================================================
// Providers
// ============================================================================

/// Backend certificate authority a certificate can be routed to.
///
/// This is a closed set: adding a provider means adding a variant and
/// letting the compiler point at every `match` that needs a new arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Commercial CA reseller API (supports DV, OV and EV)
    Commercial,
    /// Cloud-managed certificate API (DV only, installs itself)
    Cloud,
    /// Self-hosted ACME CA backed by certmill's own order machinery
    FreeAcme,
}

impl ProviderKind {
    /// All providers in default preference order
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Commercial,
        ProviderKind::Cloud,
        ProviderKind::FreeAcme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Commercial => "commercial",
            ProviderKind::Cloud => "cloud",
            ProviderKind::FreeAcme => "free-acme",
        }
    }

    /// Whether the provider can issue the given validation level
    pub fn supports(&self, level: ValidationLevel) -> bool {
        match self {
            ProviderKind::Commercial => true,
            ProviderKind::Cloud | ProviderKind::FreeAcme => level == ValidationLevel::Dv,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commercial" => Ok(ProviderKind::Commercial),
            "cloud" | "cloud-managed" => Ok(ProviderKind::Cloud),
            "free-acme" | "free_acme" | "acme" => Ok(ProviderKind::FreeAcme),
            other => Err(ParseKindError {
                kind: "provider",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Validation level
// ============================================================================

/// Certificate validation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationLevel {
    /// Domain validated
    #[default]
    Dv,
    /// Organisation validated
    Ov,
    /// Extended validation
    Ev,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::Dv => "DV",
            ValidationLevel::Ov => "OV",
            ValidationLevel::Ev => "EV",
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationLevel {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DV" => Ok(ValidationLevel::Dv),
            "OV" => Ok(ValidationLevel::Ov),
            "EV" => Ok(ValidationLevel::Ev),
            other => Err(ParseKindError {
                kind: "validation level",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes
    pub success_threshold: u32,
    /// Seconds to stay open before probing again
    pub timeout_seconds: u64,
    /// Trial requests allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 300,
            half_open_max_requests: 1,
        }
    }
}

/// Observable circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert_eq!(
            "cloud-managed".parse::<ProviderKind>().unwrap(),
            ProviderKind::Cloud
        );
        assert!("letsencrypt-ish".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_only_commercial_supports_ov_ev() {
        assert!(ProviderKind::Commercial.supports(ValidationLevel::Ev));
        assert!(ProviderKind::Commercial.supports(ValidationLevel::Ov));
        assert!(!ProviderKind::Cloud.supports(ValidationLevel::Ov));
        assert!(!ProviderKind::FreeAcme.supports(ValidationLevel::Ev));
        assert!(ProviderKind::FreeAcme.supports(ValidationLevel::Dv));
    }

    #[test]
    fn test_validation_level_parse() {
        assert_eq!("ev".parse::<ValidationLevel>().unwrap(), ValidationLevel::Ev);
        assert_eq!(" DV ".parse::<ValidationLevel>().unwrap(), ValidationLevel::Dv);
        let err = "XV".parse::<ValidationLevel>().unwrap_err();
        assert!(err.to_string().contains("validation level"));
    }

    #[test]
    fn test_provider_kind_serde() {
        let json = serde_json::to_string(&ProviderKind::FreeAcme).unwrap();
        assert_eq!(json, "\"free-acme\"");
    }
}
