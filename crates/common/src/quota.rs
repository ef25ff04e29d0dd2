//! Plan tiers and external account binding quotas.
//!
//! Every subscription belongs to a plan tier. The tier bounds how many
//! *active* EAB credentials the subscription may hold at once; revoked
//! credentials do not count against the quota.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::ParseKindError;

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Basic,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Basic => "basic",
            PlanTier::Professional => "professional",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(PlanTier::Basic),
            "professional" | "pro" => Ok(PlanTier::Professional),
            "enterprise" => Ok(PlanTier::Enterprise),
            other => Err(ParseKindError {
                kind: "plan tier",
                value: other.to_string(),
            }),
        }
    }
}

/// Maximum number of active EAB credentials per plan tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EabQuotas {
    #[serde(default = "default_basic")]
    pub basic: u32,
    #[serde(default = "default_professional")]
    pub professional: u32,
    #[serde(default = "default_enterprise")]
    pub enterprise: u32,
}

fn default_basic() -> u32 {
    2
}

fn default_professional() -> u32 {
    5
}

fn default_enterprise() -> u32 {
    20
}

impl Default for EabQuotas {
    fn default() -> Self {
        Self {
            basic: default_basic(),
            professional: default_professional(),
            enterprise: default_enterprise(),
        }
    }
}

impl EabQuotas {
    /// Active credential limit for a tier
    pub fn limit_for(&self, tier: PlanTier) -> u32 {
        match tier {
            PlanTier::Basic => self.basic,
            PlanTier::Professional => self.professional,
            PlanTier::Enterprise => self.enterprise,
        }
    }

    /// Whether one more credential fits next to `active` existing ones
    pub fn allows(&self, tier: PlanTier, active: u32) -> bool {
        active < self.limit_for(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let quotas = EabQuotas::default();
        assert_eq!(quotas.limit_for(PlanTier::Basic), 2);
        assert_eq!(quotas.limit_for(PlanTier::Professional), 5);
        assert_eq!(quotas.limit_for(PlanTier::Enterprise), 20);
    }

    #[test]
    fn test_allows() {
        let quotas = EabQuotas::default();
        assert!(quotas.allows(PlanTier::Basic, 0));
        assert!(quotas.allows(PlanTier::Basic, 1));
        assert!(!quotas.allows(PlanTier::Basic, 2));
        assert!(quotas.allows(PlanTier::Enterprise, 19));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("Pro".parse::<PlanTier>().unwrap(), PlanTier::Professional);
        assert!("platinum".parse::<PlanTier>().is_err());
    }
}
