//! Provider selection
//!
//! Primary selection rules, first match wins:
//!
//! 1. hosted on the cloud platform -> cloud
//! 2. free certificate wanted -> free-acme
//! 3. OV or EV -> commercial
//! 4. DV with auto-renewal -> cloud
//! 5. otherwise commercial
//!
//! A rule only fires when its provider can issue the requested validation
//! level, so OV and EV always land on the commercial CA.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use certmill_common::{ProviderKind, ValidationLevel};

use crate::providers::ProviderRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CostPreference {
    #[default]
    Standard,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostingPlatform {
    /// Workloads behind the cloud provider's load balancers
    CloudPlatform,
    SelfManaged,
}

/// What the caller needs from a certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceRequirements {
    pub validation_level: ValidationLevel,
    #[serde(default)]
    pub cost_preference: CostPreference,
    #[serde(default)]
    pub auto_renewal: bool,
    #[serde(default)]
    pub hosting_platform: Option<HostingPlatform>,
}

impl IssuanceRequirements {
    pub fn new(validation_level: ValidationLevel) -> Self {
        Self {
            validation_level,
            cost_preference: CostPreference::Standard,
            auto_renewal: false,
            hosting_platform: None,
        }
    }
}

impl Default for IssuanceRequirements {
    fn default() -> Self {
        Self::new(ValidationLevel::Dv)
    }
}

/// Pure primary selection over the fixed rule list
pub fn select_primary(requirements: &IssuanceRequirements) -> ProviderKind {
    let level = requirements.validation_level;
    let can = |kind: ProviderKind| kind.supports(level);

    let (kind, rule) = if requirements.hosting_platform == Some(HostingPlatform::CloudPlatform)
        && can(ProviderKind::Cloud)
    {
        (ProviderKind::Cloud, "cloud-platform")
    } else if requirements.cost_preference == CostPreference::Free && can(ProviderKind::FreeAcme) {
        (ProviderKind::FreeAcme, "free")
    } else if matches!(level, ValidationLevel::Ov | ValidationLevel::Ev) {
        (ProviderKind::Commercial, "validation-level")
    } else if requirements.auto_renewal && can(ProviderKind::Cloud) {
        (ProviderKind::Cloud, "auto-renewal")
    } else {
        (ProviderKind::Commercial, "default")
    };

    trace!(provider = %kind, rule, level = %level, "Primary provider selected");
    kind
}

/// Provider choice against the registered providers and their breakers
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
}

impl ProviderSelector {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn select_primary(&self, requirements: &IssuanceRequirements) -> ProviderKind {
        select_primary(requirements)
    }

    /// Every configured provider except `exclude`, in preference order.
    ///
    /// Providers whose circuit breaker is rejecting are moved to the end,
    /// never dropped.
    pub fn fallback_order(&self, exclude: ProviderKind) -> Vec<ProviderKind> {
        let (mut ready, rejecting): (Vec<_>, Vec<_>) = self
            .registry
            .configured()
            .into_iter()
            .filter(|kind| *kind != exclude)
            .partition(|kind| {
                !self
                    .registry
                    .breaker(*kind)
                    .is_some_and(|breaker| breaker.is_rejecting())
            });
        if !rejecting.is_empty() {
            debug!(providers = ?rejecting, "Providers with open circuit breakers moved to the end");
        }
        ready.extend(rejecting);
        ready
    }

    /// Fallbacks that can also issue `level`
    pub fn fallback_order_for(&self, exclude: ProviderKind, level: ValidationLevel) -> Vec<ProviderKind> {
        self.fallback_order(exclude)
            .into_iter()
            .filter(|kind| kind.supports(level))
            .collect()
    }

    /// Primary first, then its fallbacks; an unconfigured primary is left out
    pub fn attempt_plan(&self, requirements: &IssuanceRequirements) -> Vec<ProviderKind> {
        let primary = self.select_primary(requirements);
        let mut plan = Vec::with_capacity(3);
        if self.registry.is_configured(primary) {
            plan.push(primary);
        } else {
            debug!(provider = %primary, "Selected primary is not configured, using fallbacks only");
        }
        plan.extend(self.fallback_order_for(primary, requirements.validation_level));
        plan
    }
}
