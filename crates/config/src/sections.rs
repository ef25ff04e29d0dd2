//! Configuration sections.
//!
//! Every section deserializes from TOML with kebab-case keys and is filled
//! field-by-field by the KDL parser; both paths share the defaults below.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use certmill_common::{CircuitBreakerConfig, EabQuotas, ProviderKind};

// ============================================================================
// Engine
// ============================================================================

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Directory holding records, sealed keys and the account key
    pub data_dir: PathBuf,

    /// How often the worker drains due tasks
    #[validate(range(min = 1, max = 3600))]
    pub worker_tick_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/certmill"),
            worker_tick_secs: 5,
        }
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Order and authorization lifetimes
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", default)]
pub struct OrderConfig {
    #[validate(range(min = 1, max = 8760))]
    pub order_ttl_hours: u64,

    #[validate(range(min = 1, max = 8760))]
    pub authorization_ttl_hours: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            order_ttl_hours: 7 * 24,
            authorization_ttl_hours: 24,
        }
    }
}

// ============================================================================
// Challenge validation
// ============================================================================

/// HTTP-01 and DNS-01 validation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChallengeValidationConfig {
    /// Per-request timeout for HTTP-01 fetches
    #[validate(range(min = 1, max = 120))]
    pub http_timeout_secs: u64,

    /// Fetch attempts before an HTTP-01 challenge is declared invalid
    #[validate(range(min = 1, max = 10))]
    pub http_attempts: u32,

    /// Delay between HTTP-01 attempts
    pub http_retry_backoff_ms: u64,

    /// Port HTTP-01 fetches connect to (80 outside of test environments)
    #[validate(range(min = 1))]
    pub http_port: u16,

    /// Resolvers queried for DNS-01 TXT records (empty = system resolver)
    pub dns_nameservers: Vec<IpAddr>,

    #[validate(range(min = 1, max = 60))]
    pub dns_timeout_secs: u64,
}

impl Default for ChallengeValidationConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 10,
            http_attempts: 3,
            http_retry_backoff_ms: 2000,
            http_port: 80,
            dns_nameservers: Vec::new(),
            dns_timeout_secs: 5,
        }
    }
}

// ============================================================================
// Polling and renewal
// ============================================================================

/// Provider status polling
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", default)]
pub struct PollingConfig {
    #[validate(range(min = 1, max = 86400))]
    pub interval_secs: u64,

    /// Polls before a never-finishing certificate is force-failed
    #[validate(range(min = 1, max = 10000))]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_attempts: 60,
        }
    }
}

/// Renewal timing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", default)]
pub struct RenewalConfig {
    #[validate(range(min = 1, max = 365))]
    pub renew_before_days: u32,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_before_days: 30,
        }
    }
}

// ============================================================================
// Providers
// ============================================================================

/// Upstream certificate authorities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProvidersConfig {
    /// Fallback preference order
    pub preference: Vec<ProviderKind>,
    pub commercial: Option<CommercialCaConfig>,
    pub cloud: Option<CloudCaConfig>,
    pub free_acme: Option<FreeAcmeConfig>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            preference: ProviderKind::ALL.to_vec(),
            commercial: None,
            cloud: None,
            free_acme: Some(FreeAcmeConfig::default()),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ProvidersConfig {
    /// Whether a provider has a configuration block
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Commercial => self.commercial.is_some(),
            ProviderKind::Cloud => self.cloud.is_some(),
            ProviderKind::FreeAcme => self.free_acme.as_ref().is_some_and(|c| c.enabled),
        }
    }

    /// Configured providers in preference order, without duplicates
    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut out = Vec::new();
        for kind in &self.preference {
            if self.is_configured(*kind) && !out.contains(kind) {
                out.push(*kind);
            }
        }
        out
    }
}

/// Commercial CA reseller API
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct CommercialCaConfig {
    #[validate(url)]
    pub api_url: String,

    #[validate(length(min = 1))]
    pub username: String,

    #[validate(length(min = 1))]
    pub password: String,

    /// Lifetime of a cached session token
    #[serde(default = "default_session_ttl")]
    #[validate(range(min = 60, max = 604800))]
    pub session_ttl_secs: u64,

    /// Certificates per bulk status request
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 500))]
    pub batch_size: usize,

    /// Pause between bulk status chunks
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,

    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for CommercialCaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommercialCaConfig")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("batch_size", &self.batch_size)
            .field("batch_delay_ms", &self.batch_delay_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

pub(crate) fn default_session_ttl() -> u64 {
    23 * 3600
}

pub(crate) fn default_batch_size() -> usize {
    50
}

pub(crate) fn default_batch_delay() -> u64 {
    250
}

pub(crate) fn default_request_timeout() -> u64 {
    30
}

/// Cloud-managed certificate API
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct CloudCaConfig {
    #[validate(url)]
    pub api_url: String,

    #[validate(length(min = 1))]
    pub project: String,

    #[serde(default = "default_location")]
    pub location: String,

    #[validate(length(min = 1))]
    pub access_token: String,

    /// Upper bound on waiting for a long-running operation
    #[serde(default = "default_operation_timeout")]
    #[validate(range(min = 1))]
    pub operation_timeout_secs: u64,

    #[serde(default = "default_operation_poll")]
    #[validate(range(min = 1))]
    pub operation_poll_secs: u64,

    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

pub(crate) fn default_location() -> String {
    "global".to_string()
}

pub(crate) fn default_operation_timeout() -> u64 {
    300
}

pub(crate) fn default_operation_poll() -> u64 {
    5
}

/// Self-hosted ACME CA
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FreeAcmeConfig {
    pub enabled: bool,

    /// Signing service that turns finalized orders into certificates.
    /// Without one, ready orders stay `processing` until polling gives up.
    pub signer_url: Option<String>,

    pub signer_timeout_secs: u64,
}

impl Default for FreeAcmeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signer_url: None,
            signer_timeout_secs: default_request_timeout(),
        }
    }
}

/// EAB quotas live in `certmill-common`; re-exported here for config users
pub type EabConfig = EabQuotas;
