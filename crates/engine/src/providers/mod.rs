//! Certificate provider port and drivers
//!
//! Every upstream CA is driven through [`CertificateProvider`]. Drivers
//! never retry CA-level rejections and never return `Err` from
//! `create`/`revoke`: failures come back as records with `success: false`
//! and the orchestrator decides whether to fall back.
//!
//! - [`CommercialCaDriver`] - reseller REST API with session tokens
//! - [`CloudManagedDriver`] - managed certificates behind long-running operations
//! - [`FreeAcmeDriver`] - the engine's own ACME order machinery
//! - [`ProviderRegistry`] - closed mapping from [`ProviderKind`] to driver

mod cloud;
mod commercial;
pub mod domain;
mod free_acme;
mod registry;
mod session;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use certmill_common::{ProviderKind, ValidationLevel};

pub use cloud::CloudManagedDriver;
pub use commercial::CommercialCaDriver;
pub(crate) use free_acme::certificate_not_after;
pub use free_acme::{AcmeSigner, FreeAcmeDriver, SignedCertificate, WebhookSigner};
pub use registry::ProviderRegistry;
pub use session::SessionTokenCache;

/// Errors inside a driver; converted to outcome records at the port
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation not supported by provider: {0}")]
    Unsupported(&'static str),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider configuration error: {0}")]
    Configuration(String),

    /// Local order state does not allow the operation
    #[error("Order state error: {0}")]
    State(String),
}

impl ProviderError {
    /// Map a reqwest transport error
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else {
            ProviderError::Http(e.to_string())
        }
    }

    /// Upstream refused the request itself; retrying the same call is pointless
    pub fn is_rejection(&self) -> bool {
        matches!(self, ProviderError::Api { status, .. } if (400..500).contains(status))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Certificate status in the engine's vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Processing,
    Issued,
    Failed,
    Expired,
}

impl ProviderStatus {
    /// Map an upstream status string.
    ///
    /// Unknown strings map to `Processing`: polling continues and the
    /// attempt ceiling bounds it.
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "issued" | "valid" | "active" | "completed" | "complete" => ProviderStatus::Issued,
            "processing" | "in_progress" | "provisioning" | "ready" => ProviderStatus::Processing,
            "pending" | "pending_validation" | "new" => ProviderStatus::Pending,
            "failed" | "rejected" | "cancelled" | "canceled" | "invalid" | "revoked" => {
                ProviderStatus::Failed
            }
            "expired" => ProviderStatus::Expired,
            other => {
                tracing::debug!(status = %other, "Unrecognised upstream status, treating as processing");
                ProviderStatus::Processing
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Issued | ProviderStatus::Failed | ProviderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Processing => "processing",
            ProviderStatus::Issued => "issued",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a driver is asked to issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// First entry is the primary domain
    pub domains: Vec<String>,
    pub csr_pem: String,
    pub validation_level: ValidationLevel,
    #[serde(default)]
    pub validity_days: Option<u32>,
}

impl CertificateRequest {
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or_default()
    }
}

/// Result of `create_certificate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub success: bool,
    /// Provider-side certificate or order id
    pub certificate_id: Option<String>,
    pub status: ProviderStatus,
    pub provider_data: Value,
    pub error: Option<String>,
}

impl CreateOutcome {
    pub fn created(certificate_id: impl Into<String>, status: ProviderStatus, provider_data: Value) -> Self {
        Self {
            success: true,
            certificate_id: Some(certificate_id.into()),
            status,
            provider_data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            certificate_id: None,
            status: ProviderStatus::Failed,
            provider_data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Result of `get_certificate_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: ProviderStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_data: Value,
}

/// Result of `download_certificate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedCertificate {
    pub certificate_pem: String,
    pub ca_bundle_pem: Option<String>,
}

/// Result of `revoke_certificate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl RevokeOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// RFC 5280 revocation reasons accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    /// CRL reason code
    pub fn code(&self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "key_compromise",
            RevocationReason::AffiliationChanged => "affiliation_changed",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessation_of_operation",
        }
    }
}

/// Uniform contract over upstream certificate authorities
#[async_trait]
pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    async fn create_certificate(&self, request: &CertificateRequest) -> CreateOutcome;

    async fn get_certificate_status(&self, certificate_id: &str) -> ProviderResult<StatusSnapshot>;

    /// Status of many certificates; drivers with a bulk endpoint override
    /// this. Ids the upstream does not report on are left out.
    async fn get_certificate_statuses(&self, certificate_ids: &[String]) -> HashMap<String, StatusSnapshot> {
        let mut out = HashMap::with_capacity(certificate_ids.len());
        for id in certificate_ids {
            match self.get_certificate_status(id).await {
                Ok(snapshot) => {
                    out.insert(id.clone(), snapshot);
                }
                Err(e) => {
                    tracing::warn!(provider = %self.kind(), certificate_id = %id, error = %e, "Status lookup failed");
                }
            }
        }
        out
    }

    /// `Ok(None)` means the provider does not hand out certificate files
    async fn download_certificate(&self, certificate_id: &str) -> ProviderResult<Option<DownloadedCertificate>>;

    async fn revoke_certificate(&self, certificate_id: &str, reason: RevocationReason) -> RevokeOutcome;
}
