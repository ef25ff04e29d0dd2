//! Certificate records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use certmill_common::{CertificateId, ProviderKind, RenewalId, SubscriptionId, ValidationLevel};

use crate::error::{EngineError, EngineResult};
use crate::selector::IssuanceRequirements;

/// Certificate lifecycle
///
/// ```text
/// pending_validation -> processing -> issued -> expired | revoked | replaced
///                   \-> failed     \-> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    PendingValidation,
    Processing,
    Issued,
    Expired,
    Revoked,
    Replaced,
    Failed,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::PendingValidation => "pending_validation",
            CertificateStatus::Processing => "processing",
            CertificateStatus::Issued => "issued",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Replaced => "replaced",
            CertificateStatus::Failed => "failed",
        }
    }

    /// Issuance is still under way
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CertificateStatus::PendingValidation | CertificateStatus::Processing)
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: CertificateId,
    pub subscription_id: SubscriptionId,
    pub domain: String,
    #[serde(rename = "type")]
    pub validation_level: ValidationLevel,
    pub requirements: IssuanceRequirements,
    /// Provider that owns `provider_certificate_id`
    pub provider: ProviderKind,
    /// Set once a fallback provider took over from the primary
    #[serde(default)]
    pub provider_changed: bool,
    pub provider_certificate_id: Option<String>,
    pub status: CertificateStatus,
    /// Status checks made so far
    #[serde(default)]
    pub poll_attempts: u32,
    pub csr_pem: String,
    /// Private key as sealed by the secret vault
    pub sealed_private_key: String,
    pub certificate_pem: Option<String>,
    pub ca_bundle_pem: Option<String>,
    /// Opaque upstream data; `error` holds the last failure
    #[serde(default)]
    pub provider_data: Value,
    /// Certificate this one renews
    #[serde(default)]
    pub renewal_of: Option<CertificateId>,
    #[serde(default)]
    pub renewal_id: Option<RenewalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Certificate {
    /// Fresh record awaiting its first provider attempt
    pub fn new(
        subscription_id: SubscriptionId,
        domain: String,
        requirements: IssuanceRequirements,
        provider: ProviderKind,
        csr_pem: String,
        sealed_private_key: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CertificateId::generate(),
            subscription_id,
            domain,
            validation_level: requirements.validation_level,
            requirements,
            provider,
            provider_changed: false,
            provider_certificate_id: None,
            status: CertificateStatus::PendingValidation,
            poll_attempts: 0,
            csr_pem,
            sealed_private_key,
            certificate_pem: None,
            ca_bundle_pem: None,
            provider_data: Value::Null,
            renewal_of: None,
            renewal_id: None,
            created_at: now,
            updated_at: now,
            issued_at: None,
            expires_at: None,
            revoked_at: None,
        }
    }

    /// Hand the certificate to a different provider.
    ///
    /// Allowed once; a second change is rejected.
    pub fn switch_provider(&mut self, provider: ProviderKind) -> EngineResult<()> {
        if provider == self.provider {
            return Ok(());
        }
        if self.provider_changed {
            return Err(EngineError::invalid_state(
                "certificate",
                &self.id,
                format!(
                    "provider already changed to {}, refusing change to {}",
                    self.provider, provider
                ),
            ));
        }
        self.provider = provider;
        self.provider_changed = true;
        Ok(())
    }

    pub fn mark_issued(
        &mut self,
        expires_at: DateTime<Utc>,
        certificate_pem: Option<String>,
        ca_bundle_pem: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = CertificateStatus::Issued;
        self.expires_at = Some(expires_at);
        self.issued_at = Some(now);
        if certificate_pem.is_some() {
            self.certificate_pem = certificate_pem;
            self.ca_bundle_pem = ca_bundle_pem;
        }
        self.updated_at = now;
    }

    /// Settle into `failed`, keeping the message in `provider_data`
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = CertificateStatus::Failed;
        self.set_error(error);
        self.updated_at = now;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        match self.provider_data.as_object_mut() {
            Some(map) => {
                map.insert("error".to_string(), Value::String(error));
            }
            None => {
                let previous = std::mem::take(&mut self.provider_data);
                self.provider_data = if previous.is_null() {
                    json!({ "error": error })
                } else {
                    json!({ "error": error, "upstream": previous })
                };
            }
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.provider_data.get("error").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate() -> Certificate {
        Certificate::new(
            SubscriptionId::new("sub_1"),
            "example.com".to_string(),
            IssuanceRequirements::default(),
            ProviderKind::Commercial,
            "csr".to_string(),
            "vault:key".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_provider_changes_at_most_once() {
        let mut cert = certificate();
        cert.switch_provider(ProviderKind::Commercial).unwrap();
        assert!(!cert.provider_changed);

        cert.switch_provider(ProviderKind::Cloud).unwrap();
        assert!(cert.provider_changed);
        assert_eq!(cert.provider, ProviderKind::Cloud);

        assert!(cert.switch_provider(ProviderKind::FreeAcme).is_err());
        assert_eq!(cert.provider, ProviderKind::Cloud);
    }

    #[test]
    fn test_failure_keeps_upstream_data() {
        let mut cert = certificate();
        cert.provider_data = json!("raw");
        cert.mark_failed("rejected", Utc::now());
        assert_eq!(cert.status, CertificateStatus::Failed);
        assert_eq!(cert.last_error(), Some("rejected"));
        assert_eq!(cert.provider_data["upstream"], "raw");

        cert.mark_failed("again", Utc::now());
        assert_eq!(cert.last_error(), Some("again"));
    }

    #[test]
    fn test_issued_has_expiry() {
        let mut cert = certificate();
        let expires = Utc::now() + chrono::Duration::days(90);
        cert.mark_issued(expires, Some("PEM".to_string()), None, Utc::now());
        assert_eq!(cert.status, CertificateStatus::Issued);
        assert_eq!(cert.expires_at, Some(expires));
        assert!(!cert.status.is_in_flight());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&CertificateStatus::PendingValidation).unwrap();
        assert_eq!(json, "\"pending_validation\"");
    }
}
