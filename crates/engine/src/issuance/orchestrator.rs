//! Issuance orchestration
//!
//! Drives one certificate from CSR generation through provider submission.
//! Providers are tried in the selector's attempt plan until one accepts the
//! request; each attempt is logged and recorded on the provider's circuit
//! breaker. A certificate that no provider accepted settles in `failed`
//! with the last error kept in `provider_data`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use certmill_common::{CertificateId, ProviderKind, SubscriptionId};
use certmill_config::{PollingConfig, RenewalConfig};

use super::certificate::{Certificate, CertificateStatus};
use super::renewal::{RenewalRecord, RenewalScheduler};
use crate::acme::OrderStateMachine;
use crate::crypto;
use crate::domain;
use crate::error::{EngineError, EngineResult};
use crate::ports::Collaborators;
use crate::providers::{
    CertificateRequest, ProviderStatus, RevocationReason, RevokeOutcome, StatusSnapshot,
};
use crate::selector::{IssuanceRequirements, ProviderSelector};
use crate::tasks::{PollTask, Task};

/// Polling and renewal timing
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub poll_interval: Duration,
    /// Polls before a non-terminal certificate is force-failed
    pub max_poll_attempts: u32,
    pub renew_before: Duration,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::minutes(5),
            max_poll_attempts: 60,
            renew_before: Duration::days(30),
        }
    }
}

impl IssuanceSettings {
    pub fn from_config(polling: &PollingConfig, renewal: &RenewalConfig) -> EngineResult<Self> {
        let poll_interval = i64::try_from(polling.interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                EngineError::Configuration(format!("polling interval {}s is out of range", polling.interval_secs))
            })?;
        let renew_before = Duration::try_days(i64::from(renewal.renew_before_days)).ok_or_else(|| {
            EngineError::Configuration(format!(
                "renew-before {} days is out of range",
                renewal.renew_before_days
            ))
        })?;
        Ok(Self {
            poll_interval,
            max_poll_attempts: polling.max_attempts.max(1),
            renew_before,
        })
    }
}

/// Point-in-time view of a certificate
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub certificate_id: CertificateId,
    pub domain: String,
    pub status: CertificateStatus,
    pub provider: ProviderKind,
    /// Live upstream status for certificates still in flight
    pub provider_status: Option<ProviderStatus>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StatusReport {
    fn stored(certificate: &Certificate) -> Self {
        Self {
            certificate_id: certificate.id.clone(),
            domain: certificate.domain.clone(),
            status: certificate.status,
            provider: certificate.provider,
            provider_status: None,
            expires_at: certificate.expires_at,
            error: certificate.last_error().map(str::to_string),
        }
    }

    fn with_upstream(mut self, snapshot: &StatusSnapshot) -> Self {
        self.provider_status = Some(snapshot.status);
        if self.expires_at.is_none() {
            self.expires_at = snapshot.expires_at;
        }
        self
    }
}

/// Certificate status for a provider status seen while issuance is running
pub(crate) fn in_flight_status(status: ProviderStatus) -> CertificateStatus {
    match status {
        ProviderStatus::Pending => CertificateStatus::PendingValidation,
        _ => CertificateStatus::Processing,
    }
}

pub struct IssuanceOrchestrator {
    pub(super) selector: ProviderSelector,
    pub(super) orders: Arc<OrderStateMachine>,
    pub(super) ports: Collaborators,
    pub(super) renewals: RenewalScheduler,
    pub(super) settings: IssuanceSettings,
}

impl IssuanceOrchestrator {
    pub fn new(
        selector: ProviderSelector,
        orders: Arc<OrderStateMachine>,
        ports: Collaborators,
        settings: IssuanceSettings,
    ) -> Self {
        let renewals = RenewalScheduler::new(
            Arc::clone(&ports.subscriptions),
            Arc::clone(&ports.renewals),
            Arc::clone(&ports.queue),
            Arc::clone(&ports.clock),
            settings.renew_before,
        );
        Self {
            selector,
            orders,
            ports,
            renewals,
            settings,
        }
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    pub fn ports(&self) -> &Collaborators {
        &self.ports
    }

    pub fn renewals(&self) -> &RenewalScheduler {
        &self.renewals
    }

    pub fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    /// Issue a certificate for `domain`.
    ///
    /// Returns `Err` only for requests rejected up front (inactive or unknown
    /// subscription, malformed domain, no provider able to issue the level).
    /// Provider failures come back as a `failed` certificate.
    pub async fn issue_certificate(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
        requirements: IssuanceRequirements,
    ) -> EngineResult<Certificate> {
        self.issue(subscription_id, domain, requirements, None).await
    }

    /// Issue the replacement certificate for a renewal
    pub(super) async fn issue_renewal(&self, record: &RenewalRecord) -> EngineResult<Certificate> {
        self.issue(
            &record.subscription_id,
            &record.domain,
            record.requirements.clone(),
            Some(record),
        )
        .await
    }

    async fn issue(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
        requirements: IssuanceRequirements,
        renewal: Option<&RenewalRecord>,
    ) -> EngineResult<Certificate> {
        let domain = domain::normalize(domain);
        if !domain::is_valid_domain(&domain) {
            return Err(EngineError::Validation(format!("invalid domain '{}'", domain)));
        }
        if !self.ports.subscriptions.is_active(subscription_id).await? {
            return Err(EngineError::invalid_state(
                "subscription",
                subscription_id,
                "subscription is not active",
            ));
        }

        let plan = self.selector.attempt_plan(&requirements);
        let Some(&primary) = plan.first() else {
            return Err(EngineError::Configuration(format!(
                "no configured provider can issue {} certificates",
                requirements.validation_level
            )));
        };

        let (csr_pem, key_pem) = crypto::generate_csr(&domain)?;
        let sealed_key = self.ports.vault.seal(&key_pem)?;

        let now = self.ports.clock.now();
        let mut certificate = Certificate::new(
            subscription_id.clone(),
            domain,
            requirements,
            primary,
            csr_pem,
            sealed_key,
            now,
        );
        if let Some(record) = renewal {
            certificate.renewal_of = Some(record.certificate_id.clone());
            certificate.renewal_id = Some(record.id.clone());
        }
        self.ports.certificates.save(&certificate).await?;

        info!(
            certificate_id = %certificate.id,
            domain = %certificate.domain,
            level = %certificate.validation_level,
            plan = ?plan.iter().map(ProviderKind::as_str).collect::<Vec<_>>(),
            "Starting certificate issuance"
        );

        self.submit(certificate, plan).await
    }

    /// Walk the attempt plan until one provider accepts the request
    async fn submit(&self, mut certificate: Certificate, plan: Vec<ProviderKind>) -> EngineResult<Certificate> {
        let registry = self.selector.registry();
        let request = CertificateRequest {
            domains: vec![certificate.domain.clone()],
            csr_pem: certificate.csr_pem.clone(),
            validation_level: certificate.validation_level,
            validity_days: None,
        };

        let total = plan.len();
        let mut last_error: Option<String> = None;

        for (index, kind) in plan.into_iter().enumerate() {
            let attempt = index + 1;
            let Some(driver) = registry.get(kind) else {
                warn!(provider = %kind, attempt, "Provider in plan is not registered");
                continue;
            };

            // Every planned provider is called; the breaker only tracks its health
            if let Some(breaker) = registry.breaker(kind) {
                if !breaker.allows_attempt() {
                    debug!(provider = %kind, attempt, "Circuit breaker open, attempting provider anyway");
                }
            }
            let outcome = driver.create_certificate(&request).await;

            if !outcome.success {
                if let Some(breaker) = registry.breaker(kind) {
                    breaker.record_failure();
                }
                let message = outcome
                    .error
                    .unwrap_or_else(|| "provider reported failure without detail".to_string());
                warn!(
                    certificate_id = %certificate.id,
                    provider = %kind,
                    attempt,
                    attempts = total,
                    error = %message,
                    "Provider attempt failed"
                );
                last_error = Some(format!("{}: {}", kind, message));
                continue;
            }

            if let Some(breaker) = registry.breaker(kind) {
                breaker.record_success();
            }

            let Some(provider_certificate_id) = outcome.certificate_id else {
                warn!(provider = %kind, attempt, "Provider accepted the request without an id");
                last_error = Some(format!("{}: accepted without a certificate id", kind));
                continue;
            };

            if let Err(e) = certificate.switch_provider(kind) {
                error!(certificate_id = %certificate.id, error = %e, "Provider change refused");
                last_error = Some(e.to_string());
                break;
            }

            let now = self.ports.clock.now();
            certificate.provider_certificate_id = Some(provider_certificate_id);
            certificate.provider_data = outcome.provider_data;
            certificate.status = in_flight_status(outcome.status);
            certificate.updated_at = now;
            self.ports.certificates.save(&certificate).await?;

            self.schedule_poll(&certificate.id, 1);

            info!(
                certificate_id = %certificate.id,
                provider = %kind,
                attempt,
                fallback = certificate.provider_changed,
                status = %certificate.status,
                "Certificate submitted to provider"
            );
            return Ok(certificate);
        }

        let message = last_error.unwrap_or_else(|| "no provider attempted the request".to_string());
        certificate.mark_failed(message.as_str(), self.ports.clock.now());
        self.ports.certificates.save(&certificate).await?;

        error!(
            certificate_id = %certificate.id,
            domain = %certificate.domain,
            attempts = total,
            error = %message,
            "Certificate issuance failed on every provider"
        );
        Ok(certificate)
    }

    pub(super) fn schedule_poll(&self, certificate_id: &CertificateId, attempt: u32) {
        let delay = self.settings.poll_interval;
        let task = PollTask {
            certificate_id: certificate_id.clone(),
            attempt,
            next_run_at: self.ports.clock.now() + delay,
        };
        debug!(certificate_id = %certificate_id, attempt, "Poll scheduled");
        self.ports.queue.schedule(Task::PollCertificate(task), delay);
    }

    pub(super) async fn load(&self, certificate_id: &CertificateId) -> EngineResult<Certificate> {
        self.ports
            .certificates
            .get(certificate_id)
            .await?
            .ok_or_else(|| EngineError::not_found("certificate", certificate_id))
    }

    /// Current status; in-flight certificates also carry the live upstream status
    pub async fn get_certificate_status(&self, certificate_id: &CertificateId) -> EngineResult<StatusReport> {
        let certificate = self.load(certificate_id).await?;
        let report = StatusReport::stored(&certificate);

        let (Some(provider_id), true) = (
            certificate.provider_certificate_id.as_deref(),
            certificate.status.is_in_flight(),
        ) else {
            return Ok(report);
        };
        let Some(driver) = self.selector.registry().get(certificate.provider) else {
            return Ok(report);
        };

        match driver.get_certificate_status(provider_id).await {
            Ok(snapshot) => Ok(report.with_upstream(&snapshot)),
            Err(e) => {
                warn!(certificate_id = %certificate.id, provider = %certificate.provider, error = %e, "Live status lookup failed");
                Ok(report)
            }
        }
    }

    /// Bulk status; in-flight certificates are looked up once per provider
    pub async fn get_certificate_statuses(&self, certificate_ids: &[CertificateId]) -> EngineResult<Vec<StatusReport>> {
        let mut certificates = Vec::with_capacity(certificate_ids.len());
        for id in certificate_ids {
            certificates.push(self.load(id).await?);
        }

        let mut by_provider: HashMap<ProviderKind, Vec<String>> = HashMap::new();
        for certificate in certificates.iter().filter(|c| c.status.is_in_flight()) {
            if let Some(provider_id) = &certificate.provider_certificate_id {
                by_provider
                    .entry(certificate.provider)
                    .or_default()
                    .push(provider_id.clone());
            }
        }

        let mut live: HashMap<(ProviderKind, String), StatusSnapshot> = HashMap::new();
        for (kind, ids) in by_provider {
            let Some(driver) = self.selector.registry().get(kind) else {
                continue;
            };
            debug!(provider = %kind, count = ids.len(), "Bulk status lookup");
            for (id, snapshot) in driver.get_certificate_statuses(&ids).await {
                live.insert((kind, id), snapshot);
            }
        }

        Ok(certificates
            .iter()
            .map(|certificate| {
                let report = StatusReport::stored(certificate);
                let key = certificate
                    .provider_certificate_id
                    .clone()
                    .map(|id| (certificate.provider, id));
                match key.and_then(|k| live.get(&k)) {
                    Some(snapshot) if certificate.status.is_in_flight() => report.with_upstream(snapshot),
                    _ => report,
                }
            })
            .collect())
    }

    /// Revoke an issued certificate with its provider
    pub async fn revoke_certificate(
        &self,
        certificate_id: &CertificateId,
        reason: RevocationReason,
    ) -> EngineResult<RevokeOutcome> {
        let mut certificate = self.load(certificate_id).await?;

        if certificate.status != CertificateStatus::Issued {
            return Ok(RevokeOutcome::failed(format!(
                "certificate is {}, only issued certificates can be revoked",
                certificate.status
            )));
        }
        let Some(provider_id) = certificate.provider_certificate_id.clone() else {
            return Ok(RevokeOutcome::failed("certificate has no provider certificate id"));
        };
        let Some(driver) = self.selector.registry().get(certificate.provider) else {
            return Ok(RevokeOutcome::failed(format!(
                "provider {} is not configured",
                certificate.provider
            )));
        };

        let outcome = driver.revoke_certificate(&provider_id, reason).await;
        let now = self.ports.clock.now();
        if outcome.success {
            certificate.status = CertificateStatus::Revoked;
            certificate.revoked_at = Some(now);
            certificate.updated_at = now;
            info!(
                certificate_id = %certificate.id,
                provider = %certificate.provider,
                reason = reason.as_str(),
                "Certificate revoked"
            );
            if let Err(e) = self.renewals.cancel_pending(&certificate, "certificate revoked").await {
                warn!(certificate_id = %certificate.id, error = %e, "Could not cancel the pending renewal");
            }
        } else {
            let message = outcome.error.clone().unwrap_or_else(|| "revocation failed".to_string());
            warn!(certificate_id = %certificate.id, provider = %certificate.provider, error = %message, "Revocation failed");
            certificate.set_error(message);
            certificate.updated_at = now;
        }
        self.ports.certificates.save(&certificate).await?;
        Ok(outcome)
    }
}

impl std::fmt::Debug for IssuanceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceOrchestrator")
            .field("selector", &self.selector)
            .field("settings", &self.settings)
            .finish()
    }
}
