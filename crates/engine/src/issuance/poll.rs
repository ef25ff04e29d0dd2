//! Provider status polling
//!
//! Each [`PollTask`] is one status check. Non-terminal statuses schedule
//! the next check until the attempt ceiling, after which the certificate is
//! force-failed. Redelivered tasks for settled certificates are no-ops.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use certmill_common::{OrderId, ProviderKind};

use super::certificate::{Certificate, CertificateStatus};
use super::orchestrator::{in_flight_status, IssuanceOrchestrator};
use crate::error::{EngineError, EngineResult};
use crate::providers::{certificate_not_after, CertificateProvider, ProviderStatus, StatusSnapshot};
use crate::tasks::PollTask;

/// What one poll did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Certificate already settled or gone
    Settled,
    /// Subscription inactive; no further polls
    Cancelled,
    Rescheduled { next_attempt: u32 },
    Issued,
    Failed,
}

pub const POLLING_CEILING_MESSAGE: &str = "polling ceiling reached";

impl IssuanceOrchestrator {
    /// Run one status check.
    ///
    /// A collaborator error below the attempt ceiling reschedules the check
    /// instead of dropping it, so the certificate still settles.
    pub async fn poll(&self, task: PollTask) -> EngineResult<PollOutcome> {
        match self.check_status(&task).await {
            Err(e) if task.attempt < self.settings.max_poll_attempts => {
                warn!(
                    certificate_id = %task.certificate_id,
                    attempt = task.attempt,
                    error = %e,
                    "Status check interrupted, retrying next interval"
                );
                let next_attempt = task.attempt + 1;
                self.schedule_poll(&task.certificate_id, next_attempt);
                Ok(PollOutcome::Rescheduled { next_attempt })
            }
            result => result,
        }
    }

    async fn check_status(&self, task: &PollTask) -> EngineResult<PollOutcome> {
        let Some(mut certificate) = self.ports.certificates.get(&task.certificate_id).await? else {
            warn!(certificate_id = %task.certificate_id, "Poll for unknown certificate dropped");
            return Ok(PollOutcome::Settled);
        };
        if !certificate.status.is_in_flight() {
            debug!(certificate_id = %certificate.id, status = %certificate.status, "Certificate settled, poll ignored");
            return Ok(PollOutcome::Settled);
        }

        match self.ports.subscriptions.is_active(&certificate.subscription_id).await {
            Ok(true) => {}
            Ok(false) | Err(EngineError::NotFound { .. }) => {
                info!(
                    certificate_id = %certificate.id,
                    subscription_id = %certificate.subscription_id,
                    "Subscription inactive, polling stopped"
                );
                return Ok(PollOutcome::Cancelled);
            }
            Err(e) => {
                warn!(
                    certificate_id = %certificate.id,
                    subscription_id = %certificate.subscription_id,
                    error = %e,
                    "Subscription lookup failed"
                );
                return self.continue_polling(&mut certificate, task).await;
            }
        }

        let Some(provider_id) = certificate.provider_certificate_id.clone() else {
            return self
                .fail(&mut certificate, "no provider certificate id to poll")
                .await;
        };
        let Some(driver) = self.selector.registry().get(certificate.provider) else {
            let message = format!("provider {} is no longer configured", certificate.provider);
            return self.fail(&mut certificate, message).await;
        };

        debug!(
            certificate_id = %certificate.id,
            provider = %certificate.provider,
            attempt = task.attempt,
            "Polling provider status"
        );

        let snapshot = match driver.get_certificate_status(&provider_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    certificate_id = %certificate.id,
                    provider = %certificate.provider,
                    attempt = task.attempt,
                    error = %e,
                    "Status lookup failed"
                );
                return self.continue_polling(&mut certificate, task).await;
            }
        };

        match snapshot.status {
            ProviderStatus::Issued => {
                self.complete(&mut certificate, driver, &provider_id, snapshot, task)
                    .await
            }
            ProviderStatus::Failed | ProviderStatus::Expired => {
                if let Some(upstream) = snapshot.provider_data.get("error").and_then(|v| v.as_str()) {
                    let message = format!("provider reported {}: {}", snapshot.status, upstream);
                    return self.fail(&mut certificate, message).await;
                }
                let message = format!("provider reported {}", snapshot.status);
                self.fail(&mut certificate, message).await
            }
            ProviderStatus::Pending | ProviderStatus::Processing => {
                certificate.status = in_flight_status(snapshot.status);
                if !snapshot.provider_data.is_null() {
                    certificate.provider_data = snapshot.provider_data;
                }
                self.continue_polling(&mut certificate, task).await
            }
        }
    }

    async fn complete(
        &self,
        certificate: &mut Certificate,
        driver: Arc<dyn CertificateProvider>,
        provider_id: &str,
        snapshot: StatusSnapshot,
        task: &PollTask,
    ) -> EngineResult<PollOutcome> {
        let (certificate_pem, ca_bundle_pem) = match driver.download_certificate(provider_id).await {
            Ok(Some(downloaded)) => (Some(downloaded.certificate_pem), downloaded.ca_bundle_pem),
            Ok(None) => {
                debug!(certificate_id = %certificate.id, provider = %certificate.provider, "Provider does not hand out certificate data");
                (None, None)
            }
            Err(e) => {
                warn!(certificate_id = %certificate.id, error = %e, "Download of issued certificate failed");
                return self.continue_polling(certificate, task).await;
            }
        };

        let expires_at = snapshot
            .expires_at
            .or_else(|| certificate_pem.as_deref().and_then(certificate_not_after));
        let Some(expires_at) = expires_at else {
            warn!(certificate_id = %certificate.id, "Provider reports issued but no expiry is known yet");
            return self.continue_polling(certificate, task).await;
        };

        if !snapshot.provider_data.is_null() {
            certificate.provider_data = snapshot.provider_data;
        }
        certificate.mark_issued(expires_at, certificate_pem, ca_bundle_pem, self.ports.clock.now());
        self.ports.certificates.save(certificate).await?;

        info!(
            certificate_id = %certificate.id,
            domain = %certificate.domain,
            provider = %certificate.provider,
            expires_at = %expires_at,
            "Certificate issued"
        );

        match self.renewals.record_outcome(certificate).await {
            Ok(Some(_)) => {
                if let Err(e) = self.retire_replaced(certificate).await {
                    warn!(certificate_id = %certificate.id, error = %e, "Could not retire the renewed certificate");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(certificate_id = %certificate.id, error = %e, "Could not settle the renewal record"),
        }

        if let Err(e) = self.renewals.schedule_renewal(certificate).await {
            warn!(certificate_id = %certificate.id, error = %e, "Could not schedule renewal");
        }
        Ok(PollOutcome::Issued)
    }

    /// Reschedule, or force-fail at the attempt ceiling
    async fn continue_polling(&self, certificate: &mut Certificate, task: &PollTask) -> EngineResult<PollOutcome> {
        if task.attempt >= self.settings.max_poll_attempts {
            warn!(
                certificate_id = %certificate.id,
                attempts = task.attempt,
                "Provider never reached a terminal status"
            );
            return self.fail(certificate, POLLING_CEILING_MESSAGE).await;
        }

        certificate.poll_attempts = task.attempt;
        certificate.updated_at = self.ports.clock.now();
        self.ports.certificates.save(certificate).await?;

        let next_attempt = task.attempt + 1;
        self.schedule_poll(&certificate.id, next_attempt);
        Ok(PollOutcome::Rescheduled { next_attempt })
    }

    pub(super) async fn fail(&self, certificate: &mut Certificate, message: impl Into<String>) -> EngineResult<PollOutcome> {
        let message = message.into();
        certificate.mark_failed(message.as_str(), self.ports.clock.now());
        self.ports.certificates.save(certificate).await?;
        error!(
            certificate_id = %certificate.id,
            provider = %certificate.provider,
            error = %message,
            "Certificate issuance failed"
        );

        if certificate.provider == ProviderKind::FreeAcme {
            if let Some(order_id) = certificate.provider_certificate_id.as_deref() {
                let order_id = OrderId::from(order_id);
                if let Err(e) = self.orders.mark_invalid(&order_id, message.as_str()) {
                    debug!(order_id = %order_id, error = %e, "Order left as is");
                }
            }
        }

        if let Err(e) = self.renewals.record_outcome(certificate).await {
            warn!(certificate_id = %certificate.id, error = %e, "Could not settle the renewal record");
        }
        Ok(PollOutcome::Failed)
    }

    /// Mark the renewed certificate `replaced` and release its order
    pub(super) async fn retire_replaced(&self, certificate: &Certificate) -> EngineResult<()> {
        let Some(previous_id) = certificate.renewal_of.as_ref() else {
            return Ok(());
        };
        let Some(mut previous) = self.ports.certificates.get(previous_id).await? else {
            warn!(certificate_id = %previous_id, "Renewed certificate record missing");
            return Ok(());
        };
        if previous.status != CertificateStatus::Issued {
            return Ok(());
        }

        previous.status = CertificateStatus::Replaced;
        previous.updated_at = self.ports.clock.now();
        self.ports.certificates.save(&previous).await?;

        if previous.provider == ProviderKind::FreeAcme {
            if let Some(order_id) = previous.provider_certificate_id.as_deref() {
                self.orders.archive(&OrderId::from(order_id));
            }
        }

        info!(
            certificate_id = %previous.id,
            replaced_by = %certificate.id,
            "Certificate replaced by renewal"
        );
        Ok(())
    }
}
