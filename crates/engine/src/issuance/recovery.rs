//! Restart recovery
//!
//! Records are durable but the task queue is not. After a restart the
//! stored certificates and renewals are scanned and the work they were
//! waiting on is queued again:
//!
//! - in-flight certificates get their next status check, counting the
//!   checks already made against the ceiling
//! - in-flight certificates never handed to a provider are failed
//! - pending renewals get their `Renew` task back
//! - in-progress renewals whose replacement already settled are closed

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::certificate::CertificateStatus;
use super::orchestrator::IssuanceOrchestrator;
use super::renewal::RenewalStatus;
use crate::error::EngineResult;
use crate::tasks::Task;

/// Message on certificates interrupted before any provider accepted them
pub const INTERRUPTED_SUBMISSION_MESSAGE: &str = "interrupted before submission to a provider";

/// What [`IssuanceOrchestrator::recover`] queued or settled
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub polls_queued: usize,
    pub certificates_failed: usize,
    pub renewals_queued: usize,
    pub renewals_settled: usize,
}

impl IssuanceOrchestrator {
    /// Queue the follow-up work of stored records
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = self.ports.clock.now();

        for mut certificate in self.ports.certificates.list().await? {
            if !certificate.status.is_in_flight() {
                continue;
            }
            if certificate.provider_certificate_id.is_none() {
                warn!(certificate_id = %certificate.id, domain = %certificate.domain, "Certificate was never submitted");
                self.fail(&mut certificate, INTERRUPTED_SUBMISSION_MESSAGE).await?;
                report.certificates_failed += 1;
                continue;
            }

            let attempt = (certificate.poll_attempts + 1).min(self.settings.max_poll_attempts);
            self.schedule_poll(&certificate.id, attempt);
            report.polls_queued += 1;
        }

        for record in self.ports.renewals.list().await? {
            match record.status {
                RenewalStatus::Pending => {
                    let delay = (record.run_at - now).max(Duration::zero());
                    self.ports.queue.schedule(
                        Task::Renew {
                            renewal_id: record.id.clone(),
                        },
                        delay,
                    );
                    report.renewals_queued += 1;
                }
                RenewalStatus::InProgress => {
                    let Some(replacement_id) = record.new_certificate_id.as_ref() else {
                        continue;
                    };
                    let Some(replacement) = self.ports.certificates.get(replacement_id).await? else {
                        warn!(renewal_id = %record.id, certificate_id = %replacement_id, "Replacement certificate record missing");
                        continue;
                    };
                    if replacement.status.is_in_flight() {
                        continue;
                    }

                    // The replacement settled but its renewal was never closed
                    if self.renewals.record_outcome(&replacement).await?.is_some() {
                        report.renewals_settled += 1;
                        if replacement.status == CertificateStatus::Issued {
                            self.retire_replaced(&replacement).await?;
                            if let Err(e) = self.renewals.schedule_renewal(&replacement).await {
                                warn!(certificate_id = %replacement.id, error = %e, "Could not schedule renewal");
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if report == RecoveryReport::default() {
            debug!("Nothing to recover");
        } else {
            info!(
                polls_queued = report.polls_queued,
                certificates_failed = report.certificates_failed,
                renewals_queued = report.renewals_queued,
                renewals_settled = report.renewals_settled,
                "Recovered in-flight work"
            );
        }
        Ok(report)
    }
}
