//! Certificate renewal scheduling
//!
//! A renewal is a durable [`RenewalRecord`] plus a delayed [`Task::Renew`].
//! When the task fires, the guards are checked again and a fresh
//! certificate is issued for the same domain. The record stays open
//! (`in_progress`) until the new certificate settles, which is what keeps
//! a lineage to one open renewal at a time.
//!
//! ```text
//! pending -> in_progress -> completed
//!        \-> skipped     \-> failed
//!        \-> failed
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use certmill_common::{CertificateId, RenewalId, SubscriptionId};

use super::certificate::{Certificate, CertificateStatus};
use super::orchestrator::IssuanceOrchestrator;
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::ports::{RenewalRepository, SubscriptionDirectory, TaskQueue};
use crate::selector::IssuanceRequirements;
use crate::tasks::Task;

/// Delay before a renewal interrupted by a collaborator error runs again
pub const RENEWAL_RETRY_DELAY_MINUTES: i64 = 15;

/// Interrupted runs before a renewal is settled as failed
pub const MAX_RENEWAL_DEFERRALS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    Pending,
    /// Replacement certificate submitted, waiting for it to settle
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl RenewalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalStatus::Pending => "pending",
            RenewalStatus::InProgress => "in_progress",
            RenewalStatus::Completed => "completed",
            RenewalStatus::Failed => "failed",
            RenewalStatus::Skipped => "skipped",
        }
    }

    /// Still counts against the one-open-renewal-per-lineage rule
    pub fn is_open(&self) -> bool {
        matches!(self, RenewalStatus::Pending | RenewalStatus::InProgress)
    }
}

impl fmt::Display for RenewalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalRecord {
    pub id: RenewalId,
    /// Certificate being renewed
    pub certificate_id: CertificateId,
    pub subscription_id: SubscriptionId,
    pub domain: String,
    pub requirements: IssuanceRequirements,
    pub run_at: DateTime<Utc>,
    pub status: RenewalStatus,
    pub error: Option<String>,
    /// Replacement certificate, once submitted
    pub new_certificate_id: Option<CertificateId>,
    /// Runs pushed back by collaborator errors
    #[serde(default)]
    pub deferrals: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RenewalRecord {
    fn settle(&mut self, status: RenewalStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.updated_at = now;
    }
}

/// Result of [`RenewalScheduler::schedule_renewal`]
#[derive(Debug, Clone)]
pub enum RenewalDecision {
    Scheduled(RenewalRecord),
    Skipped(String),
}

pub struct RenewalScheduler {
    subscriptions: Arc<dyn SubscriptionDirectory>,
    renewals: Arc<dyn RenewalRepository>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    renew_before: Duration,
}

impl RenewalScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionDirectory>,
        renewals: Arc<dyn RenewalRepository>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        renew_before: Duration,
    ) -> Self {
        Self {
            subscriptions,
            renewals,
            queue,
            clock,
            renew_before,
        }
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }

    /// Queue a future re-issuance `renew_before` ahead of expiry.
    ///
    /// Skips inactive subscriptions, subscriptions without auto-renewal and
    /// lineages that already have an open renewal. A certificate inside the
    /// renewal window is renewed at once.
    pub async fn schedule_renewal(&self, certificate: &Certificate) -> EngineResult<RenewalDecision> {
        let Some(expires_at) = certificate.expires_at else {
            return Err(EngineError::invalid_state(
                "certificate",
                &certificate.id,
                "cannot schedule a renewal without an expiry",
            ));
        };

        if let Some(reason) = self.guard(&certificate.subscription_id).await? {
            info!(
                certificate_id = %certificate.id,
                domain = %certificate.domain,
                reason = %reason,
                "Renewal not scheduled"
            );
            return Ok(RenewalDecision::Skipped(reason));
        }

        if let Some(existing) = self
            .renewals
            .find_pending(&certificate.subscription_id, &certificate.domain)
            .await?
        {
            debug!(
                certificate_id = %certificate.id,
                renewal_id = %existing.id,
                "Renewal already open for this lineage"
            );
            return Ok(RenewalDecision::Skipped(format!(
                "renewal {} already {}",
                existing.id, existing.status
            )));
        }

        let now = self.clock.now();
        let run_at = (expires_at - self.renew_before).max(now);
        let record = RenewalRecord {
            id: RenewalId::generate(),
            certificate_id: certificate.id.clone(),
            subscription_id: certificate.subscription_id.clone(),
            domain: certificate.domain.clone(),
            requirements: certificate.requirements.clone(),
            run_at,
            status: RenewalStatus::Pending,
            error: None,
            new_certificate_id: None,
            deferrals: 0,
            created_at: now,
            updated_at: now,
        };
        self.renewals.save(&record).await?;
        self.queue.schedule(
            Task::Renew {
                renewal_id: record.id.clone(),
            },
            run_at - now,
        );

        info!(
            certificate_id = %certificate.id,
            renewal_id = %record.id,
            domain = %record.domain,
            run_at = %run_at,
            "Renewal scheduled"
        );
        Ok(RenewalDecision::Scheduled(record))
    }

    /// Fire a due renewal.
    ///
    /// Duplicate deliveries of an already started renewal return the record
    /// unchanged.
    pub async fn run_renewal(
        &self,
        renewal_id: &RenewalId,
        orchestrator: &IssuanceOrchestrator,
    ) -> EngineResult<RenewalRecord> {
        let mut record = self
            .renewals
            .get(renewal_id)
            .await?
            .ok_or_else(|| EngineError::not_found("renewal", renewal_id))?;

        if record.status != RenewalStatus::Pending {
            debug!(renewal_id = %record.id, status = %record.status, "Renewal already handled");
            return Ok(record);
        }

        let reason = match self.guard(&record.subscription_id).await {
            Ok(reason) => reason,
            Err(e) => return self.defer(record, e).await,
        };
        let reason = match reason {
            Some(reason) => Some(reason),
            None => match orchestrator.load(&record.certificate_id).await {
                Ok(certificate) if matches!(
                    certificate.status,
                    CertificateStatus::Revoked | CertificateStatus::Replaced
                ) => Some(format!("certificate {}", certificate.status)),
                Ok(_) => None,
                Err(EngineError::NotFound { .. }) => Some("certificate record missing".to_string()),
                Err(e) => return self.defer(record, e).await,
            },
        };
        if let Some(reason) = reason {
            info!(renewal_id = %record.id, reason = %reason, "Renewal skipped");
            record.settle(RenewalStatus::Skipped, Some(reason), self.clock.now());
            self.renewals.save(&record).await?;
            return Ok(record);
        }

        info!(renewal_id = %record.id, domain = %record.domain, "Starting renewal");
        match orchestrator.issue_renewal(&record).await {
            Ok(certificate) if certificate.status == CertificateStatus::Failed => {
                let message = certificate
                    .last_error()
                    .unwrap_or("renewal issuance failed")
                    .to_string();
                record.new_certificate_id = Some(certificate.id.clone());
                self.fail(&mut record, message).await?;
            }
            Ok(certificate) => {
                record.new_certificate_id = Some(certificate.id.clone());
                record.settle(RenewalStatus::InProgress, None, self.clock.now());
                self.renewals.save(&record).await?;
                info!(
                    renewal_id = %record.id,
                    new_certificate_id = %certificate.id,
                    provider = %certificate.provider,
                    "Renewal submitted"
                );
            }
            Err(e) if e.is_transient() => return self.defer(record, e).await,
            Err(e) => self.fail(&mut record, e.to_string()).await?,
        }
        Ok(record)
    }

    /// Push a pending renewal back after a collaborator error.
    ///
    /// The record stays `pending` with a fresh [`Task::Renew`] queued until
    /// [`MAX_RENEWAL_DEFERRALS`], then settles as failed so the lineage can
    /// be scheduled again.
    async fn defer(&self, mut record: RenewalRecord, cause: EngineError) -> EngineResult<RenewalRecord> {
        record.deferrals += 1;
        if record.deferrals > MAX_RENEWAL_DEFERRALS {
            self.fail(&mut record, format!("renewal kept being interrupted: {}", cause))
                .await?;
            return Ok(record);
        }

        let delay = Duration::minutes(RENEWAL_RETRY_DELAY_MINUTES);
        warn!(
            renewal_id = %record.id,
            deferrals = record.deferrals,
            error = %cause,
            retry_in_minutes = RENEWAL_RETRY_DELAY_MINUTES,
            "Renewal interrupted, retrying later"
        );
        self.queue.schedule(
            Task::Renew {
                renewal_id: record.id.clone(),
            },
            delay,
        );
        record.error = Some(cause.to_string());
        record.updated_at = self.clock.now();
        self.renewals.save(&record).await?;
        Ok(record)
    }

    /// Skip the pending renewal of `certificate`, if it has one
    pub async fn cancel_pending(
        &self,
        certificate: &Certificate,
        reason: &str,
    ) -> EngineResult<Option<RenewalRecord>> {
        let Some(mut record) = self
            .renewals
            .find_pending(&certificate.subscription_id, &certificate.domain)
            .await?
        else {
            return Ok(None);
        };
        if record.status != RenewalStatus::Pending || record.certificate_id != certificate.id {
            return Ok(None);
        }

        record.settle(RenewalStatus::Skipped, Some(reason.to_string()), self.clock.now());
        self.renewals.save(&record).await?;
        info!(renewal_id = %record.id, certificate_id = %certificate.id, reason, "Pending renewal cancelled");
        Ok(Some(record))
    }

    /// Settle the renewal that produced `certificate`, if any.
    ///
    /// Returns the record when the certificate's status closed it.
    pub async fn record_outcome(&self, certificate: &Certificate) -> EngineResult<Option<RenewalRecord>> {
        let Some(renewal_id) = certificate.renewal_id.as_ref() else {
            return Ok(None);
        };
        let Some(mut record) = self.renewals.get(renewal_id).await? else {
            warn!(renewal_id = %renewal_id, certificate_id = %certificate.id, "Renewal record missing");
            return Ok(None);
        };
        if !record.status.is_open() {
            return Ok(None);
        }

        match certificate.status {
            CertificateStatus::Issued => {
                record.settle(RenewalStatus::Completed, None, self.clock.now());
                self.renewals.save(&record).await?;
                info!(
                    renewal_id = %record.id,
                    new_certificate_id = %certificate.id,
                    "Renewal completed"
                );
                Ok(Some(record))
            }
            CertificateStatus::Failed => {
                let message = certificate
                    .last_error()
                    .unwrap_or("replacement certificate failed")
                    .to_string();
                self.fail(&mut record, message).await?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Failed renewals are not retried
    async fn fail(&self, record: &mut RenewalRecord, message: String) -> EngineResult<()> {
        error!(renewal_id = %record.id, domain = %record.domain, error = %message, "Renewal failed");
        record.settle(RenewalStatus::Failed, Some(message), self.clock.now());
        self.renewals.save(record).await
    }

    /// Reason to skip, if any
    async fn guard(&self, subscription_id: &SubscriptionId) -> EngineResult<Option<String>> {
        match self.subscriptions.is_active(subscription_id).await {
            Ok(true) => {}
            Ok(false) | Err(EngineError::NotFound { .. }) => {
                return Ok(Some("subscription inactive".to_string()));
            }
            Err(e) => return Err(e),
        }
        if !self.subscriptions.auto_renewal_enabled(subscription_id).await? {
            return Ok(Some("auto-renewal disabled".to_string()));
        }
        Ok(None)
    }
}

impl fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("renew_before_days", &self.renew_before.num_days())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryRenewalStore, MemorySubscriptionDirectory};
    use crate::tasks::MemoryTaskQueue;
    use certmill_common::ProviderKind;

    struct Fixture {
        clock: Arc<ManualClock>,
        subscriptions: Arc<MemorySubscriptionDirectory>,
        renewals: Arc<MemoryRenewalStore>,
        queue: Arc<MemoryTaskQueue>,
        scheduler: RenewalScheduler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let subscriptions = Arc::new(MemorySubscriptionDirectory::new());
        let renewals = Arc::new(MemoryRenewalStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(clock.clone()));
        let scheduler = RenewalScheduler::new(
            subscriptions.clone(),
            renewals.clone(),
            queue.clone(),
            clock.clone(),
            Duration::days(30),
        );
        subscriptions.upsert(SubscriptionId::new("sub_1"), true, true);
        Fixture {
            clock,
            subscriptions,
            renewals,
            queue,
            scheduler,
        }
    }

    fn issued(clock: &ManualClock, valid_days: i64) -> Certificate {
        let now = clock.now();
        let mut cert = Certificate::new(
            SubscriptionId::new("sub_1"),
            "example.com".to_string(),
            IssuanceRequirements::default(),
            ProviderKind::Commercial,
            "csr".to_string(),
            "vault:key".to_string(),
            now,
        );
        cert.mark_issued(now + Duration::days(valid_days), None, None, now);
        cert
    }

    #[tokio::test]
    async fn test_run_at_is_thirty_days_before_expiry() {
        let f = fixture();
        let cert = issued(&f.clock, 90);

        let decision = f.scheduler.schedule_renewal(&cert).await.unwrap();
        let RenewalDecision::Scheduled(record) = decision else {
            panic!("expected a scheduled renewal");
        };
        assert_eq!(record.run_at, f.clock.now() + Duration::days(60));
        assert_eq!(record.status, RenewalStatus::Pending);

        let queued = f.queue.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, record.run_at);
        assert_eq!(queued[0].1, Task::Renew { renewal_id: record.id });
    }

    #[tokio::test]
    async fn test_inside_window_runs_immediately() {
        let f = fixture();
        let cert = issued(&f.clock, 10);
        let RenewalDecision::Scheduled(record) = f.scheduler.schedule_renewal(&cert).await.unwrap() else {
            panic!("expected a scheduled renewal");
        };
        assert_eq!(record.run_at, f.clock.now());
        assert_eq!(f.queue.take_due(f.clock.now()).len(), 1);
    }

    #[tokio::test]
    async fn test_one_open_renewal_per_lineage() {
        let f = fixture();
        let cert = issued(&f.clock, 90);
        assert!(matches!(
            f.scheduler.schedule_renewal(&cert).await.unwrap(),
            RenewalDecision::Scheduled(_)
        ));
        assert!(matches!(
            f.scheduler.schedule_renewal(&cert).await.unwrap(),
            RenewalDecision::Skipped(_)
        ));
        assert_eq!(f.renewals.list().await.unwrap().len(), 1);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_guards_skip_scheduling() {
        let f = fixture();
        let cert = issued(&f.clock, 90);

        f.subscriptions.upsert(SubscriptionId::new("sub_1"), true, false);
        let RenewalDecision::Skipped(reason) = f.scheduler.schedule_renewal(&cert).await.unwrap() else {
            panic!("expected skip");
        };
        assert_eq!(reason, "auto-renewal disabled");

        f.subscriptions.deactivate(&SubscriptionId::new("sub_1"));
        let RenewalDecision::Skipped(reason) = f.scheduler.schedule_renewal(&cert).await.unwrap() else {
            panic!("expected skip");
        };
        assert_eq!(reason, "subscription inactive");
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_requires_expiry() {
        let f = fixture();
        let mut cert = issued(&f.clock, 90);
        cert.expires_at = None;
        assert!(matches!(
            f.scheduler.schedule_renewal(&cert).await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_outcome_closes_renewal() {
        let f = fixture();
        let cert = issued(&f.clock, 90);
        let RenewalDecision::Scheduled(mut record) = f.scheduler.schedule_renewal(&cert).await.unwrap() else {
            panic!("expected a scheduled renewal");
        };
        record.status = RenewalStatus::InProgress;
        f.renewals.save(&record).await.unwrap();

        let mut replacement = issued(&f.clock, 90);
        replacement.renewal_id = Some(record.id.clone());
        replacement.mark_failed("CA rejected the CSR", f.clock.now());

        let closed = f.scheduler.record_outcome(&replacement).await.unwrap().unwrap();
        assert_eq!(closed.status, RenewalStatus::Failed);
        assert_eq!(closed.error.as_deref(), Some("CA rejected the CSR"));

        // Already closed; a second delivery changes nothing
        assert!(f.scheduler.record_outcome(&replacement).await.unwrap().is_none());
    }
}
