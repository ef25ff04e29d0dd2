//! Engine facade
//!
//! [`CertificateEngine`] owns the order machinery, the challenge validator,
//! the EAB registry and the issuance orchestrator, and is the only surface
//! callers and the [`Worker`](crate::worker::Worker) talk to.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use certmill_common::{CertificateId, ChallengeId, MacId, PlanTier, RenewalId, SubscriptionId};
use certmill_config::Config;

use crate::acme::{
    Challenge, ChallengeStatus, EabCredential, EabRegistry, Identifier, IssuedEabCredential, Order,
    OrderSettings, OrderStateMachine,
};
use crate::clock::{Clock, SystemClock};
use crate::crypto::AccountKey;
use crate::domain;
use crate::error::{EngineError, EngineResult};
use crate::issuance::{
    Certificate, IssuanceOrchestrator, IssuanceSettings, PollOutcome, RecoveryReport, RenewalRecord,
    StatusReport,
};
use crate::ports::{Collaborators, SubscriptionDirectory};
use crate::providers::{ProviderRegistry, RevocationReason, RevokeOutcome};
use crate::selector::{IssuanceRequirements, ProviderSelector};
use crate::store::{FileCertificateStore, FileSecretVault};
use crate::tasks::{MemoryTaskQueue, PollTask, Task};
use crate::validation::{ChallengeValidator, ValidationOutcome};

/// Validation dispatches per challenge before an inconclusive check counts as a failure
pub const MAX_VALIDATION_DISPATCHES: u32 = 3;

/// Delay between validation dispatches after an inconclusive check
const VALIDATION_REDISPATCH_DELAY_SECS: i64 = 30;

pub struct CertificateEngine {
    orders: Arc<OrderStateMachine>,
    validator: ChallengeValidator,
    eab: EabRegistry,
    orchestrator: IssuanceOrchestrator,
}

impl CertificateEngine {
    /// Assemble an engine from already built components
    pub fn new(
        orders: Arc<OrderStateMachine>,
        validator: ChallengeValidator,
        eab: EabRegistry,
        orchestrator: IssuanceOrchestrator,
    ) -> Self {
        Self {
            orders,
            validator,
            eab,
            orchestrator,
        }
    }

    /// Build an engine from configuration.
    ///
    /// Records, sealed keys and the account key are kept under
    /// `engine.data-dir`. Tasks live in process memory; call
    /// [`recover`](Self::recover) after a restart to queue them again.
    pub fn from_config(config: &Config, subscriptions: Arc<dyn SubscriptionDirectory>) -> EngineResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(FileCertificateStore::new(&config.engine.data_dir)?);
        let vault = Arc::new(FileSecretVault::new(&config.engine.data_dir)?);
        let account_key = load_or_create_account_key(&store)?;

        let orders = Arc::new(OrderStateMachine::new(
            OrderSettings::try_from(&config.orders)?,
            account_key.thumbprint(),
            Arc::clone(&clock),
        ));
        let registry = ProviderRegistry::from_config(&config.providers, Arc::clone(&orders), Arc::clone(&clock))?;
        let validator = ChallengeValidator::from_config(&config.validation)?;

        let ports = Collaborators {
            subscriptions,
            certificates: store.clone(),
            renewals: store,
            vault,
            queue: Arc::new(MemoryTaskQueue::new(Arc::clone(&clock))),
            clock: Arc::clone(&clock),
        };

        let engine = Self::assemble(config, orders, registry, validator, ports)?;
        info!(
            providers = ?engine.orchestrator.selector().registry().configured(),
            data_dir = %config.engine.data_dir.display(),
            "Certificate engine ready"
        );
        Ok(engine)
    }

    /// Wire the components with configured timings
    pub fn assemble(
        config: &Config,
        orders: Arc<OrderStateMachine>,
        registry: ProviderRegistry,
        validator: ChallengeValidator,
        ports: Collaborators,
    ) -> EngineResult<Self> {
        let settings = IssuanceSettings::from_config(&config.polling, &config.renewal)?;
        let eab = EabRegistry::new(config.eab.clone(), Arc::clone(&ports.clock));
        let orchestrator = IssuanceOrchestrator::new(
            ProviderSelector::new(Arc::new(registry)),
            Arc::clone(&orders),
            ports,
            settings,
        );
        Ok(Self::new(orders, validator, eab, orchestrator))
    }

    pub fn orders(&self) -> &Arc<OrderStateMachine> {
        &self.orders
    }

    pub fn orchestrator(&self) -> &IssuanceOrchestrator {
        &self.orchestrator
    }

    pub fn ports(&self) -> &Collaborators {
        self.orchestrator.ports()
    }

    pub fn eab(&self) -> &EabRegistry {
        &self.eab
    }

    // =========================================================================
    // Orders and challenges
    // =========================================================================

    pub fn create_order(&self, identifiers: Vec<Identifier>, profile: Option<String>) -> EngineResult<Order> {
        self.orders.create_order(identifiers, profile)
    }

    pub fn record_challenge_result(&self, challenge_id: &ChallengeId, valid: bool) -> EngineResult<Order> {
        self.orders.record_challenge_result(challenge_id, valid)
    }

    /// Client signals the challenge is in place; validation is queued
    pub fn respond_to_challenge(&self, challenge_id: &ChallengeId) -> EngineResult<Challenge> {
        let challenge = self
            .orders
            .get_challenge(challenge_id)
            .ok_or_else(|| EngineError::not_found("challenge", challenge_id))?;
        if challenge.status.is_terminal() {
            return Err(EngineError::invalid_state(
                "challenge",
                challenge_id,
                "challenge has already been validated",
            ));
        }

        self.ports().queue.schedule(
            Task::ValidateChallenge {
                challenge_id: challenge_id.clone(),
                attempt: 1,
            },
            Duration::zero(),
        );
        debug!(challenge_id = %challenge_id, challenge_type = %challenge.kind, "Challenge validation queued");
        Ok(challenge)
    }

    /// Run one validation of a challenge.
    ///
    /// Definitive outcomes are recorded on the challenge. Inconclusive ones
    /// are dispatched again until [`MAX_VALIDATION_DISPATCHES`], after which
    /// the challenge is recorded invalid.
    pub async fn validate_challenge(
        &self,
        challenge_id: &ChallengeId,
        attempt: u32,
    ) -> EngineResult<ValidationOutcome> {
        let (challenge, identifier) = self.orders.challenge_with_identifier(challenge_id)?;
        if challenge.status.is_terminal() {
            debug!(challenge_id = %challenge_id, "Challenge already settled, validation skipped");
            return Ok(match challenge.status {
                ChallengeStatus::Valid => ValidationOutcome::valid("challenge already valid", 0),
                _ => ValidationOutcome::invalid("challenge already invalid", 0),
            });
        }

        let domain = domain::base_domain(&identifier.value);
        let outcome = self
            .validator
            .validate(challenge.kind, domain, &challenge.token, &challenge.key_authorization)
            .await;

        if outcome.is_definitive() {
            self.orders.record_challenge_outcome(
                challenge_id,
                outcome.is_valid(),
                Some(outcome.detail.clone()),
            )?;
        } else if attempt < MAX_VALIDATION_DISPATCHES {
            debug!(
                challenge_id = %challenge_id,
                attempt,
                detail = %outcome.detail,
                "Validation inconclusive, dispatching again"
            );
            self.ports().queue.schedule(
                Task::ValidateChallenge {
                    challenge_id: challenge_id.clone(),
                    attempt: attempt + 1,
                },
                Duration::seconds(VALIDATION_REDISPATCH_DELAY_SECS),
            );
        } else {
            warn!(
                challenge_id = %challenge_id,
                attempts = attempt,
                detail = %outcome.detail,
                "Validation never became definitive"
            );
            self.orders
                .record_challenge_outcome(challenge_id, false, Some(outcome.detail.clone()))?;
        }
        Ok(outcome)
    }

    /// Queue the follow-up work of records left in flight by a restart
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        self.orchestrator.recover().await
    }

    /// Invalidate orders and authorizations past their deadline
    pub fn expire_stale_orders(&self) -> usize {
        self.orders.expire_stale()
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    pub async fn issue_certificate(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
        requirements: IssuanceRequirements,
    ) -> EngineResult<Certificate> {
        self.orchestrator
            .issue_certificate(subscription_id, domain, requirements)
            .await
    }

    pub async fn get_certificate_status(&self, certificate_id: &CertificateId) -> EngineResult<StatusReport> {
        self.orchestrator.get_certificate_status(certificate_id).await
    }

    pub async fn get_certificate_statuses(&self, certificate_ids: &[CertificateId]) -> EngineResult<Vec<StatusReport>> {
        self.orchestrator.get_certificate_statuses(certificate_ids).await
    }

    pub async fn revoke_certificate(
        &self,
        certificate_id: &CertificateId,
        reason: RevocationReason,
    ) -> EngineResult<RevokeOutcome> {
        self.orchestrator.revoke_certificate(certificate_id, reason).await
    }

    pub async fn poll_certificate(&self, task: PollTask) -> EngineResult<PollOutcome> {
        self.orchestrator.poll(task).await
    }

    pub async fn run_renewal(&self, renewal_id: &RenewalId) -> EngineResult<RenewalRecord> {
        self.orchestrator
            .renewals()
            .run_renewal(renewal_id, &self.orchestrator)
            .await
    }

    // =========================================================================
    // External account binding
    // =========================================================================

    pub fn create_eab_credential(
        &self,
        subscription_id: &SubscriptionId,
        tier: PlanTier,
    ) -> EngineResult<IssuedEabCredential> {
        self.eab.create(subscription_id, tier)
    }

    pub fn revoke_eab_credential(&self, mac_id: &MacId) -> EngineResult<EabCredential> {
        self.eab.revoke(mac_id)
    }

    pub fn verify_eab_binding(
        &self,
        mac_id: &MacId,
        protected_b64: &str,
        payload_b64: &str,
        signature_b64: &str,
    ) -> EngineResult<EabCredential> {
        self.eab
            .verify_binding(mac_id, protected_b64, payload_b64, signature_b64)
    }

    // =========================================================================
    // Task dispatch
    // =========================================================================

    /// Execute one dispatched task
    pub async fn dispatch(&self, task: Task) -> EngineResult<()> {
        match task {
            Task::ValidateChallenge { challenge_id, attempt } => {
                self.validate_challenge(&challenge_id, attempt).await?;
            }
            Task::PollCertificate(poll) => {
                self.poll_certificate(poll).await?;
            }
            Task::Renew { renewal_id } => {
                self.run_renewal(&renewal_id).await?;
            }
        }
        Ok(())
    }
}

/// Reuse the stored ACME account key, generating one on first start
fn load_or_create_account_key(store: &FileCertificateStore) -> EngineResult<AccountKey> {
    if let Some(pem) = store.load_account_key()? {
        let key = AccountKey::from_pem(&pem)?;
        debug!(thumbprint = %key.thumbprint(), "Loaded ACME account key");
        return Ok(key);
    }
    let key = AccountKey::generate()?;
    store.save_account_key(&key.private_key_pem())?;
    info!(thumbprint = %key.thumbprint(), "Generated ACME account key");
    Ok(key)
}

impl std::fmt::Debug for CertificateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEngine")
            .field("orders", &self.orders.len())
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
