//! Integration tests for the engine facade driven through the task worker

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use serde_json::Value;

use certmill_common::{CircuitBreakerConfig, PlanTier, ProviderKind, SubscriptionId};
use certmill_config::Config;
use certmill_engine::acme::{ChallengeStatus, ChallengeType, OrderSettings, OrderStatus};
use certmill_engine::crypto::{b64url_encode, dns01_txt_value, eab_sign};
use certmill_engine::providers::{
    CertificateRequest, CreateOutcome, DownloadedCertificate, ProviderResult, RevokeOutcome,
    StatusSnapshot,
};
use certmill_engine::validation::{Dns01Validator, Http01Validator, TxtLookupError, TxtResolver};
use certmill_engine::{
    CertificateEngine, CertificateProvider, CertificateStatus, ChallengeValidator, Clock,
    Collaborators, Identifier, IssuanceRequirements, ManualClock, MemoryCertificateStore,
    MemoryRenewalStore, MemorySecretVault, MemorySubscriptionDirectory, MemoryTaskQueue,
    OrderStateMachine, ProviderRegistry, ProviderStatus, RevocationReason, Task, TaskQueue, Worker,
};

/// Answers every TXT query with the same result
#[derive(Debug)]
struct Zone {
    answer: Mutex<Result<Vec<String>, TxtLookupError>>,
    lookups: AtomicUsize,
}

impl Zone {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Err(TxtLookupError::NoRecords("_acme-challenge".to_string()))),
            lookups: AtomicUsize::new(0),
        })
    }

    fn answer(&self, answer: Result<Vec<String>, TxtLookupError>) {
        *self.answer.lock() = answer;
    }
}

#[async_trait]
impl TxtResolver for Zone {
    async fn lookup_txt(&self, _name: &str) -> Result<Vec<String>, TxtLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().clone()
    }
}

/// Accepts every order; reports issued on the first status check
#[derive(Debug)]
struct InstantCa {
    clock: Arc<ManualClock>,
}

#[async_trait]
impl CertificateProvider for InstantCa {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Commercial
    }

    async fn create_certificate(&self, _request: &CertificateRequest) -> CreateOutcome {
        CreateOutcome::created("B40001", ProviderStatus::Pending, Value::Null)
    }

    async fn get_certificate_status(&self, _certificate_id: &str) -> ProviderResult<StatusSnapshot> {
        Ok(StatusSnapshot {
            status: ProviderStatus::Issued,
            expires_at: Some(self.clock.now() + Duration::days(365)),
            provider_data: Value::Null,
        })
    }

    async fn download_certificate(&self, _certificate_id: &str) -> ProviderResult<Option<DownloadedCertificate>> {
        Ok(None)
    }

    async fn revoke_certificate(&self, _certificate_id: &str, _reason: RevocationReason) -> RevokeOutcome {
        RevokeOutcome::ok()
    }
}

struct Setup {
    clock: Arc<ManualClock>,
    zone: Arc<Zone>,
    subscriptions: Arc<MemorySubscriptionDirectory>,
    queue: Arc<MemoryTaskQueue>,
    engine: Arc<CertificateEngine>,
    worker: Worker,
}

fn setup() -> Setup {
    let config = Config::default();
    let clock = Arc::new(ManualClock::starting_now());
    let zone = Zone::new();

    let orders = Arc::new(OrderStateMachine::new(
        OrderSettings::default(),
        "nP1qzpXGymHBrUEepNY9HCsQk7K8KhOypzEt62jcerQ",
        clock.clone(),
    ));
    let mut registry = ProviderRegistry::new(vec![ProviderKind::Commercial], CircuitBreakerConfig::default());
    registry.register(Arc::new(InstantCa { clock: clock.clone() }));

    let http = Http01Validator::new(StdDuration::from_secs(1), 1, StdDuration::from_millis(10), 80).unwrap();
    let validator = ChallengeValidator::new(http, Dns01Validator::new(zone.clone()));

    let subscriptions = Arc::new(MemorySubscriptionDirectory::new());
    let queue = Arc::new(MemoryTaskQueue::new(clock.clone()));
    let ports = Collaborators {
        subscriptions: subscriptions.clone(),
        certificates: Arc::new(MemoryCertificateStore::new()),
        renewals: Arc::new(MemoryRenewalStore::new()),
        vault: Arc::new(MemorySecretVault::new()),
        queue: queue.clone(),
        clock: clock.clone(),
    };

    let engine = Arc::new(CertificateEngine::assemble(&config, orders, registry, validator, ports).unwrap());
    let worker = Worker::new(Arc::clone(&engine));
    Setup {
        clock,
        zone,
        subscriptions,
        queue,
        engine,
        worker,
    }
}

// ============================================================================
// Challenge validation through the worker
// ============================================================================

#[tokio::test]
async fn test_dns01_response_readies_order() {
    let s = setup();
    let order = s
        .engine
        .create_order(vec![Identifier::dns("example.com")], None)
        .unwrap();
    let dns = s
        .engine
        .orders()
        .challenges_for_order(&order.id)
        .unwrap()
        .into_iter()
        .find(|c| c.kind == ChallengeType::Dns01)
        .unwrap();
    s.zone.answer(Ok(vec![dns01_txt_value(&dns.key_authorization)]));

    s.engine.respond_to_challenge(&dns.id).unwrap();
    let report = s.worker.run_once().await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.failed, 0);

    let order = s.engine.orders().get_order(&order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Ready);

    // Settled challenges cannot be responded to again
    assert!(s.engine.respond_to_challenge(&dns.id).is_err());
}

#[tokio::test]
async fn test_wrong_txt_value_invalidates_challenge_only() {
    let s = setup();
    let order = s
        .engine
        .create_order(vec![Identifier::dns("example.com")], None)
        .unwrap();
    let dns = s
        .engine
        .orders()
        .challenges_for_order(&order.id)
        .unwrap()
        .into_iter()
        .find(|c| c.kind == ChallengeType::Dns01)
        .unwrap();
    s.zone.answer(Ok(vec!["stale-value".to_string()]));

    s.engine.respond_to_challenge(&dns.id).unwrap();
    s.worker.run_once().await;

    let challenge = s.engine.orders().get_challenge(&dns.id).unwrap();
    assert_eq!(challenge.status, ChallengeStatus::Invalid);
    // The HTTP-01 sibling can still satisfy the authorization
    let order = s.engine.orders().get_order(&order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_inconclusive_lookups_are_redispatched_then_fail() {
    let s = setup();
    let order = s
        .engine
        .create_order(vec![Identifier::dns("example.com")], None)
        .unwrap();
    let dns = s
        .engine
        .orders()
        .challenges_for_order(&order.id)
        .unwrap()
        .into_iter()
        .find(|c| c.kind == ChallengeType::Dns01)
        .unwrap();
    s.zone.answer(Err(TxtLookupError::Failed {
        name: "_acme-challenge.example.com".to_string(),
        message: "SERVFAIL".to_string(),
    }));

    s.engine.respond_to_challenge(&dns.id).unwrap();
    assert_eq!(s.worker.run_once().await.dispatched, 1);
    assert_eq!(
        s.engine.orders().get_challenge(&dns.id).unwrap().status,
        ChallengeStatus::Pending
    );

    // Redispatches wait before running
    assert_eq!(s.worker.run_once().await.dispatched, 0);
    for _ in 0..2 {
        s.clock.advance(Duration::seconds(30));
        assert_eq!(s.worker.run_once().await.dispatched, 1);
    }

    assert_eq!(s.zone.lookups.load(Ordering::SeqCst), 3);
    assert_eq!(
        s.engine.orders().get_challenge(&dns.id).unwrap().status,
        ChallengeStatus::Invalid
    );
    assert!(s.queue.is_empty());
}

#[tokio::test]
async fn test_worker_expires_stale_orders() {
    let s = setup();
    let order = s
        .engine
        .create_order(vec![Identifier::dns("example.com")], None)
        .unwrap();

    s.clock.advance(Duration::days(8));
    let report = s.worker.run_once().await;
    assert!(report.expired_orders >= 1);
    assert_eq!(
        s.engine.orders().get_order(&order.id).unwrap().status,
        OrderStatus::Invalid
    );
}

// ============================================================================
// Issuance through the worker
// ============================================================================

#[tokio::test]
async fn test_poll_task_completes_issuance() {
    let s = setup();
    let subscription = SubscriptionId::new("sub-worker");
    s.subscriptions.upsert(subscription.clone(), true, true);

    let certificate = s
        .engine
        .issue_certificate(&subscription, "Shop.Example.com", IssuanceRequirements::default())
        .await
        .unwrap();
    assert_eq!(certificate.domain, "shop.example.com");
    assert_eq!(certificate.status, CertificateStatus::PendingValidation);

    // Nothing is due before the poll interval
    assert_eq!(s.worker.run_once().await.dispatched, 0);

    s.clock.advance(Duration::minutes(5));
    let report = s.worker.run_once().await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.failed, 0);

    let status = s.engine.get_certificate_status(&certificate.id).await.unwrap();
    assert_eq!(status.status, CertificateStatus::Issued);
    assert!(s
        .queue
        .snapshot()
        .iter()
        .any(|(_, task)| matches!(task, Task::Renew { .. })));

    let statuses = s
        .engine
        .get_certificate_statuses(&[certificate.id.clone()])
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, CertificateStatus::Issued);
}

#[tokio::test]
async fn test_shutdown_stops_worker_loop() {
    let s = setup();
    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let worker = Worker::new(Arc::clone(&s.engine)).with_tick(StdDuration::from_millis(10));

    let handle = tokio::spawn(async move { worker.run(rx).await });
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    tx.send(()).unwrap();

    tokio::time::timeout(StdDuration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// External account binding
// ============================================================================

#[tokio::test]
async fn test_eab_quota_and_binding() {
    let s = setup();
    let subscription = SubscriptionId::new("sub-eab");

    let first = s
        .engine
        .create_eab_credential(&subscription, PlanTier::Basic)
        .unwrap();
    s.engine
        .create_eab_credential(&subscription, PlanTier::Basic)
        .unwrap();
    assert!(s
        .engine
        .create_eab_credential(&subscription, PlanTier::Basic)
        .is_err());

    let protected = b64url_encode(br#"{"alg":"HS256","kid":"k"}"#);
    let payload = b64url_encode(br#"{"kty":"EC"}"#);
    let signature = eab_sign(&first.mac_key, &protected, &payload).unwrap();

    let used = s
        .engine
        .verify_eab_binding(&first.credential.mac_id, &protected, &payload, &signature)
        .unwrap();
    assert_eq!(used.usage_count, 1);
    assert!(used.last_used_at.is_some());

    let revoked = s
        .engine
        .revoke_eab_credential(&first.credential.mac_id)
        .unwrap();
    assert!(!revoked.is_active);
    assert!(s
        .engine
        .verify_eab_binding(&first.credential.mac_id, &protected, &payload, &signature)
        .is_err());

    // Revocation frees a slot
    assert!(s
        .engine
        .create_eab_credential(&subscription, PlanTier::Basic)
        .is_ok());
}
