//! Collaborators the engine depends on but does not own
//!
//! Subscription data, durable records, secret storage and task dispatch all
//! live outside the engine. In-memory and filesystem adapters are in
//! [`crate::store`] and [`crate::tasks`].

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use certmill_common::{CertificateId, RenewalId, SubscriptionId};

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::issuance::{Certificate, RenewalRecord};
use crate::tasks::Task;

/// Subscription lookups
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync + Debug {
    /// `Err(NotFound)` for unknown subscriptions
    async fn is_active(&self, subscription_id: &SubscriptionId) -> EngineResult<bool>;

    async fn auto_renewal_enabled(&self, subscription_id: &SubscriptionId) -> EngineResult<bool>;
}

/// Durable certificate records
#[async_trait]
pub trait CertificateRepository: Send + Sync + Debug {
    /// Insert or replace by id
    async fn save(&self, certificate: &Certificate) -> EngineResult<()>;

    async fn get(&self, id: &CertificateId) -> EngineResult<Option<Certificate>>;

    async fn list(&self) -> EngineResult<Vec<Certificate>>;
}

/// Durable renewal records
#[async_trait]
pub trait RenewalRepository: Send + Sync + Debug {
    async fn save(&self, record: &RenewalRecord) -> EngineResult<()>;

    async fn get(&self, id: &RenewalId) -> EngineResult<Option<RenewalRecord>>;

    /// Pending renewal for this lineage, if any
    async fn find_pending(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
    ) -> EngineResult<Option<RenewalRecord>>;

    async fn list(&self) -> EngineResult<Vec<RenewalRecord>>;
}

/// Encryption of private keys at rest
pub trait SecretVault: Send + Sync + Debug {
    /// Seal a secret; the returned string is safe to persist
    fn seal(&self, plaintext: &str) -> EngineResult<String>;

    fn open(&self, sealed: &str) -> EngineResult<String>;
}

/// Delayed, at-least-once task dispatch
pub trait TaskQueue: Send + Sync + Debug {
    fn schedule(&self, task: Task, delay: Duration);

    /// Remove and return every task due at `now`, earliest first
    fn take_due(&self, now: DateTime<Utc>) -> Vec<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every external collaborator the issuance pipeline talks to
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
    pub certificates: Arc<dyn CertificateRepository>,
    pub renewals: Arc<dyn RenewalRepository>,
    pub vault: Arc<dyn SecretVault>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
}
