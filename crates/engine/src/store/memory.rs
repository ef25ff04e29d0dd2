//! In-memory adapters

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use certmill_common::{CertificateId, RenewalId, SubscriptionId};

use crate::error::{EngineError, EngineResult};
use crate::issuance::{Certificate, RenewalRecord};
use crate::ports::{CertificateRepository, RenewalRepository, SecretVault, SubscriptionDirectory};

#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    certificates: DashMap<CertificateId, Certificate>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificateRepository for MemoryCertificateStore {
    async fn save(&self, certificate: &Certificate) -> EngineResult<()> {
        self.certificates.insert(certificate.id.clone(), certificate.clone());
        Ok(())
    }

    async fn get(&self, id: &CertificateId) -> EngineResult<Option<Certificate>> {
        Ok(self.certificates.get(id).map(|c| c.value().clone()))
    }

    async fn list(&self) -> EngineResult<Vec<Certificate>> {
        let mut all: Vec<Certificate> = self.certificates.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRenewalStore {
    records: DashMap<RenewalId, RenewalRecord>,
}

impl MemoryRenewalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RenewalRepository for MemoryRenewalStore {
    async fn save(&self, record: &RenewalRecord) -> EngineResult<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &RenewalId) -> EngineResult<Option<RenewalRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn find_pending(
        &self,
        subscription_id: &SubscriptionId,
        domain: &str,
    ) -> EngineResult<Option<RenewalRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| {
                r.status.is_open()
                    && &r.subscription_id == subscription_id
                    && r.domain == domain
            })
            .map(|r| r.value().clone()))
    }

    async fn list(&self) -> EngineResult<Vec<RenewalRecord>> {
        let mut all: Vec<RenewalRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.run_at);
        Ok(all)
    }
}

/// Holds secrets in process memory and hands out opaque handles.
///
/// For tests and single-process deployments; a restart loses every secret.
#[derive(Debug, Default)]
pub struct MemorySecretVault {
    secrets: DashMap<String, String>,
}

impl MemorySecretVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretVault for MemorySecretVault {
    fn seal(&self, plaintext: &str) -> EngineResult<String> {
        let handle = format!("vault:{}", uuid::Uuid::new_v4().simple());
        self.secrets.insert(handle.clone(), plaintext.to_string());
        Ok(handle)
    }

    fn open(&self, sealed: &str) -> EngineResult<String> {
        self.secrets
            .get(sealed)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::Secret(format!("unknown secret handle '{}'", sealed)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionState {
    pub active: bool,
    pub auto_renewal: bool,
}

/// Subscription directory backed by a map; callers flip state directly
#[derive(Debug, Default)]
pub struct MemorySubscriptionDirectory {
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
}

impl MemorySubscriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, subscription_id: SubscriptionId, active: bool, auto_renewal: bool) {
        debug!(subscription_id = %subscription_id, active, auto_renewal, "Subscription updated");
        self.subscriptions
            .insert(subscription_id, SubscriptionState { active, auto_renewal });
    }

    pub fn deactivate(&self, subscription_id: &SubscriptionId) {
        if let Some(mut state) = self.subscriptions.get_mut(subscription_id) {
            state.active = false;
        }
    }

    fn state(&self, subscription_id: &SubscriptionId) -> EngineResult<SubscriptionState> {
        self.subscriptions
            .get(subscription_id)
            .map(|s| *s.value())
            .ok_or_else(|| EngineError::not_found("subscription", subscription_id))
    }
}

#[async_trait]
impl SubscriptionDirectory for MemorySubscriptionDirectory {
    async fn is_active(&self, subscription_id: &SubscriptionId) -> EngineResult<bool> {
        Ok(self.state(subscription_id)?.active)
    }

    async fn auto_renewal_enabled(&self, subscription_id: &SubscriptionId) -> EngineResult<bool> {
        Ok(self.state(subscription_id)?.auto_renewal)
    }
}
