//! External account binding credentials
//!
//! A subscription holds a bounded number of active MAC credentials. New
//! ACME accounts prove they belong to the subscription by signing the
//! account key with one of them. Revocation is permanent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use certmill_common::{EabQuotas, MacId, PlanTier, SubscriptionId};

use crate::clock::Clock;
use crate::crypto;
use crate::error::{CryptoError, EngineError, EngineResult};

/// Public view of a credential; never contains the MAC key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EabCredential {
    pub mac_id: MacId,
    pub subscription_id: SubscriptionId,
    pub is_active: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Freshly created credential. The MAC key is only ever returned here.
#[derive(Clone, Serialize)]
pub struct IssuedEabCredential {
    pub credential: EabCredential,
    /// base64url, 256-bit
    pub mac_key: String,
}

impl std::fmt::Debug for IssuedEabCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedEabCredential")
            .field("credential", &self.credential)
            .field("mac_key", &"<redacted>")
            .finish()
    }
}

struct CredentialEntry {
    mac_id: MacId,
    mac_key: String,
    subscription_id: SubscriptionId,
    active: AtomicBool,
    usage_count: AtomicU64,
    last_used_at: RwLock<Option<DateTime<Utc>>>,
    created_at: DateTime<Utc>,
    revoked_at: RwLock<Option<DateTime<Utc>>>,
}

impl CredentialEntry {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> EabCredential {
        EabCredential {
            mac_id: self.mac_id.clone(),
            subscription_id: self.subscription_id.clone(),
            is_active: self.is_active(),
            usage_count: self.usage_count.load(Ordering::Relaxed),
            last_used_at: *self.last_used_at.read(),
            created_at: self.created_at,
            revoked_at: *self.revoked_at.read(),
        }
    }
}

/// Registry of EAB credentials across subscriptions
pub struct EabRegistry {
    entries: DashMap<MacId, Arc<CredentialEntry>>,
    quotas: EabQuotas,
    /// Serializes quota check and insert
    create_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl EabRegistry {
    pub fn new(quotas: EabQuotas, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            quotas,
            create_lock: Mutex::new(()),
            clock,
        }
    }

    /// Create a credential if the subscription's plan has room for one
    pub fn create(&self, subscription_id: &SubscriptionId, tier: PlanTier) -> EngineResult<IssuedEabCredential> {
        let _guard = self.create_lock.lock();

        let active = self.active_count(subscription_id);
        if !self.quotas.allows(tier, active) {
            let limit = self.quotas.limit_for(tier);
            warn!(
                subscription_id = %subscription_id,
                tier = %tier,
                active,
                limit,
                "EAB credential quota exceeded"
            );
            return Err(EngineError::QuotaExceeded {
                subscription: subscription_id.to_string(),
                tier,
                limit,
            });
        }

        let entry = Arc::new(CredentialEntry {
            mac_id: MacId::generate(),
            mac_key: crypto::generate_mac_key(),
            subscription_id: subscription_id.clone(),
            active: AtomicBool::new(true),
            usage_count: AtomicU64::new(0),
            last_used_at: RwLock::new(None),
            created_at: self.clock.now(),
            revoked_at: RwLock::new(None),
        });
        self.entries.insert(entry.mac_id.clone(), Arc::clone(&entry));

        info!(
            subscription_id = %subscription_id,
            mac_id = %entry.mac_id,
            active = active + 1,
            "Created EAB credential"
        );
        Ok(IssuedEabCredential {
            credential: entry.snapshot(),
            mac_key: entry.mac_key.clone(),
        })
    }

    /// Revoke a credential. Revoking twice is a no-op.
    pub fn revoke(&self, mac_id: &MacId) -> EngineResult<EabCredential> {
        let entry = self.entry(mac_id)?;
        if entry.active.swap(false, Ordering::AcqRel) {
            *entry.revoked_at.write() = Some(self.clock.now());
            info!(mac_id = %mac_id, subscription_id = %entry.subscription_id, "Revoked EAB credential");
        } else {
            debug!(mac_id = %mac_id, "EAB credential already revoked");
        }
        Ok(entry.snapshot())
    }

    /// Verify an account binding signed with `mac_id`'s key and count the use
    pub fn verify_binding(
        &self,
        mac_id: &MacId,
        protected_b64: &str,
        payload_b64: &str,
        signature_b64: &str,
    ) -> EngineResult<EabCredential> {
        let entry = self.entry(mac_id)?;
        if !entry.is_active() {
            warn!(mac_id = %mac_id, "Account binding attempted with revoked EAB credential");
            return Err(EngineError::CredentialRevoked(mac_id.to_string()));
        }

        crypto::eab_verify(&entry.mac_key, protected_b64, payload_b64, signature_b64).map_err(|e| {
            if e == CryptoError::SignatureMismatch {
                warn!(mac_id = %mac_id, "EAB binding signature mismatch");
            }
            EngineError::Crypto(e)
        })?;

        let uses = entry.usage_count.fetch_add(1, Ordering::AcqRel) + 1;
        *entry.last_used_at.write() = Some(self.clock.now());
        debug!(mac_id = %mac_id, usage_count = uses, "Verified EAB binding");
        Ok(entry.snapshot())
    }

    pub fn get(&self, mac_id: &MacId) -> Option<EabCredential> {
        self.entries.get(mac_id).map(|e| e.value().snapshot())
    }

    /// All credentials of a subscription, oldest first
    pub fn list(&self, subscription_id: &SubscriptionId) -> Vec<EabCredential> {
        let mut out: Vec<EabCredential> = self
            .entries
            .iter()
            .filter(|e| &e.value().subscription_id == subscription_id)
            .map(|e| e.value().snapshot())
            .collect();
        out.sort_by_key(|c| c.created_at);
        out
    }

    pub fn active_count(&self, subscription_id: &SubscriptionId) -> u32 {
        let count = self
            .entries
            .iter()
            .filter(|e| &e.value().subscription_id == subscription_id && e.value().is_active())
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn entry(&self, mac_id: &MacId) -> EngineResult<Arc<CredentialEntry>> {
        self.entries
            .get(mac_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::not_found("EAB credential", mac_id))
    }
}

impl std::fmt::Debug for EabRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EabRegistry")
            .field("credentials", &self.entries.len())
            .field("quotas", &self.quotas)
            .finish()
    }
}
