//! Provider registry
//!
//! Maps each configured [`ProviderKind`] to its driver and circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use certmill_common::{CircuitBreaker, CircuitBreakerConfig, ProviderKind};
use certmill_config::ProvidersConfig;

use super::{
    AcmeSigner, CertificateProvider, CloudManagedDriver, CommercialCaDriver, FreeAcmeDriver,
    SessionTokenCache, WebhookSigner,
};
use crate::acme::OrderStateMachine;
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};

struct Registered {
    driver: Arc<dyn CertificateProvider>,
    breaker: Arc<CircuitBreaker>,
}

pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Registered>,
    preference: Vec<ProviderKind>,
    breaker_config: CircuitBreakerConfig,
}

impl ProviderRegistry {
    /// Empty registry; providers are added with [`register`](Self::register)
    pub fn new(preference: Vec<ProviderKind>, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            providers: HashMap::new(),
            preference,
            breaker_config,
        }
    }

    /// Build every driver that has a configuration block
    pub fn from_config(
        config: &ProvidersConfig,
        orders: Arc<OrderStateMachine>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let mut registry = Self::new(config.preference.clone(), config.circuit_breaker.clone());

        for kind in ProviderKind::ALL {
            let driver: Option<Arc<dyn CertificateProvider>> = match kind {
                ProviderKind::Commercial => match config.commercial.as_ref() {
                    Some(cfg) => {
                        let ttl = i64::try_from(cfg.session_ttl_secs)
                            .ok()
                            .and_then(chrono::Duration::try_seconds)
                            .ok_or_else(|| {
                                EngineError::Configuration(format!(
                                    "session ttl of {}s is out of range",
                                    cfg.session_ttl_secs
                                ))
                            })?;
                        let tokens = Arc::new(SessionTokenCache::new(ttl, Arc::clone(&clock)));
                        let driver = CommercialCaDriver::new(cfg, tokens)
                            .map_err(|e| EngineError::Configuration(e.to_string()))?;
                        Some(Arc::new(driver))
                    }
                    None => None,
                },
                ProviderKind::Cloud => match config.cloud.as_ref() {
                    Some(cfg) => {
                        let driver = CloudManagedDriver::new(cfg)
                            .map_err(|e| EngineError::Configuration(e.to_string()))?;
                        Some(Arc::new(driver))
                    }
                    None => None,
                },
                ProviderKind::FreeAcme => match config.free_acme.as_ref().filter(|c| c.enabled) {
                    Some(cfg) => {
                        let signer: Option<Arc<dyn AcmeSigner>> = match cfg.signer_url.as_deref() {
                            Some(url) => Some(Arc::new(
                                WebhookSigner::new(url, Duration::from_secs(cfg.signer_timeout_secs))
                                    .map_err(|e| EngineError::Configuration(e.to_string()))?,
                            )),
                            None => None,
                        };
                        Some(Arc::new(FreeAcmeDriver::new(Arc::clone(&orders), signer)))
                    }
                    None => None,
                },
            };

            if let Some(driver) = driver {
                registry.register(driver);
            }
        }

        if registry.providers.is_empty() {
            return Err(EngineError::Configuration(
                "no certificate provider is configured".to_string(),
            ));
        }

        info!(providers = ?registry.configured(), "Certificate providers registered");
        Ok(registry)
    }

    /// Add or replace the driver for its kind
    pub fn register(&mut self, driver: Arc<dyn CertificateProvider>) {
        let kind = driver.kind();
        let breaker = Arc::new(CircuitBreaker::new(self.breaker_config.clone(), kind.as_str()));
        debug!(provider = %kind, "Registering provider");
        self.providers.insert(kind, Registered { driver, breaker });
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn CertificateProvider>> {
        self.providers.get(&kind).map(|r| Arc::clone(&r.driver))
    }

    pub fn breaker(&self, kind: ProviderKind) -> Option<&CircuitBreaker> {
        self.providers.get(&kind).map(|r| r.breaker.as_ref())
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Registered providers in preference order
    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut out: Vec<ProviderKind> = Vec::with_capacity(self.providers.len());
        for kind in &self.preference {
            if self.is_configured(*kind) && !out.contains(kind) {
                out.push(*kind);
            }
        }
        // Registered but missing from the preference list: append in the default order
        for kind in ProviderKind::ALL {
            if self.is_configured(kind) && !out.contains(&kind) {
                out.push(kind);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("configured", &self.configured())
            .finish()
    }
}
