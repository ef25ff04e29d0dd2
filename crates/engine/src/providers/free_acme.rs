//! Self-hosted ACME driver
//!
//! Orders placed through this driver live in the engine's own
//! [`OrderStateMachine`]. Challenges are validated by the engine's worker;
//! once an order is `ready`, a status poll finalizes it through the
//! configured [`AcmeSigner`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use certmill_common::{OrderId, ProviderKind};

use super::{
    CertificateProvider, CertificateRequest, CreateOutcome, DownloadedCertificate, ProviderError,
    ProviderResult, ProviderStatus, RevocationReason, RevokeOutcome, StatusSnapshot,
};
use crate::acme::{ChallengeType, Identifier, Order, OrderStateMachine, OrderStatus};
use crate::validation::{challenge_record_fqdn, ACME_CHALLENGE_PREFIX};

/// Output of a signer
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// Leaf followed by any intermediates
    pub chain_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// Turns a finalized order's CSR into a certificate chain
#[async_trait]
pub trait AcmeSigner: Send + Sync + std::fmt::Debug {
    async fn sign(&self, order: &Order, csr_pem: &str) -> ProviderResult<SignedCertificate>;
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    #[serde(alias = "certificate_pem")]
    certificate: String,
    #[serde(default, alias = "ca_bundle_pem")]
    ca_bundle: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Signer reached over HTTP: `POST {url}` with the CSR, answered with the chain
#[derive(Debug)]
pub struct WebhookSigner {
    client: Client,
    url: String,
}

impl WebhookSigner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// `notAfter` of the first certificate in a PEM chain
pub(crate) fn certificate_not_after(chain_pem: &str) -> Option<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes()).ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents).ok()?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}

#[async_trait]
impl AcmeSigner for WebhookSigner {
    async fn sign(&self, order: &Order, csr_pem: &str) -> ProviderResult<SignedCertificate> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "order_id": order.id,
                "domains": order.domains(),
                "csr": csr_pem,
            }))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let signed: SignerResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse signer response: {}", e)))?;

        let expires_at = signed
            .expires_at
            .or_else(|| certificate_not_after(&signed.certificate))
            .ok_or_else(|| ProviderError::InvalidResponse("signer returned no expiry and an unparsable certificate".to_string()))?;

        let mut chain_pem = signed.certificate;
        if let Some(bundle) = signed.ca_bundle.filter(|b| !b.trim().is_empty()) {
            if !chain_pem.ends_with('\n') {
                chain_pem.push('\n');
            }
            chain_pem.push_str(&bundle);
        }

        Ok(SignedCertificate {
            chain_pem,
            expires_at,
        })
    }
}

#[derive(Debug)]
pub struct FreeAcmeDriver {
    orders: Arc<OrderStateMachine>,
    signer: Option<Arc<dyn AcmeSigner>>,
}

impl FreeAcmeDriver {
    pub fn new(orders: Arc<OrderStateMachine>, signer: Option<Arc<dyn AcmeSigner>>) -> Self {
        if signer.is_none() {
            warn!(provider = "free-acme", "No signer configured; ready orders will not be finalized");
        }
        Self { orders, signer }
    }

    fn state_error(e: crate::error::EngineError) -> ProviderError {
        ProviderError::State(e.to_string())
    }

    /// Challenge material the subscriber has to publish
    fn challenge_data(&self, order: &Order) -> ProviderResult<Value> {
        let authorizations = self.orders.authorizations(&order.id).map_err(Self::state_error)?;
        let challenges = self.orders.challenges_for_order(&order.id).map_err(Self::state_error)?;

        let authorizations: Vec<Value> = authorizations
            .iter()
            .map(|authz| {
                let entries: Vec<Value> = challenges
                    .iter()
                    .filter(|c| c.authorization_id == authz.id)
                    .map(|c| match c.kind {
                        ChallengeType::Http01 => json!({
                            "id": c.id,
                            "type": c.kind,
                            "token": c.token,
                            "path": format!("{}{}", ACME_CHALLENGE_PREFIX, c.token),
                            "content": c.key_authorization,
                        }),
                        ChallengeType::Dns01 => json!({
                            "id": c.id,
                            "type": c.kind,
                            "token": c.token,
                            "record": challenge_record_fqdn(&authz.identifier.value),
                            "value": crate::crypto::dns01_txt_value(&c.key_authorization),
                        }),
                    })
                    .collect();
                json!({
                    "id": authz.id,
                    "identifier": authz.identifier,
                    "expires_at": authz.expires_at,
                    "challenges": entries,
                })
            })
            .collect();

        Ok(json!({
            "order_id": order.id,
            "expires_at": order.expires_at,
            "authorizations": authorizations,
        }))
    }

    fn snapshot(order: &Order) -> StatusSnapshot {
        let status = match order.status {
            OrderStatus::Pending => ProviderStatus::Pending,
            OrderStatus::Ready | OrderStatus::Processing => ProviderStatus::Processing,
            OrderStatus::Valid => ProviderStatus::Issued,
            OrderStatus::Invalid => ProviderStatus::Failed,
        };
        StatusSnapshot {
            status,
            expires_at: order.certificate_expires_at,
            provider_data: json!({
                "order_id": order.id,
                "order_status": order.status,
                "error": order.error,
            }),
        }
    }

    fn current(&self, order_id: &OrderId) -> ProviderResult<Order> {
        self.orders
            .get_order(order_id)
            .ok_or_else(|| ProviderError::State(format!("unknown order '{}'", order_id)))
    }

    /// Move a ready order through processing to valid
    async fn finalize(&self, order: Order) -> ProviderResult<Order> {
        if order.status == OrderStatus::Ready {
            if let Err(e) = self.orders.mark_processing(&order.id) {
                // Another poller got there first
                debug!(order_id = %order.id, error = %e, "Order already left ready");
                return self.current(&order.id);
            }
        }

        let Some(signer) = self.signer.as_ref() else {
            debug!(order_id = %order.id, "Order waiting for a signer");
            return self.current(&order.id);
        };

        let Some(csr_pem) = order.csr_pem.clone() else {
            return self
                .orders
                .mark_invalid(&order.id, "order has no CSR to finalize with")
                .map_err(Self::state_error);
        };

        match signer.sign(&order, &csr_pem).await {
            Ok(signed) => match self.orders.mark_valid(&order.id, signed.chain_pem, signed.expires_at) {
                Ok(order) => {
                    info!(
                        provider = "free-acme",
                        order_id = %order.id,
                        expires_at = %signed.expires_at,
                        "Order finalized"
                    );
                    Ok(order)
                }
                Err(e) => {
                    debug!(order_id = %order.id, error = %e, "Order finalized concurrently");
                    self.current(&order.id)
                }
            },
            Err(e) if e.is_rejection() => {
                warn!(provider = "free-acme", order_id = %order.id, error = %e, "Signer rejected order");
                self.orders
                    .mark_invalid(&order.id, format!("signer rejected order: {}", e))
                    .map_err(Self::state_error)
            }
            Err(e) => {
                warn!(provider = "free-acme", order_id = %order.id, error = %e, "Signer unavailable, will retry on next poll");
                self.current(&order.id)
            }
        }
    }
}

#[async_trait]
impl CertificateProvider for FreeAcmeDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::FreeAcme
    }

    async fn create_certificate(&self, request: &CertificateRequest) -> CreateOutcome {
        let identifiers: Vec<Identifier> = request.domains.iter().map(Identifier::dns).collect();
        let order = match self
            .orders
            .create_order(identifiers, Some(request.validation_level.as_str().to_string()))
        {
            Ok(order) => order,
            Err(e) => {
                warn!(provider = "free-acme", domain = %request.primary_domain(), error = %e, "Order rejected");
                return CreateOutcome::failed(e.to_string());
            }
        };

        if let Err(e) = self.orders.attach_csr(&order.id, &request.csr_pem) {
            self.orders.archive(&order.id);
            return CreateOutcome::failed(e.to_string());
        }

        match self.challenge_data(&order) {
            Ok(data) => CreateOutcome::created(order.id.to_string(), ProviderStatus::Pending, data),
            Err(e) => CreateOutcome::failed(e.to_string()),
        }
    }

    async fn get_certificate_status(&self, certificate_id: &str) -> ProviderResult<StatusSnapshot> {
        self.orders.expire_stale();
        let order = self.current(&OrderId::new(certificate_id))?;

        let order = match order.status {
            OrderStatus::Ready | OrderStatus::Processing => self.finalize(order).await?,
            _ => order,
        };
        Ok(Self::snapshot(&order))
    }

    async fn download_certificate(&self, certificate_id: &str) -> ProviderResult<Option<DownloadedCertificate>> {
        let order = self.current(&OrderId::new(certificate_id))?;
        match (order.status, order.certificate_pem) {
            (OrderStatus::Valid, Some(chain)) => Ok(Some(DownloadedCertificate {
                certificate_pem: chain,
                ca_bundle_pem: None,
            })),
            (status, _) => Err(ProviderError::State(format!(
                "order '{}' is {}, no certificate to download",
                order.id, status
            ))),
        }
    }

    async fn revoke_certificate(&self, certificate_id: &str, reason: RevocationReason) -> RevokeOutcome {
        match self.orders.archive(&OrderId::new(certificate_id)) {
            Some(order) => {
                info!(provider = "free-acme", order_id = %order.id, reason = reason.as_str(), "Order revoked and archived");
                RevokeOutcome::ok()
            }
            None => RevokeOutcome::failed(format!("unknown order '{}'", certificate_id)),
        }
    }
}
