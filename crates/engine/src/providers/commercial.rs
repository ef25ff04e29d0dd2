//! Commercial CA reseller driver
//!
//! Talks to the reseller REST API:
//!
//! - `POST /auth/login` exchanges username/password for a session token
//! - `POST /orders` places a certificate order
//! - `GET /orders/{id}` and `POST /orders/status` report order state
//! - `GET /orders/{id}/certificate` returns the issued chain
//! - `POST /orders/{id}/revoke` revokes
//! - `POST /orders/{id}/cancel` withdraws an order that was placed for the wrong domain
//!
//! The session token is cached in an injected [`SessionTokenCache`]; a 401
//! or 403 invalidates it and the request is retried once with a fresh login.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use certmill_common::ProviderKind;
use certmill_config::CommercialCaConfig;

use super::domain::{extract_domain, DomainSources};
use super::session::SessionTokenCache;
use super::{
    CertificateProvider, CertificateRequest, CreateOutcome, DownloadedCertificate, ProviderError,
    ProviderResult, ProviderStatus, RevocationReason, RevokeOutcome, StatusSnapshot,
};
use crate::domain::normalize;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "access_token")]
    token: String,
}

#[derive(Debug, Deserialize)]
struct OrderDocument {
    #[serde(alias = "order_id")]
    id: String,
    status: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BulkStatusResponse {
    #[serde(default)]
    orders: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CertificateDocument {
    #[serde(alias = "certificate_pem")]
    certificate: Option<String>,
    #[serde(default, alias = "ca_bundle_pem")]
    ca_bundle: Option<String>,
}

pub struct CommercialCaDriver {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    tokens: Arc<SessionTokenCache>,
    batch_size: usize,
    batch_delay: Duration,
}

impl CommercialCaDriver {
    pub fn new(config: &CommercialCaConfig, tokens: Arc<SessionTokenCache>) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            tokens,
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> ProviderResult<()> {
        let path = format!("/orders/{}/cancel", order_id);
        self.send(|client, token| client.post(self.url(&path)).bearer_auth(token))
            .await?;
        info!(provider = "commercial", order_id = %order_id, "Commercial CA order cancelled");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> ProviderResult<String> {
        debug!(provider = "commercial", "Logging in to commercial CA");
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication(
                "Commercial CA rejected the configured credentials".to_string(),
            ));
        }
        let response = ensure_success(response).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        self.tokens.store(login.token.clone());
        Ok(login.token)
    }

    async fn token(&self) -> ProviderResult<String> {
        match self.tokens.get() {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    /// Send an authenticated request, refreshing the session once on 401/403
    async fn send<F>(&self, build: F) -> ProviderResult<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let token = self.token().await?;
        let response = build(&self.client, &token)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
            return ensure_success(response).await;
        }

        debug!(provider = "commercial", status = status.as_u16(), "Session rejected, logging in again");
        self.tokens.invalidate();
        let token = self.login().await?;
        let response = build(&self.client, &token)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.tokens.invalidate();
            return Err(ProviderError::Authentication(format!(
                "Commercial CA rejected a fresh session token (HTTP {})",
                status.as_u16()
            )));
        }
        ensure_success(response).await
    }

    async fn place_order(&self, request: &CertificateRequest) -> ProviderResult<CreateOutcome> {
        let body = json!({
            "domains": request.domains,
            "csr": request.csr_pem,
            "validation_level": request.validation_level.as_str(),
            "validity_days": request.validity_days,
        });

        let response = self
            .send(|client, token| client.post(self.url("/orders")).bearer_auth(token).json(&body))
            .await?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse order response: {}", e)))?;
        let order: OrderDocument = serde_json::from_value(doc.clone())
            .map_err(|e| ProviderError::InvalidResponse(format!("Order response missing fields: {}", e)))?;

        // The upstream is known to misreport domains; cross-check with the CSR
        let mut sources = DomainSources::from_order(&doc);
        if sources.csr_pem.is_none() {
            sources.csr_pem = Some(request.csr_pem.clone());
        }
        let expected = normalize(request.primary_domain());
        match extract_domain(&sources) {
            Some(found) if found != expected => {
                warn!(
                    provider = "commercial",
                    order_id = %order.id,
                    expected = %expected,
                    found = %found,
                    "Commercial CA order reports a different domain"
                );
                if let Err(e) = self.cancel_order(&order.id).await {
                    warn!(provider = "commercial", order_id = %order.id, error = %e, "Mismatched order left open upstream");
                }
                return Ok(CreateOutcome {
                    certificate_id: Some(order.id),
                    provider_data: doc,
                    ..CreateOutcome::failed(format!(
                        "domain mismatch: requested {}, upstream order is for {}",
                        expected, found
                    ))
                });
            }
            Some(_) => {}
            None => {
                warn!(provider = "commercial", order_id = %order.id, "Could not determine order domain from upstream response");
            }
        }

        let status = ProviderStatus::from_upstream(&order.status);
        info!(
            provider = "commercial",
            order_id = %order.id,
            domain = %expected,
            status = %status,
            "Commercial CA order placed"
        );
        Ok(CreateOutcome::created(order.id, status, doc))
    }

    async fn fetch_statuses(&self, ids: &[String]) -> ProviderResult<Vec<Value>> {
        let body = json!({ "ids": ids });
        let response = self
            .send(|client, token| client.post(self.url("/orders/status")).bearer_auth(token).json(&body))
            .await?;
        let bulk: BulkStatusResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse bulk status: {}", e)))?;
        Ok(bulk.orders)
    }
}

impl std::fmt::Debug for CommercialCaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommercialCaDriver")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

async fn ensure_success(response: Response) -> ProviderResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Api { status, message })
}

fn snapshot_from(doc: Value) -> ProviderResult<StatusSnapshot> {
    let order: OrderDocument = serde_json::from_value(doc.clone())
        .map_err(|e| ProviderError::InvalidResponse(format!("Order document missing fields: {}", e)))?;
    Ok(StatusSnapshot {
        status: ProviderStatus::from_upstream(&order.status),
        expires_at: order.expires_at,
        provider_data: doc,
    })
}

#[async_trait]
impl CertificateProvider for CommercialCaDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Commercial
    }

    async fn create_certificate(&self, request: &CertificateRequest) -> CreateOutcome {
        match self.place_order(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(provider = "commercial", domain = %request.primary_domain(), error = %e, "Commercial CA order failed");
                CreateOutcome::failed(e.to_string())
            }
        }
    }

    async fn get_certificate_status(&self, certificate_id: &str) -> ProviderResult<StatusSnapshot> {
        let path = format!("/orders/{}", certificate_id);
        let response = self
            .send(|client, token| client.get(self.url(&path)).bearer_auth(token))
            .await?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse order: {}", e)))?;
        let snapshot = snapshot_from(doc)?;
        trace!(provider = "commercial", certificate_id = %certificate_id, status = %snapshot.status, "Order status");
        Ok(snapshot)
    }

    /// Chunked bulk lookup with a pause between chunks
    async fn get_certificate_statuses(&self, certificate_ids: &[String]) -> HashMap<String, StatusSnapshot> {
        let mut out = HashMap::with_capacity(certificate_ids.len());
        let chunks: Vec<&[String]> = certificate_ids.chunks(self.batch_size).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            match self.fetch_statuses(chunk).await {
                Ok(docs) => {
                    for doc in docs {
                        match snapshot_from(doc.clone()) {
                            Ok(snapshot) => {
                                if let Some(id) = doc.get("id").or_else(|| doc.get("order_id")).and_then(Value::as_str) {
                                    out.insert(id.to_string(), snapshot);
                                }
                            }
                            Err(e) => debug!(provider = "commercial", error = %e, "Skipping malformed bulk status entry"),
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = "commercial", chunk = index, size = chunk.len(), error = %e, "Bulk status chunk failed");
                }
            }

            if index + 1 < chunk_count && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        debug!(provider = "commercial", requested = certificate_ids.len(), reported = out.len(), chunks = chunk_count, "Bulk status lookup finished");
        out
    }

    async fn download_certificate(&self, certificate_id: &str) -> ProviderResult<Option<DownloadedCertificate>> {
        let path = format!("/orders/{}/certificate", certificate_id);
        let response = self
            .send(|client, token| client.get(self.url(&path)).bearer_auth(token))
            .await?;
        let doc: CertificateDocument = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse certificate: {}", e)))?;

        let certificate_pem = doc
            .certificate
            .filter(|pem| !pem.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("certificate body is empty".to_string()))?;

        Ok(Some(DownloadedCertificate {
            certificate_pem,
            ca_bundle_pem: doc.ca_bundle,
        }))
    }

    async fn revoke_certificate(&self, certificate_id: &str, reason: RevocationReason) -> RevokeOutcome {
        let path = format!("/orders/{}/revoke", certificate_id);
        let body = json!({ "reason": reason.as_str(), "reason_code": reason.code() });
        match self
            .send(|client, token| client.post(self.url(&path)).bearer_auth(token).json(&body))
            .await
        {
            Ok(_) => {
                info!(provider = "commercial", certificate_id = %certificate_id, reason = reason.as_str(), "Certificate revoked");
                RevokeOutcome::ok()
            }
            Err(e) => {
                warn!(provider = "commercial", certificate_id = %certificate_id, error = %e, "Revocation failed");
                RevokeOutcome::failed(e.to_string())
            }
        }
    }
}
