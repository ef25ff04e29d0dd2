//! Cloud-managed certificate driver
//!
//! Issuance is two rounds of long-running operations against
//! `{api}/projects/{project}/locations/{location}`:
//!
//! 1. one `dnsAuthorizations` resource per domain (an existing one is reused)
//! 2. a `certificates` resource whose `managed` block references them
//!
//! Each operation is polled until `done` or the configured timeout. The
//! platform installs certificates itself, so there is nothing to download.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use certmill_common::ProviderKind;
use certmill_config::CloudCaConfig;

use super::{
    CertificateProvider, CertificateRequest, CreateOutcome, DownloadedCertificate, ProviderError,
    ProviderResult, ProviderStatus, RevocationReason, RevokeOutcome, StatusSnapshot,
};
use crate::domain::{base_domain, normalize};

#[derive(Debug, Clone, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedCertificate {
    #[serde(default)]
    managed: Option<ManagedBlock>,
    #[serde(default)]
    expire_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedBlock {
    #[serde(default)]
    state: Option<String>,
}

/// Resource-id safe form of a domain (`*.example.com` -> `wildcard-example-com`)
fn resource_slug(domain: &str) -> String {
    let domain = normalize(domain);
    let slug: String = domain
        .replace("*.", "wildcard.")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.chars().take(50).collect()
}

#[derive(Debug)]
pub struct CloudManagedDriver {
    client: Client,
    base_url: String,
    parent: String,
    access_token: String,
    operation_timeout: Duration,
    operation_poll: Duration,
}

impl CloudManagedDriver {
    pub fn new(config: &CloudCaConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            parent: format!("projects/{}/locations/{}", config.project, config.location),
            access_token: config.access_token.clone(),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
            operation_poll: Duration::from_secs(config.operation_poll_secs),
        })
    }

    /// Override operation polling; tests use millisecond intervals
    pub fn with_operation_timing(mut self, timeout: Duration, poll: Duration) -> Self {
        self.operation_timeout = timeout;
        self.operation_poll = poll;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.access_token)
    }

    async fn send(&self, builder: RequestBuilder) -> ProviderResult<Response> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication(format!(
                "Cloud API rejected the access token (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> ProviderResult<T> {
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse {}: {}", what, e)))
    }

    /// Poll an operation until it is done or the timeout elapses
    async fn wait_for_operation(&self, mut operation: Operation) -> ProviderResult<Value> {
        let deadline = Instant::now() + self.operation_timeout;

        loop {
            if operation.done {
                if let Some(err) = operation.error {
                    return Err(ProviderError::Api {
                        status: u16::try_from(err.code).unwrap_or(0),
                        message: format!("operation {} failed: {}", operation.name, err.message),
                    });
                }
                trace!(operation = %operation.name, "Operation finished");
                return Ok(operation.response.unwrap_or(Value::Null));
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout(format!(
                    "operation {} not done after {}s",
                    operation.name,
                    self.operation_timeout.as_secs()
                )));
            }

            tokio::time::sleep(self.operation_poll).await;
            debug!(operation = %operation.name, "Polling long-running operation");
            let response = self.send(self.client.get(self.url(&operation.name))).await?;
            operation = Self::parse(response, "operation").await?;
        }
    }

    /// Create (or reuse) the DNS authorization for one domain
    async fn ensure_dns_authorization(&self, domain: &str) -> ProviderResult<Value> {
        let authorized = base_domain(domain).to_string();
        let id = format!("dns-auth-{}", resource_slug(&authorized));
        let name = format!("{}/dnsAuthorizations/{}", self.parent, id);

        let request = self
            .client
            .post(self.url(&format!("{}/dnsAuthorizations", self.parent)))
            .query(&[("dnsAuthorizationId", id.as_str())])
            .json(&json!({ "domain": authorized }));

        match self.send(request).await {
            Ok(response) => {
                let operation: Operation = Self::parse(response, "operation").await?;
                let resource = self.wait_for_operation(operation).await?;
                debug!(provider = "cloud", domain = %authorized, name = %name, "DNS authorization created");
                Ok(resource)
            }
            Err(ProviderError::Api { status: 409, .. }) => {
                debug!(provider = "cloud", domain = %authorized, name = %name, "Reusing existing DNS authorization");
                let response = self.send(self.client.get(self.url(&name))).await?;
                Self::parse(response, "DNS authorization").await
            }
            Err(e) => Err(e),
        }
    }

    async fn provision(&self, request: &CertificateRequest) -> ProviderResult<CreateOutcome> {
        let mut authorizations = Vec::with_capacity(request.domains.len());
        let mut authorization_names: Vec<String> = Vec::with_capacity(request.domains.len());
        for domain in &request.domains {
            let resource = self.ensure_dns_authorization(domain).await?;
            let name = resource
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "{}/dnsAuthorizations/dns-auth-{}",
                        self.parent,
                        resource_slug(base_domain(domain))
                    )
                });
            if !authorization_names.contains(&name) {
                authorization_names.push(name);
                authorizations.push(resource);
            }
        }

        let certificate_id = format!(
            "cert-{}-{}",
            resource_slug(request.primary_domain()),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let body = json!({
            "managed": {
                "domains": request.domains,
                "dnsAuthorizations": authorization_names,
            }
        });
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{}/certificates", self.parent)))
                    .query(&[("certificateId", certificate_id.as_str())])
                    .json(&body),
            )
            .await?;
        let operation: Operation = Self::parse(response, "operation").await?;
        let resource = self.wait_for_operation(operation).await?;

        let status = resource
            .get("managed")
            .and_then(|m| m.get("state"))
            .and_then(Value::as_str)
            .map(ProviderStatus::from_upstream)
            .unwrap_or(ProviderStatus::Processing);

        info!(
            provider = "cloud",
            certificate_id = %certificate_id,
            domain = %request.primary_domain(),
            status = %status,
            "Managed certificate created"
        );

        Ok(CreateOutcome::created(
            certificate_id,
            status,
            json!({
                "certificate": resource,
                "dns_authorizations": authorizations,
            }),
        ))
    }

    fn certificate_path(&self, certificate_id: &str) -> String {
        format!("{}/certificates/{}", self.parent, certificate_id)
    }

    async fn delete_certificate(&self, certificate_id: &str) -> ProviderResult<Value> {
        let response = self
            .send(self.client.delete(self.url(&self.certificate_path(certificate_id))))
            .await?;
        let operation: Operation = Self::parse(response, "operation").await?;
        self.wait_for_operation(operation).await
    }
}

#[async_trait]
impl CertificateProvider for CloudManagedDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn create_certificate(&self, request: &CertificateRequest) -> CreateOutcome {
        match self.provision(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(provider = "cloud", domain = %request.primary_domain(), error = %e, "Managed certificate creation failed");
                CreateOutcome::failed(e.to_string())
            }
        }
    }

    async fn get_certificate_status(&self, certificate_id: &str) -> ProviderResult<StatusSnapshot> {
        let response = self
            .send(self.client.get(self.url(&self.certificate_path(certificate_id))))
            .await?;
        let doc: Value = Self::parse(response, "certificate").await?;
        let cert: ManagedCertificate = serde_json::from_value(doc.clone())
            .map_err(|e| ProviderError::InvalidResponse(format!("Unexpected certificate shape: {}", e)))?;

        let status = cert
            .managed
            .and_then(|m| m.state)
            .map(|s| ProviderStatus::from_upstream(&s))
            .unwrap_or(ProviderStatus::Processing);

        Ok(StatusSnapshot {
            status,
            expires_at: cert.expire_time,
            provider_data: doc,
        })
    }

    async fn download_certificate(&self, certificate_id: &str) -> ProviderResult<Option<DownloadedCertificate>> {
        trace!(provider = "cloud", certificate_id = %certificate_id, "Managed certificates are not downloadable");
        Ok(None)
    }

    /// Managed certificates are revoked by deleting the resource
    async fn revoke_certificate(&self, certificate_id: &str, reason: RevocationReason) -> RevokeOutcome {
        match self.delete_certificate(certificate_id).await {
            Ok(_) => {
                info!(provider = "cloud", certificate_id = %certificate_id, reason = reason.as_str(), "Managed certificate deleted");
                RevokeOutcome::ok()
            }
            Err(e) => {
                warn!(provider = "cloud", certificate_id = %certificate_id, error = %e, "Managed certificate deletion failed");
                RevokeOutcome::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_slug() {
        assert_eq!(resource_slug("Example.com"), "example-com");
        assert_eq!(resource_slug("*.example.com"), "wildcard-example-com");
        assert!(resource_slug(&format!("{}.com", "a".repeat(80))).len() <= 50);
    }
}
