//! HTTP-01 validation
//!
//! Fetches `http://{domain}/.well-known/acme-challenge/{token}` and
//! compares the trimmed body with the expected key authorization in
//! constant time. Transport failures and non-2xx responses are retried a
//! bounded number of times; a wrong body is final.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use certmill_config::ChallengeValidationConfig;

use super::ValidationOutcome;
use crate::crypto::constant_time_eq;
use crate::domain;
use crate::error::{EngineError, EngineResult};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Responses larger than this cannot be a key authorization
const MAX_BODY_BYTES: usize = 8 * 1024;

/// URL the challenge response is fetched from
pub fn challenge_url(domain: &str, port: u16, token: &str) -> String {
    if port == 80 {
        format!("http://{}{}{}", domain, ACME_CHALLENGE_PREFIX, token)
    } else {
        format!("http://{}:{}{}{}", domain, port, ACME_CHALLENGE_PREFIX, token)
    }
}

#[derive(Debug, Clone)]
pub struct Http01Validator {
    client: Client,
    port: u16,
    attempts: u32,
    backoff: Duration,
}

impl Http01Validator {
    pub fn new(timeout: Duration, attempts: u32, backoff: Duration, port: u16) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certmill-validator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            port,
            attempts: attempts.max(1),
            backoff,
        })
    }

    pub fn from_config(config: &ChallengeValidationConfig) -> EngineResult<Self> {
        Self::new(
            Duration::from_secs(config.http_timeout_secs),
            config.http_attempts,
            Duration::from_millis(config.http_retry_backoff_ms),
            config.http_port,
        )
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check that `domain` serves `key_authorization` for `token`
    pub async fn check(&self, domain: &str, token: &str, key_authorization: &str) -> ValidationOutcome {
        if domain::is_wildcard(domain) {
            return ValidationOutcome::invalid(
                format!("HTTP-01 cannot validate wildcard identifier '{}'", domain),
                0,
            );
        }

        let url = challenge_url(domain, self.port, token);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.fetch(&url).await {
                Ok(body) => {
                    let outcome = if constant_time_eq(body.trim().as_bytes(), key_authorization.as_bytes()) {
                        ValidationOutcome::valid(format!("{} served the expected key authorization", url), attempt)
                    } else {
                        ValidationOutcome::invalid(
                            format!("{} served unexpected content ({} bytes)", url, body.len()),
                            attempt,
                        )
                    };
                    info!(
                        challenge_type = "http-01",
                        domain = %domain,
                        attempt,
                        outcome = ?outcome.verdict,
                        "HTTP-01 validation finished"
                    );
                    return outcome;
                }
                Err(e) => {
                    debug!(
                        challenge_type = "http-01",
                        domain = %domain,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "HTTP-01 fetch failed"
                    );
                    last_error = e;
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        warn!(
            challenge_type = "http-01",
            domain = %domain,
            attempts = self.attempts,
            error = %last_error,
            "HTTP-01 validation failed"
        );
        ValidationOutcome::invalid(last_error, self.attempts)
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let mut response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                format!("timed out fetching {}", url)
            } else {
                format!("request to {} failed: {}", url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned HTTP {}", url, status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > MAX_BODY_BYTES as u64) {
            return Err(format!("{} response exceeds {} bytes", url, MAX_BODY_BYTES));
        }

        // Chunked responses carry no length; stop reading at the cap
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("failed reading body from {}: {}", url, e))?
        {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(format!("{} response exceeds {} bytes", url, MAX_BODY_BYTES));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
