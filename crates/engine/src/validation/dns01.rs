//! DNS-01 validation
//!
//! Looks up TXT records at `_acme-challenge.{domain}` and accepts the
//! challenge if any record equals `base64url(SHA-256(key_authorization))`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::ValidationOutcome;
use crate::crypto::{constant_time_eq, dns01_txt_value};
use crate::domain;
use crate::error::{EngineError, EngineResult};

/// DNS-01 record name for a domain; wildcard labels are stripped
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("_acme-challenge.{}", domain::base_domain(domain))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxtLookupError {
    /// NXDOMAIN or an empty answer
    #[error("no TXT records at '{0}'")]
    NoRecords(String),

    /// The resolver could not produce an answer
    #[error("TXT lookup for '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Source of TXT records
#[async_trait]
pub trait TxtResolver: Send + Sync + fmt::Debug {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, TxtLookupError>;
}

/// TXT lookups through hickory
pub struct HickoryTxtResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryTxtResolver {
    /// Query `nameservers`, or the system resolvers when none are given.
    ///
    /// Caching is disabled so a freshly published record is seen at once.
    pub fn new(nameservers: &[IpAddr], timeout: Duration) -> EngineResult<Self> {
        let (config, mut opts) = if nameservers.is_empty() {
            hickory_resolver::system_conf::read_system_conf().map_err(|e| {
                EngineError::Configuration(format!("Failed to read system resolver configuration: {}", e))
            })?
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            (config, ResolverOpts::default())
        };

        opts.timeout = timeout;
        opts.attempts = 2;
        opts.cache_size = 0;

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

impl fmt::Debug for HickoryTxtResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HickoryTxtResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, TxtLookupError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                let values: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        // Long TXT values arrive split into character-strings
                        txt.txt_data()
                            .iter()
                            .map(|chunk| String::from_utf8_lossy(chunk))
                            .collect()
                    })
                    .collect();
                if values.is_empty() {
                    Err(TxtLookupError::NoRecords(name.to_string()))
                } else {
                    Ok(values)
                }
            }
            Err(e) => {
                let message = e.to_string();
                let lower = message.to_lowercase();
                if lower.contains("no records found")
                    || lower.contains("nxdomain")
                    || lower.contains("record not found")
                {
                    Err(TxtLookupError::NoRecords(name.to_string()))
                } else {
                    Err(TxtLookupError::Failed {
                        name: name.to_string(),
                        message,
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dns01Validator {
    resolver: Arc<dyn TxtResolver>,
}

impl Dns01Validator {
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self { resolver }
    }

    /// Check that `_acme-challenge.{domain}` publishes the digest of
    /// `key_authorization`
    pub async fn check(&self, domain: &str, key_authorization: &str) -> ValidationOutcome {
        let record = challenge_record_fqdn(domain);
        let expected = dns01_txt_value(key_authorization);

        let outcome = match self.resolver.lookup_txt(&record).await {
            Ok(values) => {
                trace!(record = %record, found = values.len(), "TXT records returned");
                let matched = values
                    .iter()
                    .any(|v| constant_time_eq(v.trim().as_bytes(), expected.as_bytes()));
                if matched {
                    ValidationOutcome::valid(format!("{} holds the expected TXT value", record), 1)
                } else {
                    ValidationOutcome::invalid(
                        format!("none of the {} TXT record(s) at {} match", values.len(), record),
                        1,
                    )
                }
            }
            Err(TxtLookupError::NoRecords(_)) => {
                ValidationOutcome::invalid(format!("no TXT records found at {}", record), 1)
            }
            Err(e @ TxtLookupError::Failed { .. }) => {
                warn!(
                    challenge_type = "dns-01",
                    domain = %domain,
                    error = %e,
                    "DNS-01 lookup failed, result inconclusive"
                );
                return ValidationOutcome::inconclusive(e.to_string(), 1);
            }
        };

        if outcome.is_valid() {
            info!(challenge_type = "dns-01", domain = %domain, attempt = 1, outcome = ?outcome.verdict, "DNS-01 validation finished");
        } else {
            debug!(challenge_type = "dns-01", domain = %domain, detail = %outcome.detail, "DNS-01 validation failed");
        }
        outcome
    }
}
