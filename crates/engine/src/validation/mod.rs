//! Domain control validation
//!
//! HTTP-01 and DNS-01 checks against live network state. The checks
//! never mutate engine state and never fail with an error: every outcome,
//! including network trouble, is reported as a [`ValidationOutcome`] with
//! a diagnostic. The caller decides what a verdict means for the challenge.

pub mod dns01;
pub mod http01;

use std::sync::Arc;
use std::time::Duration;

use certmill_config::ChallengeValidationConfig;

use crate::acme::ChallengeType;
use crate::error::EngineResult;

pub use dns01::{challenge_record_fqdn, Dns01Validator, HickoryTxtResolver, TxtLookupError, TxtResolver};
pub use http01::{challenge_url, Http01Validator, ACME_CHALLENGE_PREFIX};

/// Result of one validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Expected content found
    Valid,
    /// Definitively not satisfied
    Invalid,
    /// The check itself could not complete (resolver failure); retry later
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub verdict: Verdict,
    pub detail: String,
    pub attempts: u32,
}

impl ValidationOutcome {
    pub fn valid(detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            verdict: Verdict::Valid,
            detail: detail.into(),
            attempts,
        }
    }

    pub fn invalid(detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            verdict: Verdict::Invalid,
            detail: detail.into(),
            attempts,
        }
    }

    pub fn inconclusive(detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            verdict: Verdict::Inconclusive,
            detail: detail.into(),
            attempts,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }

    /// Whether the outcome may be applied to the challenge
    pub fn is_definitive(&self) -> bool {
        self.verdict != Verdict::Inconclusive
    }
}

/// HTTP-01 and DNS-01 validators behind one entry point
#[derive(Debug)]
pub struct ChallengeValidator {
    http: Http01Validator,
    dns: Dns01Validator,
}

impl ChallengeValidator {
    pub fn new(http: Http01Validator, dns: Dns01Validator) -> Self {
        Self { http, dns }
    }

    pub fn from_config(config: &ChallengeValidationConfig) -> EngineResult<Self> {
        let http = Http01Validator::from_config(config)?;
        let resolver = HickoryTxtResolver::new(
            &config.dns_nameservers,
            Duration::from_secs(config.dns_timeout_secs),
        )?;
        Ok(Self::new(http, Dns01Validator::new(Arc::new(resolver))))
    }

    pub fn http01(&self) -> &Http01Validator {
        &self.http
    }

    pub fn dns01(&self) -> &Dns01Validator {
        &self.dns
    }

    /// Run the check matching `kind`
    pub async fn validate(
        &self,
        kind: ChallengeType,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> ValidationOutcome {
        match kind {
            ChallengeType::Http01 => self.http.check(domain, token, key_authorization).await,
            ChallengeType::Dns01 => self.dns.check(domain, key_authorization).await,
        }
    }
}
