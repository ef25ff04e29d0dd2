//! Order, authorization and challenge records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use certmill_common::{AuthorizationId, ChallengeId, OrderId};

use crate::domain;
use crate::error::{EngineError, EngineResult};

/// Identifier type; only DNS names are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
}

/// Name a certificate is requested for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    /// DNS identifier without any syntax check
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }

    /// Parse an `{type, value}` pair as received at the API boundary.
    ///
    /// The value is normalized to lowercase and must be a valid host name
    /// (a leading wildcard label is allowed).
    pub fn parse(kind: &str, value: &str) -> EngineResult<Self> {
        if kind != "dns" {
            return Err(EngineError::Validation(format!(
                "unsupported identifier type '{}'",
                kind
            )));
        }
        Self::dns(value).normalized()
    }

    /// Normalize and syntax-check the value
    pub fn normalized(self) -> EngineResult<Self> {
        let value = domain::normalize(&self.value);
        if !domain::is_valid_domain(&value) {
            return Err(EngineError::Validation(format!(
                "'{}' is not a valid DNS identifier",
                self.value
            )));
        }
        Ok(Self {
            kind: self.kind,
            value,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        domain::is_wildcard(&self.value)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns:{}", self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeType {
    /// Both challenge types are offered for every authorization
    pub const ALL: [ChallengeType; 2] = [ChallengeType::Http01, ChallengeType::Dns01];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChallengeType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            other => Err(EngineError::Validation(format!(
                "unknown challenge type '{}'",
                other
            ))),
        }
    }
}

/// Certificate order; parent aggregate of its authorizations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub identifiers: Vec<Identifier>,
    pub profile: Option<String>,
    pub status: OrderStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub certificate_url: Option<String>,
    pub authorization_ids: Vec<AuthorizationId>,
    /// CSR submitted at finalization
    #[serde(default)]
    pub csr_pem: Option<String>,
    /// Issued chain once the order is `valid`
    #[serde(default)]
    pub certificate_pem: Option<String>,
    #[serde(default)]
    pub certificate_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Order {
    pub fn domains(&self) -> Vec<String> {
        self.identifiers.iter().map(|i| i.value.clone()).collect()
    }
}

/// Proof-of-control requirement for one identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub id: AuthorizationId,
    pub order_id: OrderId,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires_at: DateTime<Utc>,
    pub challenge_ids: Vec<ChallengeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub authorization_id: AuthorizationId,
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub token: String,
    pub key_authorization: String,
    pub status: ChallengeStatus,
    pub validated_at: Option<DateTime<Utc>>,
    /// Diagnostic from the last validation attempt
    #[serde(default)]
    pub error: Option<String>,
}
