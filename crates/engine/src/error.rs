//! Engine error types
//!
//! Only configuration-class failures reach callers as `Err`. Provider and
//! validation failures are turned into status transitions inside the
//! engine and never surface through these types.

use std::io;
use thiserror::Error;

use certmill_common::PlanTier;

/// Errors returned by the engine's public operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine could not be assembled from its configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller input rejected at the API boundary
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Subscription already holds the maximum number of active EAB credentials
    #[error("EAB quota exceeded for subscription '{subscription}': the {tier} plan allows {limit} active credential(s)")]
    QuotaExceeded {
        subscription: String,
        tier: PlanTier,
        limit: u32,
    },

    /// EAB credential was revoked and can no longer bind accounts
    #[error("EAB credential '{0}' has been revoked")]
    CredentialRevoked(String),

    /// Entity is in a state that does not permit the operation
    #[error("Invalid state for {kind} '{id}': {message}")]
    InvalidState {
        kind: &'static str,
        id: String,
        message: String,
    },

    /// Persistence failure in a repository adapter
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upstream provider could not be constructed or reached
    #[error("Provider error: {0}")]
    Provider(String),

    /// Encoding, key or signature failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Secret vault refused to seal or open a value
    #[error("Secret storage error: {0}")]
    Secret(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(kind: &'static str, id: impl ToString, message: impl Into<String>) -> Self {
        EngineError::InvalidState {
            kind,
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Collaborator failures worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_) | EngineError::Provider(_) | EngineError::Secret(_)
        )
    }
}

/// Errors specific to certificate persistence
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize a record
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors from the crypto primitives
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid base64url input: {0}")]
    Base64(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signature does not match")]
    SignatureMismatch,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
}

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;
