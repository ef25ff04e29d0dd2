//! Certmill Engine Library
//!
//! ACME-style certificate issuance with multi-provider fallback.
//!
//! This library provides:
//!
//! - **Orders**: order, authorization and challenge state machines
//! - **Validation**: HTTP-01 and DNS-01 domain control checks
//! - **EAB**: external account binding credentials with plan quotas
//! - **Providers**: commercial, cloud-managed and self-hosted ACME drivers
//! - **Issuance**: provider selection with fallback, bounded status polling
//!   and renewal scheduling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certmill_config::Config;
//! use certmill_engine::{CertificateEngine, IssuanceRequirements, MemorySubscriptionDirectory};
//!
//! let config = Config::default_embedded()?;
//! let subscriptions = Arc::new(MemorySubscriptionDirectory::new());
//! let engine = CertificateEngine::from_config(&config, subscriptions)?;
//!
//! let certificate = engine
//!     .issue_certificate(&subscription_id, "example.com", IssuanceRequirements::default())
//!     .await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod clock;
pub mod crypto;
pub mod domain;
pub mod engine;
pub mod error;
pub mod issuance;
pub mod ports;
pub mod providers;
pub mod selector;
pub mod store;
pub mod tasks;
pub mod validation;
pub mod worker;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Engine facade and worker
pub use engine::CertificateEngine;
pub use worker::{TickReport, Worker};

// Errors
pub use error::{CryptoError, EngineError, EngineResult, StorageError};

// Orders and EAB
pub use acme::{EabRegistry, Identifier, Order, OrderStateMachine, OrderStatus};

// Issuance
pub use issuance::{
    Certificate, CertificateStatus, IssuanceOrchestrator, IssuanceSettings, PollOutcome,
    RecoveryReport, RenewalRecord, RenewalScheduler, RenewalStatus, StatusReport,
};
pub use selector::{CostPreference, HostingPlatform, IssuanceRequirements, ProviderSelector};

// Providers
pub use providers::{CertificateProvider, ProviderRegistry, ProviderStatus, RevocationReason};

// Collaborators and adapters
pub use clock::{Clock, ManualClock, SystemClock};
pub use ports::{
    CertificateRepository, Collaborators, RenewalRepository, SecretVault, SubscriptionDirectory,
    TaskQueue,
};
pub use store::{
    FileCertificateStore, FileSecretVault, MemoryCertificateStore, MemoryRenewalStore, MemorySecretVault,
    MemorySubscriptionDirectory,
};
pub use tasks::{MemoryTaskQueue, PollTask, Task};

// Validation
pub use validation::{ChallengeValidator, ValidationOutcome};
