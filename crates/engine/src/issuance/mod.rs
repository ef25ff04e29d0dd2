//! Certificate issuance
//!
//! - [`IssuanceOrchestrator`] - provider fallback, status reports, revocation
//! - [`poll`] - bounded provider status polling
//! - [`RenewalScheduler`] - renewal records and their scheduling guards
//! - [`recovery`] - re-queues in-flight work after a restart

mod certificate;
mod orchestrator;
pub mod poll;
pub mod recovery;
mod renewal;

pub use certificate::{Certificate, CertificateStatus};
pub use orchestrator::{IssuanceOrchestrator, IssuanceSettings, StatusReport};
pub use poll::PollOutcome;
pub use recovery::RecoveryReport;
pub use renewal::{
    RenewalDecision, RenewalRecord, RenewalScheduler, RenewalStatus, MAX_RENEWAL_DEFERRALS,
    RENEWAL_RETRY_DELAY_MINUTES,
};
