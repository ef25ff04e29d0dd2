//! Record storage adapters

mod fs;
mod memory;

pub use fs::{FileCertificateStore, FileSecretVault};
pub use memory::{
    MemoryCertificateStore, MemoryRenewalStore, MemorySecretVault, MemorySubscriptionDirectory,
    SubscriptionState,
};
