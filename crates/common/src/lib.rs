//! Shared building blocks for the certmill workspace.
//!
//! - [`ids`] - type-safe identifier newtypes for orders, certificates and friends
//! - [`types`] - provider, validation-level and circuit breaker vocabulary
//! - [`quota`] - plan tiers and their EAB credential quotas
//! - [`circuit_breaker`] - lock-free breaker isolating failing upstream CAs

pub mod circuit_breaker;
pub mod ids;
pub mod quota;
pub mod types;

pub use circuit_breaker::CircuitBreaker;
pub use ids::{
    AuthorizationId, CertificateId, ChallengeId, MacId, OrderId, RenewalId, SubscriptionId,
};
pub use quota::{EabQuotas, PlanTier};
pub use types::{
    CircuitBreakerConfig, CircuitBreakerState, ParseKindError, ProviderKind, ValidationLevel,
};
