//! Self-hosted ACME order machinery
//!
//! # Architecture
//!
//! - [`OrderStateMachine`] - orders, authorizations and challenges, and
//!   the transitions between their states
//! - [`EabRegistry`] - external account binding credentials with plan quotas
//! - [`model`] - the records themselves
//!
//! # Challenge Flow
//!
//! 1. A caller creates an order for one or more DNS identifiers
//! 2. Every identifier gets an authorization with an `http-01` and a
//!    `dns-01` challenge, each carrying a precomputed key authorization
//! 3. The validator checks one of the challenges against live HTTP/DNS
//! 4. The first valid challenge makes its authorization valid; once every
//!    authorization is valid the order becomes `ready`
//! 5. The free-ACME provider finalizes ready orders with a CSR

mod eab;
pub mod model;
mod state;

pub use eab::{EabCredential, EabRegistry, IssuedEabCredential};
pub use model::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType, Identifier,
    IdentifierType, Order, OrderStatus,
};
pub use state::{OrderSettings, OrderStateMachine};
