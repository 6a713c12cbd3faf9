//! Core rule management functionality
//!
//! - [`rule`]: Rule records, identifiers, port ranges and lifecycle states
//! - [`rule_constraints`]: Pairwise predicates deciding which rules may coexist
//! - [`conflict`]: Conflict detection for a candidate rule
//! - [`lifecycle`]: Rule state machine
//! - [`apply`]: Batch push to the enforcement backend
//! - [`nat`]: One-to-one NAT exclusivity
//! - [`ports`]: Atomic port reservation
//! - [`manager`]: Facade tying the above together under per-address scopes
//! - [`store`], [`topology`]: Collaborator interfaces with in-memory implementations
//! - [`error`]: Error types

pub mod apply;
pub mod conflict;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod manager;
pub mod nat;
pub mod ports;
pub mod rule;
pub mod rule_constraints;
pub mod store;
pub mod topology;
pub mod transfer;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
