//! netrules - traffic rules for public addresses
//!
//! Decides whether a firewall, port forwarding or one-to-one NAT rule can be
//! attached to a public address, tracks each rule through its lifecycle, and
//! pushes batches of pending rules to an enforcement backend.
//!
//! # Architecture
//!
//! - [`core`] - Conflict detection, lifecycle, NAT exclusivity, apply engine
//! - [`audit`] - Rule and NAT events, JSON-lines audit log
//! - [`validators`] - Port and protocol validation
//! - [`config`] - Manager configuration persistence
//! - [`utils`] - XDG directories
//!
//! # Guarantees
//!
//! - Rules are persisted before they are checked, so concurrent requests on
//!   one address always see each other
//! - Every read-modify-write of an address runs under a per-address scope
//! - Port reservations are all-or-nothing
//! - A failed push leaves every rule in the batch where it was

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::apply::{ApplyReport, BatchOutcome, EnforcementBackend};
pub use core::error::{ConflictReason, Error, Result};
pub use core::manager::{RuleRequest, RulesManager, Target};
pub use core::rule::{Protocol, Purpose, Rule, RuleState};
