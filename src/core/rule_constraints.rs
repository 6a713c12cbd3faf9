//! Pairwise constraint functions for rules on the same address
//!
//! This module centralizes the business rules about which two rules may
//! coexist on one public address. The conflict detector, NAT admission and
//! the property tests all use these predicates so the overlap exception is
//! defined in exactly one place.
//!
//! # Examples
//!
//! ```
//! use netrules::core::rule::{Purpose, Protocol};
//! use netrules::core::rule_constraints::overlap_exempt;
//!
//! // Port forwarding may share ports only across protocols
//! assert!(overlap_exempt(
//!     (Purpose::PortForwarding, &Protocol::tcp()),
//!     (Purpose::PortForwarding, &Protocol::udp()),
//! ));
//! assert!(!overlap_exempt(
//!     (Purpose::Firewall, &Protocol::tcp()),
//!     (Purpose::PortForwarding, &Protocol::udp()),
//! ));
//! ```

use super::rule::{Protocol, Purpose, Rule, RuleState};

// ═══════════════════════════════════════════════════════════════════════════
// Port Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if two rules' source port ranges share at least one port.
#[inline]
pub fn ports_overlap(a: &Rule, b: &Rule) -> bool {
    a.source_ports.overlaps(&b.source_ports)
}

/// Returns `true` if two overlapping rules may still coexist.
///
/// Only two port forwarding rules with different protocols qualify: the same
/// public port can forward TCP to one place and UDP to another. Every other
/// purpose combination, including port forwarding against firewall, is a
/// conflict.
///
/// # Examples
///
/// ```
/// use netrules::core::rule::{Purpose, Protocol};
/// use netrules::core::rule_constraints::overlap_exempt;
///
/// assert!(!overlap_exempt(
///     (Purpose::PortForwarding, &Protocol::tcp()),
///     (Purpose::PortForwarding, &Protocol::new("TCP")),
/// ));
/// assert!(!overlap_exempt(
///     (Purpose::StaticNat, &Protocol::tcp()),
///     (Purpose::StaticNat, &Protocol::udp()),
/// ));
/// ```
#[inline]
pub fn overlap_exempt(a: (Purpose, &Protocol), b: (Purpose, &Protocol)) -> bool {
    a.0 == Purpose::PortForwarding && b.0 == Purpose::PortForwarding && a.1 != b.1
}

/// Returns `true` if the existing rule's ports make the candidate illegal.
#[inline]
pub fn ports_conflict(existing: &Rule, candidate: &Rule) -> bool {
    ports_overlap(existing, candidate)
        && !overlap_exempt(
            (existing.purpose(), &existing.protocol),
            (candidate.purpose(), &candidate.protocol),
        )
}

// ═══════════════════════════════════════════════════════════════════════════
// NAT / Network Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if exactly one of the two rules is a one-to-one NAT rule.
///
/// A NAT mapping owns the whole address, so it cannot share it with
/// independent rules in either direction.
#[inline]
pub fn nat_modes_differ(a: &Rule, b: &Rule) -> bool {
    a.one_to_one_nat != b.one_to_one_nat
}

/// Returns `true` if the candidate targets a different network than an
/// existing rule that is still live.
#[inline]
pub fn networks_conflict(existing: &Rule, candidate: &Rule) -> bool {
    existing.network != candidate.network && existing.state != RuleState::Revoke
}

// ═══════════════════════════════════════════════════════════════════════════
// Purpose Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if rules of this purpose carry a destination.
///
/// # Examples
///
/// ```
/// use netrules::core::rule::Purpose;
/// use netrules::core::rule_constraints::purpose_has_destination;
///
/// assert!(!purpose_has_destination(Purpose::Firewall));
/// assert!(purpose_has_destination(Purpose::PortForwarding));
/// assert!(purpose_has_destination(Purpose::StaticNat));
/// ```
#[inline]
pub fn purpose_has_destination(purpose: Purpose) -> bool {
    matches!(purpose, Purpose::PortForwarding | Purpose::StaticNat)
}

/// Returns `true` if the purpose always represents a one-to-one NAT mapping.
#[inline]
pub fn purpose_implies_nat(purpose: Purpose) -> bool {
    purpose == Purpose::StaticNat
}
