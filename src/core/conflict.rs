//! Conflict detection between a candidate rule and its siblings
//!
//! Rules are persisted in [`RuleState::Staged`](super::rule::RuleState::Staged)
//! before they are checked, so the candidate is always part of the sibling
//! list it is checked against and has to be skipped by id. Requiring it to be
//! present catches callers that forgot the persist-then-check order, which is
//! what lets concurrent evaluators see each other's candidates.

use super::error::{ConflictReason, Error, Result};
use super::rule::Rule;
use super::rule_constraints::{nat_modes_differ, networks_conflict, ports_conflict};
use tracing::debug;

/// Checks `candidate` against every non-revoked rule in `existing`.
///
/// `existing` must be the address's non-revoked rules and must include the
/// candidate itself. The first conflict found is reported; the error carries
/// the [`ConflictReason`] and the id of the offending rule.
///
/// # Errors
///
/// - [`Error::RuleConflict`] if any sibling conflicts with the candidate
/// - [`Error::Internal`] if the candidate is missing from `existing` or a
///   sibling belongs to another address
pub fn detect_conflict(candidate: &Rule, existing: &[Rule]) -> Result<()> {
    if !existing.iter().any(|r| r.id == candidate.id) {
        return Err(Error::Internal(format!(
            "rule {} must be persisted before conflict detection",
            candidate.id
        )));
    }

    let mut checked = 0usize;
    for rule in existing {
        if rule.id == candidate.id || rule.is_revoked() {
            continue;
        }
        if rule.source_address != candidate.source_address {
            return Err(Error::Internal(format!(
                "rule {} is on address {}, not {}",
                rule.id, rule.source_address, candidate.source_address
            )));
        }
        checked += 1;

        if nat_modes_differ(rule, candidate) {
            let message = if rule.one_to_one_nat {
                format!(
                    "There is 1 to 1 Nat rule specified for the ip address id={}",
                    candidate.source_address
                )
            } else {
                format!(
                    "There is already firewall rule specified for the ip address id={}",
                    candidate.source_address
                )
            };
            debug!("Rejected {}: {}", candidate, message);
            return Err(Error::conflict(
                ConflictReason::NatExclusivity,
                Some(rule.id),
                message,
            ));
        }

        if networks_conflict(rule, candidate) {
            debug!(
                "Rejected {}: network {} differs from rule {}",
                candidate, candidate.network, rule.id
            );
            return Err(Error::conflict(
                ConflictReason::NetworkMismatch,
                Some(rule.id),
                format!(
                    "New rule is for a different network than what's specified in rule {}",
                    rule.id
                ),
            ));
        }

        if ports_conflict(rule, candidate) {
            debug!("Rejected {}: ports overlap rule {}", candidate, rule.id);
            return Err(Error::conflict(
                ConflictReason::PortOverlap,
                Some(rule.id),
                format!(
                    "The range specified, {}, conflicts with rule {} which has {}",
                    candidate.source_ports, rule.id, rule.source_ports
                ),
            ));
        }
    }

    debug!(
        "No network rule conflicts detected for {} against {} existing rules",
        candidate, checked
    );
    Ok(())
}
