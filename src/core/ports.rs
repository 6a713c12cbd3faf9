//! Atomic port reservation
//!
//! Reserving ports creates one single-port rule per port in one atomic
//! batch. Each rule is checked against everything on the address, the other
//! new rules included; a single conflict removes the whole batch.

use super::conflict::detect_conflict;
use super::error::{Error, Result};
use super::lifecycle::{self, LifecycleEvent};
use super::lock::AddressScope;
use super::nat::check_admission;
use super::rule::{PortRange, Protocol, Purpose, Rule, RuleDraft, RuleId, RuleKind};
use super::rule_constraints::purpose_implies_nat;
use super::store::RuleStore;
use super::topology::AddressInfo;
use crate::validators::validate_ports;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PortReservation {
    store: Arc<dyn RuleStore>,
}

impl PortReservation {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Reserves `ports` on `address` and returns the new rules in `Add`.
    ///
    /// Rules inherit network, account and domain from the address, and the
    /// NAT flag from its association (static NAT rules are always NAT rules).
    /// An empty port list reserves nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for port 0 or an address without owner
    /// - [`Error::InvalidState`] if the address has no network
    /// - [`Error::RuleConflict`] if the address's NAT mode refuses the
    ///   rules, or from the first conflicting port; no rule of the batch is
    ///   left behind
    pub async fn reserve(
        &self,
        scope: &AddressScope,
        address: &AddressInfo,
        protocol: &Protocol,
        purpose: Purpose,
        ports: &[u16],
    ) -> Result<Vec<Rule>> {
        scope.ensure_covers(address.id)?;
        validate_ports(ports).map_err(Error::InvalidInput)?;
        if ports.is_empty() {
            return Ok(Vec::new());
        }

        let (Some(account), Some(domain)) = (address.account, address.domain) else {
            return Err(Error::invalid_input(format!(
                "Ip address {} is not allocated",
                address.ip
            )));
        };
        let network = address.network.ok_or_else(|| {
            Error::invalid_state(format!(
                "Ip address {} is not associated with a network",
                address.ip
            ))
        })?;
        let one_to_one_nat = address.nat.one_to_one_nat || purpose_implies_nat(purpose);
        check_admission(address, purpose, one_to_one_nat, address.nat.nat_vm())?;

        let drafts = ports
            .iter()
            .map(|port| RuleDraft {
                source_address: address.id,
                source_ports: PortRange::single(*port),
                protocol: protocol.clone(),
                kind: RuleKind::bare(purpose),
                network,
                account,
                domain,
                one_to_one_nat,
            })
            .collect();
        let staged = self.store.persist_all(drafts).await?;
        let ids: Vec<RuleId> = staged.iter().map(|r| r.id).collect();

        match self.promote(staged).await {
            Ok(rules) => {
                info!(
                    "Reserved {} {} ports on ip address {}",
                    rules.len(),
                    protocol,
                    address.ip
                );
                Ok(rules)
            }
            Err(e) => {
                warn!(
                    "Rolling back reservation of {} ports on ip address {}: {}",
                    ids.len(),
                    address.ip,
                    e
                );
                if let Err(cleanup) = self.store.remove_all(&ids).await {
                    warn!("Failed to remove rejected reservation on {}: {}", address.ip, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn promote(&self, staged: Vec<Rule>) -> Result<Vec<Rule>> {
        let Some(first) = staged.first() else {
            return Ok(staged);
        };
        let existing = self
            .store
            .list_non_revoked_by_address(first.source_address, None)
            .await?;
        for rule in &staged {
            detect_conflict(rule, &existing)?;
        }

        let mut promoted = Vec::with_capacity(staged.len());
        for mut rule in staged {
            lifecycle::advance(&mut rule, LifecycleEvent::ConflictCheckPassed)?;
            self.store.update(&rule).await?;
            promoted.push(rule);
        }
        Ok(promoted)
    }

    /// Removes the single-port rules matching `protocol` and `purpose`.
    ///
    /// Returns `true` if every requested port had a rule to remove.
    pub async fn release(
        &self,
        scope: &AddressScope,
        address: &AddressInfo,
        protocol: &Protocol,
        purpose: Purpose,
        ports: &[u16],
    ) -> Result<bool> {
        scope.ensure_covers(address.id)?;
        let rules = self
            .store
            .list_non_revoked_by_address(address.id, None)
            .await?;

        let mut ids = Vec::new();
        let mut released_all = true;
        for port in ports {
            let before = ids.len();
            ids.extend(
                rules
                    .iter()
                    .filter(|r| {
                        r.purpose() == purpose
                            && r.protocol == *protocol
                            && r.source_ports == PortRange::single(*port)
                    })
                    .map(|r| r.id),
            );
            if ids.len() == before {
                debug!("No {} rule reserves port {} on {}", protocol, port, address.ip);
                released_all = false;
            }
        }

        self.store.remove_all(&ids).await?;
        Ok(released_all)
    }
}
