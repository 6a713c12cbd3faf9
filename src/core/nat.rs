//! One-to-one NAT exclusivity
//!
//! A public address is either in one-to-one NAT mode, mapped to exactly one
//! VM and carrying no independent rules, or in shared mode with any number
//! of port-scoped rules and no mapping. The guard toggles between the two
//! and decides which new rules an address in either mode may admit.

use super::apply::ApplyEngine;
use super::error::{ConflictReason, Error, Result};
use super::lifecycle::{self, LifecycleEvent, Step};
use super::lock::AddressScope;
use super::rule::{AddressId, Purpose, VmId};
use super::store::RuleStore;
use super::topology::{AddressDirectory, AddressInfo, NatAssociation, NetworkTopology};
use crate::audit::{AuditEvent, EventSink};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides whether a rule may be created on `address` given its NAT mode.
///
/// `one_to_one_nat` is the new rule's NAT flag and `vm` the VM its
/// destination resolves to, if any. A NAT rule must serve the VM the
/// address is mapped to.
///
/// # Errors
///
/// [`Error::RuleConflict`] when the rule would break NAT exclusivity.
pub fn check_admission(
    address: &AddressInfo,
    purpose: Purpose,
    one_to_one_nat: bool,
    vm: Option<VmId>,
) -> Result<()> {
    if !one_to_one_nat {
        if address.nat.one_to_one_nat {
            return Err(Error::conflict(
                ConflictReason::NatExclusivity,
                None,
                format!(
                    "Can't create rule on ip address {}; one to one nat is enabled on it",
                    address.ip
                ),
            ));
        }
        return Ok(());
    }

    if purpose == Purpose::Firewall {
        return Err(Error::conflict(
            ConflictReason::NatExclusivity,
            None,
            format!(
                "Firewall rules on ip address {} can't be one to one nat rules",
                address.ip
            ),
        ));
    }
    if address.source_nat {
        return Err(Error::conflict(
            ConflictReason::NatExclusivity,
            None,
            format!(
                "Can't create one to one nat rule on source nat ip address {}",
                address.ip
            ),
        ));
    }
    match address.nat.nat_vm() {
        None => Err(Error::conflict(
            ConflictReason::NatExclusivity,
            None,
            format!("One to one nat is not enabled for ip address {}", address.ip),
        )),
        Some(mapped) if vm != Some(mapped) => Err(Error::conflict(
            ConflictReason::VmMismatch,
            None,
            format!(
                "Ip address {} is mapped to vm {}, not to the rule's destination",
                address.ip, mapped
            ),
        )),
        Some(_) => Ok(()),
    }
}

pub struct NatExclusivityGuard {
    store: Arc<dyn RuleStore>,
    addresses: Arc<dyn AddressDirectory>,
    topology: Arc<dyn NetworkTopology>,
    engine: Arc<ApplyEngine>,
    events: Arc<dyn EventSink>,
}

impl NatExclusivityGuard {
    pub fn new(
        store: Arc<dyn RuleStore>,
        addresses: Arc<dyn AddressDirectory>,
        topology: Arc<dyn NetworkTopology>,
        engine: Arc<ApplyEngine>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            addresses,
            topology,
            engine,
            events,
        }
    }

    /// Maps `address` one-to-one onto `vm`.
    ///
    /// Enabling the same mapping twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for unknown/unallocated addresses, unknown
    ///   or destroyed VMs, or an address and VM in different accounts or
    ///   data centers
    /// - [`Error::InvalidState`] for source-NAT addresses
    /// - [`Error::RuleConflict`] if the address carries independent rules or
    ///   is mapped to another VM
    pub async fn enable(&self, scope: &AddressScope, address: AddressId, vm: VmId) -> Result<()> {
        scope.ensure_covers(address)?;
        let info = self.addresses.require_allocated(address).await?;

        let vm_info = self.topology.find_vm(vm).await?.ok_or_else(|| {
            Error::invalid_input(format!(
                "Can't enable static nat for the address id={address}, invalid virtual machine id specified ({vm})"
            ))
        })?;
        if vm_info.state.is_gone() {
            return Err(Error::invalid_input(format!(
                "Can't enable static nat for vm {vm} in state {}",
                vm_info.state
            )));
        }
        if info.account != Some(vm_info.account) {
            return Err(Error::invalid_input(format!(
                "Ip address {} and vm {vm} belong to different accounts",
                info.ip
            )));
        }
        if info.data_center != vm_info.data_center {
            return Err(Error::invalid_input(format!(
                "Ip address {} and vm {vm} are in different zones",
                info.ip
            )));
        }
        if info.source_nat {
            return Err(Error::invalid_state(format!(
                "Can't enable static nat on source nat ip address {}",
                info.ip
            )));
        }

        match info.nat.nat_vm() {
            Some(mapped) if mapped == vm => {
                debug!("Ip address {} is already mapped to vm {}", info.ip, vm);
                return Ok(());
            }
            Some(mapped) => {
                return Err(Error::conflict(
                    ConflictReason::VmMismatch,
                    None,
                    format!(
                        "Failed to enable static nat for ip address {}: already mapped to vm {mapped}",
                        info.ip
                    ),
                ));
            }
            None => {}
        }

        let independent = self
            .store
            .list_non_revoked_by_address(address, Some(false))
            .await?;
        if let Some(existing) = independent.first() {
            return Err(Error::conflict(
                ConflictReason::NatExclusivity,
                Some(existing.id),
                format!(
                    "Failed to enable static nat for ip address {}: {} rules are still assigned to it",
                    info.ip,
                    independent.len()
                ),
            ));
        }

        if !self
            .addresses
            .update_nat(address, NatAssociation::one_to_one(vm))
            .await?
        {
            return Err(Error::Internal(format!(
                "address {address} disappeared while enabling static nat"
            )));
        }
        info!("Enabled one to one nat for ip address {} -> vm {}", info.ip, vm);
        self.events.record(AuditEvent::nat_enabled(address, vm)).await;
        Ok(())
    }

    /// Revokes the address's NAT rules, pushes them, and clears the mapping.
    ///
    /// Returns `Ok(false)` when the push failed; the mapping then stays in
    /// place and the rules stay in `Revoke` until a later apply.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for unknown or unallocated addresses
    /// - [`Error::InvalidState`] if one-to-one NAT is not enabled
    pub async fn disable(
        &self,
        scope: &AddressScope,
        address: AddressId,
        continue_on_error: bool,
    ) -> Result<bool> {
        scope.ensure_covers(address)?;
        let info = self.addresses.require_allocated(address).await?;
        if info.nat.nat_vm().is_none() {
            return Err(Error::invalid_state(format!(
                "One to one nat is not enabled for ip address {}",
                info.ip
            )));
        }

        let nat_rules = self
            .store
            .list_non_revoked_by_address(address, Some(true))
            .await?;
        debug!(
            "Revoking {} one to one nat rules on ip address {}",
            nat_rules.len(),
            info.ip
        );
        for mut rule in nat_rules {
            match lifecycle::advance(&mut rule, LifecycleEvent::RevokeRequested)? {
                Step::Transition(_) => {
                    self.store.update(&rule).await?;
                }
                Step::Delete => {
                    self.store.remove(rule.id).await?;
                }
                Step::Unchanged => {}
            }
            self.events.record(AuditEvent::rule_deleted(&rule)).await;
        }

        let flushed = self.engine.flush(scope, address, continue_on_error).await?;
        if flushed {
            self.addresses.update_nat(address, NatAssociation::none()).await?;
            info!("Disabled one to one nat for ip address {}", info.ip);
        } else {
            warn!(
                "Keeping one to one nat on ip address {}: revoked rules were not applied",
                info.ip
            );
        }
        self.events
            .record(AuditEvent::nat_disabled(address, flushed))
            .await;
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, MemorySink};
    use crate::core::lock::AddressLocks;
    use crate::core::rule::RuleState;
    use crate::core::store::MemoryRuleStore;
    use crate::core::test_helpers::{Fixture, ScriptedBackend, init_tracing, rule_on};
    use crate::core::topology::VmState;

    struct Harness {
        guard: NatExclusivityGuard,
        store: Arc<MemoryRuleStore>,
        fixture: Fixture,
        backend: Arc<ScriptedBackend>,
        events: Arc<MemorySink>,
        locks: AddressLocks,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        init_tracing();
        let fixture = Fixture::new();
        let store = Arc::new(MemoryRuleStore::new());
        let backend = Arc::new(backend);
        let events = Arc::new(MemorySink::new());
        let engine = Arc::new(ApplyEngine::new(store.clone(), backend.clone()));
        let guard = NatExclusivityGuard::new(
            store.clone(),
            fixture.topology.clone(),
            fixture.topology.clone(),
            engine,
            events.clone(),
        );
        Harness {
            guard,
            store,
            fixture,
            backend,
            events,
            locks: AddressLocks::new(),
        }
    }

    #[tokio::test]
    async fn test_enable_is_idempotent_for_same_vm() {
        let h = harness(ScriptedBackend::accepting());
        let scope = h.locks.scope(Fixture::ADDRESS).await;

        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();
        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();

        let info = h.fixture.address(Fixture::ADDRESS).await;
        assert_eq!(info.nat, NatAssociation::one_to_one(Fixture::VM));
        assert_eq!(h.events.count(EventType::NatEnabled), 1);
    }

    #[tokio::test]
    async fn test_enable_for_other_vm_conflicts() {
        let h = harness(ScriptedBackend::accepting());
        let scope = h.locks.scope(Fixture::ADDRESS).await;
        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();

        let err = h
            .guard
            .enable(&scope, Fixture::ADDRESS, Fixture::OTHER_VM)
            .await
            .unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::VmMismatch));
    }

    #[tokio::test]
    async fn test_enable_with_independent_rules_conflicts() {
        let h = harness(ScriptedBackend::accepting());
        let existing = h
            .store
            .persist(rule_on(Fixture::ADDRESS.0).draft())
            .await
            .unwrap();
        let scope = h.locks.scope(Fixture::ADDRESS).await;

        match h
            .guard
            .enable(&scope, Fixture::ADDRESS, Fixture::VM)
            .await
            .unwrap_err()
        {
            Error::RuleConflict {
                reason, conflicting, ..
            } => {
                assert_eq!(reason, ConflictReason::NatExclusivity);
                assert_eq!(conflicting, Some(existing.id));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_enable_validates_vm_and_address() {
        let h = harness(ScriptedBackend::accepting());
        let scope = h
            .locks
            .scope_all([Fixture::ADDRESS, Fixture::UNALLOCATED, Fixture::SOURCE_NAT])
            .await;

        let err = h.guard.enable(&scope, Fixture::ADDRESS, VmId(404)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = h
            .guard
            .enable(&scope, Fixture::UNALLOCATED, Fixture::VM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = h
            .guard
            .enable(&scope, Fixture::ADDRESS, Fixture::FOREIGN_VM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = h
            .guard
            .enable(&scope, Fixture::SOURCE_NAT, Fixture::VM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        h.fixture.topology.set_vm_state(Fixture::VM, VmState::Expunging).unwrap();
        let err = h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_disable_without_nat_is_invalid_state() {
        let h = harness(ScriptedBackend::accepting());
        let scope = h.locks.scope(Fixture::ADDRESS).await;
        let err = h.guard.disable(&scope, Fixture::ADDRESS, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_disable_revokes_and_clears_on_success() {
        let h = harness(ScriptedBackend::accepting());
        let scope = h.locks.scope(Fixture::ADDRESS).await;
        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();

        let mut nat = h
            .store
            .persist(
                rule_on(Fixture::ADDRESS.0)
                    .purpose(Purpose::StaticNat)
                    .nat()
                    .ports(1, 65535)
                    .draft(),
            )
            .await
            .unwrap();
        nat.state = RuleState::Active;
        h.store.update(&nat).await.unwrap();

        assert!(h.guard.disable(&scope, Fixture::ADDRESS, true).await.unwrap());
        assert!(h.store.is_empty());
        assert_eq!(h.backend.calls(), 1);
        assert_eq!(h.events.count(EventType::RuleDeleted), 1);
        let info = h.fixture.address(Fixture::ADDRESS).await;
        assert_eq!(info.nat, NatAssociation::none());
    }

    #[tokio::test]
    async fn test_disable_keeps_association_when_push_fails() {
        let h = harness(ScriptedBackend::rejecting());
        let scope = h.locks.scope(Fixture::ADDRESS).await;
        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();

        let mut nat = h
            .store
            .persist(rule_on(Fixture::ADDRESS.0).purpose(Purpose::StaticNat).nat().draft())
            .await
            .unwrap();
        nat.state = RuleState::Active;
        h.store.update(&nat).await.unwrap();

        assert!(!h.guard.disable(&scope, Fixture::ADDRESS, true).await.unwrap());
        let stored = h.store.find_by_id(nat.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RuleState::Revoke);
        let info = h.fixture.address(Fixture::ADDRESS).await;
        assert_eq!(info.nat, NatAssociation::one_to_one(Fixture::VM));
    }

    #[tokio::test]
    async fn test_disable_reports_false_when_backend_unreachable() {
        let h = harness(ScriptedBackend::unavailable());
        let scope = h.locks.scope(Fixture::ADDRESS).await;
        h.guard.enable(&scope, Fixture::ADDRESS, Fixture::VM).await.unwrap();
        let mut nat = h
            .store
            .persist(rule_on(Fixture::ADDRESS.0).purpose(Purpose::StaticNat).nat().draft())
            .await
            .unwrap();
        nat.state = RuleState::Active;
        h.store.update(&nat).await.unwrap();

        assert!(!h.guard.disable(&scope, Fixture::ADDRESS, true).await.unwrap());
    }

    #[test]
    fn test_admission_rules() {
        let forwarding = Purpose::PortForwarding;
        let mut info = Fixture::address_info(Fixture::ADDRESS);

        assert!(check_admission(&info, Purpose::Firewall, false, None).is_ok());
        let err = check_admission(&info, forwarding, true, Some(Fixture::VM)).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::NatExclusivity));

        info.nat = NatAssociation::one_to_one(Fixture::VM);
        assert!(check_admission(&info, forwarding, true, Some(Fixture::VM)).is_ok());
        assert!(check_admission(&info, Purpose::StaticNat, true, Some(Fixture::VM)).is_ok());
        let err = check_admission(&info, Purpose::Firewall, false, None).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::NatExclusivity));
        let err = check_admission(&info, forwarding, true, Some(Fixture::OTHER_VM)).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::VmMismatch));

        info.source_nat = true;
        assert!(check_admission(&info, forwarding, true, Some(Fixture::VM)).is_err());
    }

    #[test]
    fn test_nat_rules_must_serve_the_mapped_vm() {
        let mut info = Fixture::address_info(Fixture::ADDRESS);
        info.nat = NatAssociation::one_to_one(Fixture::VM);

        let err = check_admission(&info, Purpose::PortForwarding, true, None).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::VmMismatch));

        let err =
            check_admission(&info, Purpose::Firewall, true, Some(Fixture::VM)).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(ConflictReason::NatExclusivity));
    }
}
