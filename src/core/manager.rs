//! Rules manager
//!
//! The entry point the service layer calls. It owns the per-address scopes
//! and wires conflict detection, the lifecycle, NAT exclusivity, port
//! reservation and the apply engine together.
//!
//! Rule creation follows persist-then-check: the candidate is stored
//! `Staged` first, then checked against every live rule on the address
//! (itself included), then promoted to `Add`. Nothing is pushed to the
//! enforcement backend until one of the apply operations runs.

use super::apply::{ApplyEngine, ApplyReport, BatchOutcome, EnforcementBackend};
use super::conflict::detect_conflict;
use super::error::{Error, Result};
use super::lifecycle::{self, LifecycleEvent, Step};
use super::lock::{AddressLocks, AddressScope};
use super::nat::{NatExclusivityGuard, check_admission};
use super::ports::PortReservation;
use super::rule::{
    AddressId, Destination, NetworkId, PortRange, Protocol, Purpose, Rule, RuleDraft, RuleId,
    RuleKind, VmId,
};
use super::rule_constraints::{purpose_has_destination, purpose_implies_nat};
use super::store::RuleStore;
use super::topology::{AddressDirectory, AddressInfo, GuestType, Network, NetworkTopology, Service};
use super::transfer::RuleTransfer;
use crate::audit::{AuditEvent, EventSink};
use crate::config::RulesConfig;
use crate::validators::{validate_port_range, validate_protocol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a forwarding or static NAT rule sends traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The VM's first virtual-guest NIC that has an IPv4 address
    Vm { vm: VmId, ports: PortRange },
    /// An explicit guest IP, which must lie in the network's CIDR when known
    Ip { address: IpAddr, ports: PortRange },
}

impl Target {
    fn ports(&self) -> PortRange {
        match self {
            Target::Vm { ports, .. } | Target::Ip { ports, .. } => *ports,
        }
    }
}

/// A request to create one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRequest {
    pub address: AddressId,
    pub source_ports: PortRange,
    pub protocol: String,
    pub purpose: Purpose,
    /// Required for forwarding and static NAT rules, refused for firewall rules
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub one_to_one_nat: bool,
}

impl RuleRequest {
    pub fn firewall(address: AddressId, source_ports: PortRange, protocol: &str) -> Self {
        Self {
            address,
            source_ports,
            protocol: protocol.to_string(),
            purpose: Purpose::Firewall,
            target: None,
            one_to_one_nat: false,
        }
    }

    pub fn forwarding(
        address: AddressId,
        source_ports: PortRange,
        protocol: &str,
        target: Target,
    ) -> Self {
        Self {
            address,
            source_ports,
            protocol: protocol.to_string(),
            purpose: Purpose::PortForwarding,
            target: Some(target),
            one_to_one_nat: false,
        }
    }
}

pub struct RulesManager {
    store: Arc<dyn RuleStore>,
    addresses: Arc<dyn AddressDirectory>,
    topology: Arc<dyn NetworkTopology>,
    events: Arc<dyn EventSink>,
    engine: Arc<ApplyEngine>,
    nat: NatExclusivityGuard,
    ports: PortReservation,
    locks: AddressLocks,
    config: RulesConfig,
}

impl RulesManager {
    pub fn new(
        store: Arc<dyn RuleStore>,
        addresses: Arc<dyn AddressDirectory>,
        topology: Arc<dyn NetworkTopology>,
        backend: Arc<dyn EnforcementBackend>,
        events: Arc<dyn EventSink>,
        config: RulesConfig,
    ) -> Self {
        let engine = Arc::new(ApplyEngine::new(Arc::clone(&store), backend));
        let nat = NatExclusivityGuard::new(
            Arc::clone(&store),
            Arc::clone(&addresses),
            Arc::clone(&topology),
            Arc::clone(&engine),
            Arc::clone(&events),
        );
        let ports = PortReservation::new(Arc::clone(&store));
        Self {
            store,
            addresses,
            topology,
            events,
            engine,
            nat,
            ports,
            locks: AddressLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Creation
    // ═══════════════════════════════════════════════════════════════════════

    /// Creates a rule and leaves it in `Add`, ready for the next apply.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for malformed ports or protocol, unknown or
    ///   unallocated addresses, unusable destinations, or protocols the
    ///   network does not support
    /// - [`Error::InvalidState`] if the address has no network or already
    ///   holds the configured maximum of rules
    /// - [`Error::RuleConflict`] from NAT admission or conflict detection;
    ///   the staged record is removed again
    pub async fn create_rule(&self, request: RuleRequest) -> Result<Rule> {
        validate_port_range(request.source_ports.start, request.source_ports.end)
            .map_err(Error::InvalidInput)?;
        if let Some(target) = &request.target {
            let ports = target.ports();
            validate_port_range(ports.start, ports.end).map_err(Error::InvalidInput)?;
        }
        let protocol =
            Protocol::new(&validate_protocol(&request.protocol).map_err(Error::InvalidInput)?);

        let scope = self.locks.scope(request.address).await;
        let address = self.addresses.require_allocated(request.address).await?;
        let (network, destination) = self
            .resolve_target(&address, request.purpose, request.target)
            .await?;

        let one_to_one_nat = request.one_to_one_nat || purpose_implies_nat(request.purpose);
        check_admission(
            &address,
            request.purpose,
            one_to_one_nat,
            destination.as_ref().and_then(|d| d.vm),
        )?;
        self.check_protocol_supported(&network, request.purpose, &protocol)
            .await?;
        self.check_rule_limit(&address).await?;

        let kind = match request.purpose {
            Purpose::Firewall => RuleKind::Firewall,
            Purpose::PortForwarding => RuleKind::PortForwarding { destination },
            Purpose::StaticNat => RuleKind::StaticNat { destination },
        };
        let staged = self
            .store
            .persist(RuleDraft {
                source_address: address.id,
                source_ports: request.source_ports,
                protocol,
                kind,
                network: network.id,
                account: network.account,
                domain: network.domain,
                one_to_one_nat,
            })
            .await?;

        match self.admit(&scope, staged.clone()).await {
            Ok(rule) => {
                info!("Created {}", rule);
                self.events.record(AuditEvent::rule_created(&rule)).await;
                Ok(rule)
            }
            Err(e) => {
                if let Err(cleanup) = self.discard(&staged).await {
                    warn!("Failed to remove rejected rule {}: {}", staged.id, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn resolve_target(
        &self,
        address: &AddressInfo,
        purpose: Purpose,
        target: Option<Target>,
    ) -> Result<(Network, Option<Destination>)> {
        let Some(target) = target else {
            if purpose_has_destination(purpose) {
                return Err(Error::invalid_input(format!(
                    "{purpose} rules require a destination"
                )));
            }
            return Ok((self.address_network(address).await?, None));
        };
        if !purpose_has_destination(purpose) {
            return Err(Error::invalid_input("Firewall rules cannot have a destination"));
        }

        match target {
            Target::Ip { address: ip, ports } => {
                let network = self.address_network(address).await?;
                if !network.accepts(ip) {
                    return Err(Error::invalid_input(format!(
                        "Destination ip {ip} is outside the cidr of network {}",
                        network.id
                    )));
                }
                Ok((
                    network,
                    Some(Destination {
                        address: ip,
                        ports,
                        vm: None,
                    }),
                ))
            }
            Target::Vm { vm, ports } => {
                let info = self.topology.find_vm(vm).await?.ok_or_else(|| {
                    Error::invalid_input(format!("Unable to find virtual machine {vm}"))
                })?;
                if info.state.is_gone() {
                    return Err(Error::invalid_input(format!(
                        "Virtual machine {vm} is {} and cannot receive traffic",
                        info.state
                    )));
                }
                if address.account != Some(info.account) {
                    return Err(Error::invalid_input(format!(
                        "Virtual machine {vm} and ip address {} belong to different accounts",
                        address.ip
                    )));
                }
                if address.data_center != info.data_center {
                    return Err(Error::invalid_input(format!(
                        "Virtual machine {vm} and ip address {} are in different zones",
                        address.ip
                    )));
                }

                for nic in self.topology.nics(vm).await? {
                    let Some(ipv4) = nic.ipv4 else { continue };
                    let Some(network) = self.topology.find_network(nic.network).await? else {
                        continue;
                    };
                    if network.guest_type == GuestType::Virtual {
                        return Ok((
                            network,
                            Some(Destination {
                                address: IpAddr::V4(ipv4),
                                ports,
                                vm: Some(vm),
                            }),
                        ));
                    }
                }
                Err(Error::invalid_input(format!(
                    "Virtual machine {vm} has no virtual guest nic with an ipv4 address"
                )))
            }
        }
    }

    async fn address_network(&self, address: &AddressInfo) -> Result<Network> {
        let id = address.network.ok_or_else(|| {
            Error::invalid_state(format!(
                "Ip address {} is not associated with a network",
                address.ip
            ))
        })?;
        self.topology
            .find_network(id)
            .await?
            .ok_or_else(|| Error::invalid_input(format!("Unable to find network {id}")))
    }

    async fn check_protocol_supported(
        &self,
        network: &Network,
        purpose: Purpose,
        protocol: &Protocol,
    ) -> Result<()> {
        if let Some(capabilities) = self
            .topology
            .capabilities_for(network.id, Service::from(purpose))
            .await?
            && !capabilities.supports(protocol)
        {
            return Err(Error::invalid_input(format!(
                "Protocol {protocol} is not supported in zone {}",
                network.data_center
            )));
        }
        Ok(())
    }

    async fn check_rule_limit(&self, address: &AddressInfo) -> Result<()> {
        let max = self.config.max_rules_per_address;
        if max == 0 {
            return Ok(());
        }
        let count = self
            .store
            .list_non_revoked_by_address(address.id, None)
            .await?
            .len();
        if count >= max {
            return Err(Error::invalid_state(format!(
                "Ip address {} already has {count} rules (limit {max})",
                address.ip
            )));
        }
        Ok(())
    }

    /// Conflict-checks a staged rule and promotes it to `Add`.
    async fn admit(&self, scope: &AddressScope, mut rule: Rule) -> Result<Rule> {
        scope.ensure_covers(rule.source_address)?;
        let existing = self
            .store
            .list_non_revoked_by_address(rule.source_address, None)
            .await?;
        detect_conflict(&rule, &existing)?;

        lifecycle::advance(&mut rule, LifecycleEvent::ConflictCheckPassed)?;
        if !self.store.update(&rule).await? {
            return Err(Error::Internal(format!(
                "rule {} disappeared during admission",
                rule.id
            )));
        }
        Ok(rule)
    }

    async fn discard(&self, rule: &Rule) -> Result<()> {
        if lifecycle::next(rule.state, LifecycleEvent::ConflictCheckFailed)? == Step::Delete {
            self.store.remove(rule.id).await?;
            debug!("Removed rejected {}", rule);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Revocation
    // ═══════════════════════════════════════════════════════════════════════

    /// Marks a rule for removal and, with `apply`, pushes the removal.
    ///
    /// Returns `Ok(false)` if the push failed; the rule then stays in
    /// `Revoke` until a later apply.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for unknown rules.
    pub async fn revoke_rule(&self, id: RuleId, apply: bool) -> Result<bool> {
        let rule = self.require_rule(id).await?;
        let scope = self.locks.scope(rule.source_address).await;
        // A concurrent revocation may have removed it while we waited
        let rule = self.require_rule(id).await?;

        let revoked = self.revoke_one(&scope, rule).await?;
        let success = if apply {
            self.engine
                .flush(&scope, revoked.source_address, self.config.revoke_continue_on_error)
                .await?
        } else {
            true
        };

        if success {
            self.events.record(AuditEvent::rule_deleted(&revoked)).await;
        }
        Ok(success)
    }

    /// Revokes every rule whose destination is `vm` and pushes the changes.
    ///
    /// Returns `Ok(false)` for unknown VMs and when any push failed.
    pub async fn revoke_rules_for_vm(&self, vm: VmId) -> Result<bool> {
        if self.topology.find_vm(vm).await?.is_none() {
            debug!("Unable to find vm {}; no rules revoked", vm);
            return Ok(false);
        }

        let addresses: BTreeSet<AddressId> = self
            .store
            .list_by_vm(vm)
            .await?
            .iter()
            .map(|r| r.source_address)
            .collect();
        let scope = self.locks.scope_all(addresses).await;

        let mut revoked = Vec::new();
        for rule in self.store.list_by_vm(vm).await? {
            if !scope.covers(rule.source_address) {
                debug!("Skipping {} created while revoking for vm {}", rule, vm);
                continue;
            }
            if !rule.is_revoked() {
                revoked.push(self.revoke_one(&scope, rule).await?);
            }
        }

        let mut success = true;
        for address in scope.addresses() {
            success &= self
                .engine
                .flush(&scope, *address, self.config.revoke_continue_on_error)
                .await?;
        }

        info!(
            "Revoked {} rules for vm {} (pushed: {})",
            revoked.len(),
            vm,
            success
        );
        if success {
            for rule in &revoked {
                self.events.record(AuditEvent::rule_deleted(rule)).await;
            }
        }
        Ok(success)
    }

    /// Revokes every rule on `address` and pushes the changes.
    ///
    /// Returns `true` when the push succeeded and no live rule remains.
    pub async fn revoke_all_rules(&self, address: AddressId) -> Result<bool> {
        let scope = self.locks.scope(address).await;

        let mut revoked = Vec::new();
        for rule in self.store.list_non_revoked_by_address(address, None).await? {
            revoked.push(self.revoke_one(&scope, rule).await?);
        }

        let flushed = self
            .engine
            .flush(&scope, address, self.config.revoke_continue_on_error)
            .await?;
        if flushed {
            for rule in &revoked {
                self.events.record(AuditEvent::rule_deleted(rule)).await;
            }
        }

        let remaining = self
            .store
            .list_non_revoked_by_address(address, None)
            .await?
            .len();
        debug!(
            "Revoked {} rules on address {}, {} remaining",
            revoked.len(),
            address,
            remaining
        );
        Ok(flushed && remaining == 0)
    }

    async fn revoke_one(&self, scope: &AddressScope, mut rule: Rule) -> Result<Rule> {
        scope.ensure_covers(rule.source_address)?;
        match lifecycle::advance(&mut rule, LifecycleEvent::RevokeRequested)? {
            Step::Transition(_) => {
                self.store.update(&rule).await?;
            }
            Step::Delete => {
                self.store.remove(rule.id).await?;
                debug!("Deleted never-admitted {}", rule);
            }
            Step::Unchanged => {}
        }
        Ok(rule)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Apply
    // ═══════════════════════════════════════════════════════════════════════

    /// Pushes every pending rule of `address` in one batch.
    ///
    /// # Errors
    ///
    /// [`Error::EnforcementUnavailable`] when the backend cannot be reached.
    pub async fn apply_rules(
        &self,
        address: AddressId,
        continue_on_error: bool,
    ) -> Result<ApplyReport> {
        let scope = self.locks.scope(address).await;
        let pending = self.store.list_for_application(address).await?;
        self.apply_batch(&scope, pending, continue_on_error).await
    }

    /// [`RulesManager::apply_rules`] with the configured error policy
    pub async fn apply_pending(&self, address: AddressId) -> Result<ApplyReport> {
        self.apply_rules(address, self.config.apply_continue_on_error)
            .await
    }

    /// Pushes the pending rules of every address that has rules on `network`.
    pub async fn apply_rules_for_network(
        &self,
        network: NetworkId,
        continue_on_error: bool,
    ) -> Result<ApplyReport> {
        let addresses: BTreeSet<AddressId> = self
            .store
            .list_by_network(network)
            .await?
            .iter()
            .map(|r| r.source_address)
            .collect();
        let scope = self.locks.scope_all(addresses).await;

        let mut pending = Vec::new();
        for address in scope.addresses() {
            pending.extend(
                self.store
                    .list_for_application(*address)
                    .await?
                    .into_iter()
                    .filter(|r| r.network == network),
            );
        }
        self.apply_batch(&scope, pending, continue_on_error).await
    }

    async fn apply_batch(
        &self,
        scope: &AddressScope,
        pending: Vec<Rule>,
        continue_on_error: bool,
    ) -> Result<ApplyReport> {
        let count = pending.len();
        match self.engine.apply(scope, pending, continue_on_error).await {
            Ok(report) => {
                if report.outcome != BatchOutcome::Empty {
                    self.events
                        .record(AuditEvent::rules_applied(count, report.success(), None))
                        .await;
                }
                Ok(report)
            }
            Err(e) => {
                self.events
                    .record(AuditEvent::rules_applied(count, false, Some(e.to_string())))
                    .await;
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NAT & Reservations
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn enable_one_to_one_nat(&self, address: AddressId, vm: VmId) -> Result<()> {
        let scope = self.locks.scope(address).await;
        self.nat.enable(&scope, address, vm).await
    }

    /// Returns `Ok(false)` when the revoked NAT rules could not be pushed.
    pub async fn disable_one_to_one_nat(&self, address: AddressId) -> Result<bool> {
        let scope = self.locks.scope(address).await;
        self.nat
            .disable(&scope, address, self.config.revoke_continue_on_error)
            .await
    }

    pub async fn reserve_ports(
        &self,
        address: AddressId,
        protocol: &str,
        purpose: Purpose,
        ports: &[u16],
    ) -> Result<Vec<Rule>> {
        let protocol = Protocol::new(&validate_protocol(protocol).map_err(Error::InvalidInput)?);
        let scope = self.locks.scope(address).await;
        let info = self.addresses.require_allocated(address).await?;
        self.ports
            .reserve(&scope, &info, &protocol, purpose, ports)
            .await
    }

    /// Returns `true` if every port had a reservation to release.
    pub async fn release_ports(
        &self,
        address: AddressId,
        protocol: &str,
        purpose: Purpose,
        ports: &[u16],
    ) -> Result<bool> {
        let protocol = Protocol::new(&validate_protocol(protocol).map_err(Error::InvalidInput)?);
        let scope = self.locks.scope(address).await;
        let info = self.addresses.require_allocated(address).await?;
        self.ports
            .release(&scope, &info, &protocol, purpose, ports)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        self.store.find_by_id(id).await
    }

    async fn require_rule(&self, id: RuleId) -> Result<Rule> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::invalid_input(format!("Unable to find rule {id}")))
    }

    /// Live (non-revoked) rules on `address`
    pub async fn list_rules(&self, address: AddressId) -> Result<Vec<Rule>> {
        self.store.list_non_revoked_by_address(address, None).await
    }

    /// Rules on `address` the backend should see
    pub async fn list_rules_for_application(&self, address: AddressId) -> Result<Vec<Rule>> {
        self.store.list_for_application(address).await
    }

    /// Live forwarding and static NAT rules, optionally filtered on the NAT flag
    pub async fn list_forwarding_rules(
        &self,
        address: AddressId,
        one_to_one_nat: Option<bool>,
    ) -> Result<Vec<Rule>> {
        Ok(self
            .store
            .list_non_revoked_by_address(address, one_to_one_nat)
            .await?
            .into_iter()
            .filter(|r| purpose_has_destination(r.purpose()))
            .collect())
    }

    /// Collects the rules to push for several addresses, skipping those that
    /// are unknown or not ready.
    pub async fn gather_rules_for_application(
        &self,
        addresses: &[AddressId],
    ) -> Result<Vec<Rule>> {
        let mut rules = Vec::new();
        for id in addresses {
            match self.addresses.find_address(*id).await? {
                Some(address) if address.ready => {
                    rules.extend(self.store.list_for_application(*id).await?);
                }
                Some(address) => debug!("Skipping ip address {}: not ready", address.ip),
                None => debug!("Skipping unknown address {}", id),
            }
        }
        Ok(rules)
    }

    /// `true` if `rule` is the only live one-to-one NAT rule on its address.
    pub async fn is_last_one_to_one_nat_rule(&self, rule: &Rule) -> Result<bool> {
        if !rule.one_to_one_nat {
            return Ok(false);
        }
        let nat_rules = self
            .store
            .list_non_revoked_by_address(rule.source_address, Some(true))
            .await?;
        Ok(!nat_rules.iter().any(|r| r.id != rule.id))
    }

    /// Builds the enforcement view of `rules`, resolving public IPs.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] if a rule's address no longer exists.
    pub async fn build_transfer_rules(&self, rules: &[Rule]) -> Result<Vec<RuleTransfer>> {
        let mut ips: HashMap<AddressId, IpAddr> = HashMap::new();
        let mut transfers = Vec::with_capacity(rules.len());
        for rule in rules {
            let ip = match ips.get(&rule.source_address) {
                Some(ip) => *ip,
                None => {
                    let address = self
                        .addresses
                        .find_address(rule.source_address)
                        .await?
                        .ok_or_else(|| {
                            Error::invalid_input(format!(
                                "Unable to find ip address {}",
                                rule.source_address
                            ))
                        })?;
                    ips.insert(address.id, address.ip);
                    address.ip
                }
            };
            transfers.push(RuleTransfer::new(rule, ip));
        }
        Ok(transfers)
    }
}
