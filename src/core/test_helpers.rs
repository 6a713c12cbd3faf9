//! Shared test utilities for core module tests
//!
//! Provides a rule builder, a populated in-memory topology and a scripted
//! enforcement backend. This module is only compiled in test mode.

use crate::core::apply::EnforcementBackend;
use crate::core::error::{Error, Result};
use crate::core::rule::{
    AccountId, AddressId, DataCenterId, Destination, DomainId, NetworkId, PortRange, Protocol,
    Purpose, Rule, RuleDraft, RuleKind, RuleState, VmId,
};
use crate::core::topology::{
    AddressDirectory, AddressInfo, GuestType, MemoryTopology, NatAssociation, Network, Nic,
    VmInfo, VmState,
};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Installs a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Starts a firewall rule on `address`: tcp, port 22, network/account/domain 1.
///
/// This is the canonical helper for creating test rules.
pub fn rule_on(address: u64) -> RuleBuilder {
    RuleBuilder {
        draft: RuleDraft {
            source_address: AddressId(address),
            source_ports: PortRange::single(22),
            protocol: Protocol::tcp(),
            kind: RuleKind::Firewall,
            network: NetworkId(1),
            account: AccountId(1),
            domain: DomainId(1),
            one_to_one_nat: false,
        },
        state: RuleState::Staged,
    }
}

pub struct RuleBuilder {
    draft: RuleDraft,
    state: RuleState,
}

impl RuleBuilder {
    /// Port forwarding rule on `address` without a destination
    pub fn forwarding(address: u64) -> Self {
        rule_on(address).purpose(Purpose::PortForwarding)
    }

    pub fn purpose(mut self, purpose: Purpose) -> Self {
        self.draft.kind = RuleKind::bare(purpose);
        self
    }

    pub fn ports(mut self, start: u16, end: u16) -> Self {
        self.draft.source_ports = PortRange::new(start, end);
        self
    }

    pub fn protocol(mut self, name: &str) -> Self {
        self.draft.protocol = Protocol::new(name);
        self
    }

    pub fn network(mut self, network: u64) -> Self {
        self.draft.network = NetworkId(network);
        self
    }

    pub fn nat(mut self) -> Self {
        self.draft.one_to_one_nat = true;
        self
    }

    /// Points the destination at `vm` (10.1.1.10:8080); ignored for firewall rules.
    pub fn vm(mut self, vm: u64) -> Self {
        let destination = Some(Destination {
            address: IpAddr::V4(Ipv4Addr::new(10, 1, 1, 10)),
            ports: PortRange::single(8080),
            vm: Some(VmId(vm)),
        });
        self.draft.kind = match self.draft.kind {
            RuleKind::Firewall => RuleKind::Firewall,
            RuleKind::PortForwarding { .. } => RuleKind::PortForwarding { destination },
            RuleKind::StaticNat { .. } => RuleKind::StaticNat { destination },
        };
        self
    }

    /// State for [`RuleBuilder::build`]; drafts are always persisted `Staged`.
    pub fn state(mut self, state: RuleState) -> Self {
        self.state = state;
        self
    }

    pub fn draft(self) -> RuleDraft {
        self.draft
    }

    pub fn build(self) -> Rule {
        let mut rule = self.draft.into_staged();
        rule.state = self.state;
        rule
    }
}

/// In-memory topology with a handful of well-known records
///
/// - `ADDRESS`, `SECOND_ADDRESS`: allocated to account 1 on network 1
/// - `UNALLOCATED`: no owner
/// - `SOURCE_NAT`: allocated, source NAT
/// - `VM`, `OTHER_VM`: account 1, NICs on network 1 (10.1.1.0/24)
/// - `FOREIGN_VM`: account 2
pub struct Fixture {
    pub topology: Arc<MemoryTopology>,
}

impl Fixture {
    pub const ADDRESS: AddressId = AddressId(1);
    pub const SECOND_ADDRESS: AddressId = AddressId(2);
    pub const UNALLOCATED: AddressId = AddressId(3);
    pub const SOURCE_NAT: AddressId = AddressId(4);
    pub const NETWORK: NetworkId = NetworkId(1);
    pub const VM: VmId = VmId(100);
    pub const OTHER_VM: VmId = VmId(101);
    pub const FOREIGN_VM: VmId = VmId(200);

    pub fn address_info(id: AddressId) -> AddressInfo {
        let last = u8::try_from(id.0).unwrap_or(u8::MAX);
        AddressInfo {
            id,
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, last)),
            account: Some(AccountId(1)),
            domain: Some(DomainId(1)),
            data_center: DataCenterId(1),
            network: Some(Self::NETWORK),
            source_nat: false,
            ready: true,
            nat: NatAssociation::none(),
        }
    }

    pub fn new() -> Self {
        let topology = Arc::new(MemoryTopology::new());

        topology.add_address(Self::address_info(Self::ADDRESS)).unwrap();
        topology
            .add_address(Self::address_info(Self::SECOND_ADDRESS))
            .unwrap();
        topology
            .add_address(AddressInfo {
                account: None,
                domain: None,
                ..Self::address_info(Self::UNALLOCATED)
            })
            .unwrap();
        topology
            .add_address(AddressInfo {
                source_nat: true,
                ..Self::address_info(Self::SOURCE_NAT)
            })
            .unwrap();

        topology
            .add_network(Network {
                id: Self::NETWORK,
                account: AccountId(1),
                domain: DomainId(1),
                data_center: DataCenterId(1),
                guest_type: GuestType::Virtual,
                cidr: Some("10.1.1.0/24".parse().unwrap()),
            })
            .unwrap();

        for (vm, account, host) in [
            (Self::VM, 1, 10),
            (Self::OTHER_VM, 1, 11),
            (Self::FOREIGN_VM, 2, 12),
        ] {
            topology
                .add_vm(
                    VmInfo {
                        id: vm,
                        account: AccountId(account),
                        data_center: DataCenterId(1),
                        state: VmState::Running,
                    },
                    vec![Nic {
                        network: Self::NETWORK,
                        ipv4: Some(Ipv4Addr::new(10, 1, 1, host)),
                    }],
                )
                .unwrap();
        }

        Self { topology }
    }

    /// Current record of a fixture address
    pub async fn address(&self, id: AddressId) -> AddressInfo {
        self.topology.find_address(id).await.unwrap().unwrap()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// How [`ScriptedBackend`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Accept,
    Reject,
    Unavailable,
}

/// Enforcement backend that answers from a script and records batches
pub struct ScriptedBackend {
    mode: Mutex<BackendMode>,
    calls: AtomicUsize,
    batches: Mutex<Vec<(Vec<Rule>, bool)>>,
}

impl ScriptedBackend {
    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(BackendMode::Accept)
    }

    pub fn rejecting() -> Self {
        Self::new(BackendMode::Reject)
    }

    pub fn unavailable() -> Self {
        Self::new(BackendMode::Unavailable)
    }

    pub fn set_mode(&self, mode: BackendMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_batch(&self) -> Option<Vec<Rule>> {
        self.batches.lock().unwrap().last().map(|(rules, _)| rules.clone())
    }

    /// `continue_on_error` of the most recent push
    pub fn last_continue_on_error(&self) -> Option<bool> {
        self.batches.lock().unwrap().last().map(|(_, flag)| *flag)
    }
}

#[async_trait]
impl EnforcementBackend for ScriptedBackend {
    async fn apply(&self, rules: &[Rule], continue_on_error: bool) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .unwrap()
            .push((rules.to_vec(), continue_on_error));
        match *self.mode.lock().unwrap() {
            BackendMode::Accept => Ok(true),
            BackendMode::Reject => Ok(false),
            BackendMode::Unavailable => Err(Error::EnforcementUnavailable(
                "scripted backend is offline".to_string(),
            )),
        }
    }
}
