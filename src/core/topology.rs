//! Address, network and VM lookups
//!
//! Topology is owned by other services. The rules core only reads it through
//! [`AddressDirectory`] and [`NetworkTopology`], plus one write: the NAT
//! association of an address, which only the NAT toggle operations change.

use super::error::{Error, Result};
use super::rule::{AccountId, AddressId, DataCenterId, DomainId, NetworkId, Protocol, Purpose, VmId};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};

/// One-to-one NAT association of a public address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatAssociation {
    pub one_to_one_nat: bool,
    pub vm: Option<VmId>,
}

impl NatAssociation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn one_to_one(vm: VmId) -> Self {
        Self {
            one_to_one_nat: true,
            vm: Some(vm),
        }
    }

    /// VM the address is mapped to, when in one-to-one NAT mode
    pub fn nat_vm(&self) -> Option<VmId> {
        if self.one_to_one_nat { self.vm } else { None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub id: AddressId,
    pub ip: IpAddr,
    /// Owning account; `None` while the address is unallocated
    pub account: Option<AccountId>,
    pub domain: Option<DomainId>,
    pub data_center: DataCenterId,
    /// Guest network the address is associated with, if any
    pub network: Option<NetworkId>,
    /// Source-NAT addresses can never carry a one-to-one NAT mapping
    pub source_nat: bool,
    /// Whether the address can currently receive enforcement pushes
    pub ready: bool,
    pub nat: NatAssociation,
}

impl AddressInfo {
    pub fn is_allocated(&self) -> bool {
        self.account.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum GuestType {
    Virtual,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub account: AccountId,
    pub domain: DomainId,
    pub data_center: DataCenterId,
    pub guest_type: GuestType,
    pub cidr: Option<IpNetwork>,
}

impl Network {
    /// Returns `false` only when a CIDR is known and `ip` is outside it.
    pub fn accepts(&self, ip: IpAddr) -> bool {
        self.cidr.is_none_or(|cidr| cidr.contains(ip))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Expunging,
}

impl VmState {
    /// Destroyed and expunging VMs cannot be the target of new rules.
    pub fn is_gone(self) -> bool {
        matches!(self, VmState::Destroyed | VmState::Expunging)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: VmId,
    pub account: AccountId,
    pub data_center: DataCenterId,
    pub state: VmState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub network: NetworkId,
    pub ipv4: Option<Ipv4Addr>,
}

/// Network service a rule is provided by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Service {
    Firewall,
    PortForwarding,
    StaticNat,
}

impl From<Purpose> for Service {
    fn from(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Firewall => Service::Firewall,
            Purpose::PortForwarding => Service::PortForwarding,
            Purpose::StaticNat => Service::StaticNat,
        }
    }
}

/// What a network's service provider can enforce
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supported_protocols: Vec<Protocol>,
}

impl Capabilities {
    pub fn supports(&self, protocol: &Protocol) -> bool {
        self.supported_protocols.contains(protocol)
    }
}

#[async_trait]
pub trait AddressDirectory: Send + Sync {
    async fn find_address(&self, id: AddressId) -> Result<Option<AddressInfo>>;

    /// Replaces the NAT association. Returns `false` for unknown addresses.
    async fn update_nat(&self, id: AddressId, nat: NatAssociation) -> Result<bool>;

    /// Looks up an address that exists and is allocated to an account.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for unknown or unallocated addresses.
    async fn require_allocated(&self, id: AddressId) -> Result<AddressInfo> {
        let address = self
            .find_address(id)
            .await?
            .ok_or_else(|| Error::invalid_input(format!("Unable to find ip address {id}")))?;
        if !address.is_allocated() {
            return Err(Error::invalid_input(format!(
                "Ip address {} ({id}) is not allocated",
                address.ip
            )));
        }
        Ok(address)
    }
}

#[async_trait]
pub trait NetworkTopology: Send + Sync {
    async fn find_network(&self, id: NetworkId) -> Result<Option<Network>>;

    async fn find_vm(&self, id: VmId) -> Result<Option<VmInfo>>;

    /// Network interfaces of a VM, primary first
    async fn nics(&self, vm: VmId) -> Result<Vec<Nic>>;

    /// Capabilities of the provider of `service` on `network`.
    ///
    /// `None` means the network does not restrict the service.
    async fn capabilities_for(
        &self,
        network: NetworkId,
        service: Service,
    ) -> Result<Option<Capabilities>>;
}

#[derive(Debug, Default)]
struct TopologyInner {
    addresses: HashMap<AddressId, AddressInfo>,
    networks: HashMap<NetworkId, Network>,
    vms: HashMap<VmId, VmInfo>,
    nics: HashMap<VmId, Vec<Nic>>,
    capabilities: HashMap<(NetworkId, Service), Capabilities>,
}

/// In-memory topology implementing both lookup interfaces
#[derive(Debug, Default)]
pub struct MemoryTopology {
    inner: Mutex<TopologyInner>,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, TopologyInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("topology lock poisoned".to_string()))
    }

    pub fn add_address(&self, address: AddressInfo) -> Result<()> {
        self.inner()?.addresses.insert(address.id, address);
        Ok(())
    }

    pub fn add_network(&self, network: Network) -> Result<()> {
        self.inner()?.networks.insert(network.id, network);
        Ok(())
    }

    pub fn add_vm(&self, vm: VmInfo, nics: Vec<Nic>) -> Result<()> {
        let mut inner = self.inner()?;
        inner.nics.insert(vm.id, nics);
        inner.vms.insert(vm.id, vm);
        Ok(())
    }

    pub fn set_vm_state(&self, vm: VmId, state: VmState) -> Result<bool> {
        Ok(self
            .inner()?
            .vms
            .get_mut(&vm)
            .map(|v| v.state = state)
            .is_some())
    }

    pub fn set_address_ready(&self, address: AddressId, ready: bool) -> Result<bool> {
        Ok(self
            .inner()?
            .addresses
            .get_mut(&address)
            .map(|a| a.ready = ready)
            .is_some())
    }

    pub fn set_capabilities(
        &self,
        network: NetworkId,
        service: Service,
        capabilities: Capabilities,
    ) -> Result<()> {
        self.inner()?
            .capabilities
            .insert((network, service), capabilities);
        Ok(())
    }
}

#[async_trait]
impl AddressDirectory for MemoryTopology {
    async fn find_address(&self, id: AddressId) -> Result<Option<AddressInfo>> {
        Ok(self.inner()?.addresses.get(&id).cloned())
    }

    async fn update_nat(&self, id: AddressId, nat: NatAssociation) -> Result<bool> {
        Ok(self
            .inner()?
            .addresses
            .get_mut(&id)
            .map(|a| a.nat = nat)
            .is_some())
    }
}

#[async_trait]
impl NetworkTopology for MemoryTopology {
    async fn find_network(&self, id: NetworkId) -> Result<Option<Network>> {
        Ok(self.inner()?.networks.get(&id).cloned())
    }

    async fn find_vm(&self, id: VmId) -> Result<Option<VmInfo>> {
        Ok(self.inner()?.vms.get(&id).copied())
    }

    async fn nics(&self, vm: VmId) -> Result<Vec<Nic>> {
        Ok(self.inner()?.nics.get(&vm).cloned().unwrap_or_default())
    }

    async fn capabilities_for(
        &self,
        network: NetworkId,
        service: Service,
    ) -> Result<Option<Capabilities>> {
        Ok(self.inner()?.capabilities.get(&(network, service)).cloned())
    }
}
