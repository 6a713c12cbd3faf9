//! Rule data structures
//!
//! This module defines the records the rules manager keeps for every public
//! address: the rule itself, its identifiers, its purpose-specific target and
//! its lifecycle state.
//!
//! # Rule Structure
//!
//! A [`Rule`] carries:
//! - The public address and inclusive source port range it is attached to
//! - A lowercase transport protocol
//! - A [`RuleKind`], which decides the purpose and whether a destination exists
//! - The internal network, owning account and domain (immutable after creation)
//! - The one-to-one NAT flag
//! - A lifecycle [`RuleState`]
//!
//! # Example
//!
//! ```
//! use netrules::core::rule::{
//!     AccountId, AddressId, DomainId, NetworkId, PortRange, Protocol, RuleDraft, RuleKind,
//!     RuleState,
//! };
//!
//! let draft = RuleDraft {
//!     source_address: AddressId(7),
//!     source_ports: PortRange::single(22),
//!     protocol: Protocol::new("TCP"),
//!     kind: RuleKind::Firewall,
//!     network: NetworkId(1),
//!     account: AccountId(2),
//!     domain: DomainId(1),
//!     one_to_one_nat: false,
//! };
//! let rule = draft.into_staged();
//! assert_eq!(rule.state, RuleState::Staged);
//! assert_eq!(rule.protocol.as_str(), "tcp");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Public IP address record id
    AddressId
);
numeric_id!(
    /// Internal (guest) network id
    NetworkId
);
numeric_id!(
    /// Virtual machine id
    VmId
);
numeric_id!(AccountId);
numeric_id!(DomainId);
numeric_id!(
    /// Availability zone id
    DataCenterId
);

/// Unique rule identifier, assigned by the store at persist time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol name, normalized to lowercase
///
/// Protocol names are compared case-insensitively everywhere, so the
/// normalization happens once at construction (and on deserialization).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Protocol(String);

impl Protocol {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    pub fn tcp() -> Self {
        Self("tcp".to_string())
    }

    pub fn udp() -> Self {
        Self("udp".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Protocol {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl From<&str> for Protocol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.0
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rule category; controls which overlap exceptions apply
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Purpose {
    #[strum(serialize = "firewall")]
    Firewall,
    #[strum(serialize = "port_forwarding")]
    PortForwarding,
    #[strum(serialize = "static_nat")]
    StaticNat,
}

/// Lifecycle state of a persisted rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum RuleState {
    /// Persisted but not yet conflict-checked
    #[strum(serialize = "staged")]
    Staged,
    /// Validated, waiting to be pushed to the enforcement backend
    #[strum(serialize = "add")]
    Add,
    /// Present in the enforcement backend
    #[strum(serialize = "active")]
    Active,
    /// Marked for removal, waiting to be pushed
    #[strum(serialize = "revoke")]
    Revoke,
}

/// Inclusive port interval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Two inclusive ranges overlap when `max(starts) <= min(ends)`.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Where forwarded traffic ends up
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub address: IpAddr,
    pub ports: PortRange,
    /// VM whose primary guest interface owns `address`, if resolved from a VM
    pub vm: Option<VmId>,
}

/// Purpose of a rule together with its purpose-specific fields
///
/// Firewall rules can never carry a destination. Forwarding and NAT rules
/// created by port reservation have no destination yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum RuleKind {
    Firewall,
    PortForwarding { destination: Option<Destination> },
    StaticNat { destination: Option<Destination> },
}

impl RuleKind {
    /// A kind of the given purpose with no destination.
    pub fn bare(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Firewall => RuleKind::Firewall,
            Purpose::PortForwarding => RuleKind::PortForwarding { destination: None },
            Purpose::StaticNat => RuleKind::StaticNat { destination: None },
        }
    }

    pub fn purpose(&self) -> Purpose {
        match self {
            RuleKind::Firewall => Purpose::Firewall,
            RuleKind::PortForwarding { .. } => Purpose::PortForwarding,
            RuleKind::StaticNat { .. } => Purpose::StaticNat,
        }
    }

    pub fn destination(&self) -> Option<&Destination> {
        match self {
            RuleKind::Firewall => None,
            RuleKind::PortForwarding { destination } | RuleKind::StaticNat { destination } => {
                destination.as_ref()
            }
        }
    }
}

/// A rule that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDraft {
    pub source_address: AddressId,
    pub source_ports: PortRange,
    pub protocol: Protocol,
    pub kind: RuleKind,
    pub network: NetworkId,
    pub account: AccountId,
    pub domain: DomainId,
    pub one_to_one_nat: bool,
}

impl RuleDraft {
    /// Assigns a fresh id and puts the rule in [`RuleState::Staged`].
    pub fn into_staged(self) -> Rule {
        Rule {
            id: RuleId::new(),
            source_address: self.source_address,
            source_ports: self.source_ports,
            protocol: self.protocol,
            kind: self.kind,
            network: self.network,
            account: self.account,
            domain: self.domain,
            one_to_one_nat: self.one_to_one_nat,
            state: RuleState::Staged,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub source_address: AddressId,
    pub source_ports: PortRange,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub network: NetworkId,
    pub account: AccountId,
    pub domain: DomainId,
    #[serde(default)]
    pub one_to_one_nat: bool,
    pub state: RuleState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Rule {
    pub fn purpose(&self) -> Purpose {
        self.kind.purpose()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.kind.destination()
    }

    /// VM the destination resolves to, if any
    pub fn vm(&self) -> Option<VmId> {
        self.destination().and_then(|d| d.vm)
    }

    pub fn is_revoked(&self) -> bool {
        self.state == RuleState::Revoke
    }

    /// Human readable rule name used in event descriptions
    pub fn display_name(&self) -> &'static str {
        match self.purpose() {
            Purpose::Firewall => "firewall",
            _ if self.one_to_one_nat => "ip forwarding",
            Purpose::StaticNat => "static nat",
            Purpose::PortForwarding => "port forwarding",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rule [ipAddressId={}:{}]",
            self.display_name(),
            self.source_address,
            self.source_ports
        )?;
        if let Some(dest) = self.destination() {
            write!(f, "->[{}:{}]", dest.address, dest.ports)?;
        }
        write!(f, " {}", self.protocol)
    }
}
