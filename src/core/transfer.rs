//! Serializable view of rules handed to the enforcement layer
//!
//! The enforcement layer addresses rules by public IP rather than by the
//! address record id, and only needs to know whether each rule is to be
//! added, kept or removed.

use super::rule::{Destination, PortRange, Protocol, Purpose, Rule, RuleId, RuleState};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTransfer {
    pub id: RuleId,
    pub source_ip: IpAddr,
    pub source_ports: PortRange,
    pub protocol: Protocol,
    pub purpose: Purpose,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    pub one_to_one_nat: bool,
    /// The rule is being removed
    pub revoked: bool,
    /// The rule is already present in the backend
    pub already_added: bool,
}

impl RuleTransfer {
    pub fn new(rule: &Rule, source_ip: IpAddr) -> Self {
        Self {
            id: rule.id,
            source_ip,
            source_ports: rule.source_ports,
            protocol: rule.protocol.clone(),
            purpose: rule.purpose(),
            destination: rule.destination().copied(),
            one_to_one_nat: rule.one_to_one_nat,
            revoked: rule.state == RuleState::Revoke,
            already_added: rule.state == RuleState::Active,
        }
    }
}
