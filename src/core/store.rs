//! Rule persistence
//!
//! The storage engine is not part of this crate. [`RuleStore`] is the narrow
//! interface the core needs, and [`MemoryRuleStore`] is an in-process
//! implementation used by tests and by embedders that keep rules in memory.
//!
//! Batch operations (`persist_all`, `remove_all`) must be atomic: either
//! every record is written or removed, or none is.

use super::error::{Error, Result};
use super::rule::{AddressId, NetworkId, Rule, RuleDraft, RuleId, RuleState, VmId};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persists a new rule in [`RuleState::Staged`] and returns it with its id.
    async fn persist(&self, draft: RuleDraft) -> Result<Rule>;

    /// Persists every draft in one atomic group.
    async fn persist_all(&self, drafts: Vec<RuleDraft>) -> Result<Vec<Rule>>;

    /// Removes a rule. Returns `false` if it did not exist.
    async fn remove(&self, id: RuleId) -> Result<bool>;

    /// Removes every listed rule in one atomic group and returns how many existed.
    async fn remove_all(&self, ids: &[RuleId]) -> Result<usize>;

    /// Overwrites the stored rule with the same id. Returns `false` if it did not exist.
    async fn update(&self, rule: &Rule) -> Result<bool>;

    async fn find_by_id(&self, id: RuleId) -> Result<Option<Rule>>;

    /// Lists rules on an address that are not in [`RuleState::Revoke`].
    ///
    /// `nat_only` filters on the one-to-one NAT flag: `Some(true)` returns only
    /// NAT rules, `Some(false)` only non-NAT rules, `None` both.
    async fn list_non_revoked_by_address(
        &self,
        address: AddressId,
        nat_only: Option<bool>,
    ) -> Result<Vec<Rule>>;

    async fn list_by_network(&self, network: NetworkId) -> Result<Vec<Rule>>;

    /// Lists the rules on an address that the enforcement backend should see:
    /// everything except [`RuleState::Staged`].
    async fn list_for_application(&self, address: AddressId) -> Result<Vec<Rule>>;

    /// Lists rules whose destination resolves to the given VM.
    async fn list_by_vm(&self, vm: VmId) -> Result<Vec<Rule>>;
}

/// In-memory rule store
///
/// Rules are kept in insertion order, so listings are deterministic. A single
/// mutex guards the whole set, which makes the batch operations trivially
/// atomic.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<Vec<Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rules, in any state
    pub fn len(&self) -> usize {
        self.rules.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rules(&self) -> Result<MutexGuard<'_, Vec<Rule>>> {
        self.rules
            .lock()
            .map_err(|_| Error::Internal("rule store lock poisoned".to_string()))
    }

    fn filtered(&self, keep: impl Fn(&Rule) -> bool) -> Result<Vec<Rule>> {
        Ok(self.rules()?.iter().filter(|r| keep(r)).cloned().collect())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn persist(&self, draft: RuleDraft) -> Result<Rule> {
        let rule = draft.into_staged();
        self.rules()?.push(rule.clone());
        Ok(rule)
    }

    async fn persist_all(&self, drafts: Vec<RuleDraft>) -> Result<Vec<Rule>> {
        let staged: Vec<Rule> = drafts.into_iter().map(RuleDraft::into_staged).collect();
        self.rules()?.extend(staged.iter().cloned());
        Ok(staged)
    }

    async fn remove(&self, id: RuleId) -> Result<bool> {
        let mut rules = self.rules()?;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        Ok(rules.len() != before)
    }

    async fn remove_all(&self, ids: &[RuleId]) -> Result<usize> {
        let mut rules = self.rules()?;
        let before = rules.len();
        rules.retain(|r| !ids.contains(&r.id));
        Ok(before - rules.len())
    }

    async fn update(&self, rule: &Rule) -> Result<bool> {
        let mut rules = self.rules()?;
        let Some(stored) = rules.iter_mut().find(|r| r.id == rule.id) else {
            return Ok(false);
        };
        if stored.account != rule.account
            || stored.domain != rule.domain
            || stored.source_address != rule.source_address
        {
            return Err(Error::invalid_input(format!(
                "ownership and address of rule {} are immutable",
                rule.id
            )));
        }
        *stored = rule.clone();
        Ok(true)
    }

    async fn find_by_id(&self, id: RuleId) -> Result<Option<Rule>> {
        Ok(self.rules()?.iter().find(|r| r.id == id).cloned())
    }

    async fn list_non_revoked_by_address(
        &self,
        address: AddressId,
        nat_only: Option<bool>,
    ) -> Result<Vec<Rule>> {
        self.filtered(|r| {
            r.source_address == address
                && r.state != RuleState::Revoke
                && nat_only.is_none_or(|nat| r.one_to_one_nat == nat)
        })
    }

    async fn list_by_network(&self, network: NetworkId) -> Result<Vec<Rule>> {
        self.filtered(|r| r.network == network)
    }

    async fn list_for_application(&self, address: AddressId) -> Result<Vec<Rule>> {
        self.filtered(|r| r.source_address == address && r.state != RuleState::Staged)
    }

    async fn list_by_vm(&self, vm: VmId) -> Result<Vec<Rule>> {
        self.filtered(|r| r.vm() == Some(vm))
    }
}
