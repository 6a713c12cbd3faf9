/// Batch application of pending rules to the enforcement backend
///
/// A batch is pushed in one backend call and judged as a whole: on success
/// every rule advances (`Add` becomes `Active`, `Revoke` is deleted), on
/// failure nothing changes and the caller may re-run the apply later.
/// There is no per-rule result, so a backend that silently drops one rule
/// of a successful batch still sees that rule advanced.
use super::error::{Error, Result};
use super::lifecycle::{self, LifecycleEvent, Step};
use super::lock::AddressScope;
use super::rule::{AddressId, Rule, RuleState};
use super::store::RuleStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The opaque capability that programs network devices
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    /// Pushes a batch of rules in their current states.
    ///
    /// Returns `Ok(false)` when the backend processed the request but
    /// reported failure. With `continue_on_error` the backend keeps going
    /// after individual device errors before reporting.
    ///
    /// # Errors
    ///
    /// [`Error::EnforcementUnavailable`] when the backend cannot be reached.
    async fn apply(&self, rules: &[Rule], continue_on_error: bool) -> Result<bool>;
}

/// Aggregate outcome of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BatchOutcome {
    /// The backend accepted the batch and every rule advanced
    #[strum(serialize = "applied")]
    Applied,
    /// The backend reported failure; no rule changed state
    #[strum(serialize = "rejected")]
    Rejected,
    /// Nothing to push; the backend was not contacted
    #[strum(serialize = "empty")]
    Empty,
}

/// Result of an [`ApplyEngine::apply`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: BatchOutcome,
    /// Rules moved from `Add` to `Active`
    pub activated: usize,
    /// `Revoke` rules deleted from the store
    pub removed: usize,
}

impl ApplyReport {
    fn empty() -> Self {
        Self {
            outcome: BatchOutcome::Empty,
            activated: 0,
            removed: 0,
        }
    }

    fn rejected() -> Self {
        Self {
            outcome: BatchOutcome::Rejected,
            activated: 0,
            removed: 0,
        }
    }

    /// `true` unless the backend rejected the batch
    pub fn success(&self) -> bool {
        self.outcome != BatchOutcome::Rejected
    }
}

/// Drives batches of transitional rules to their terminal states
pub struct ApplyEngine {
    store: Arc<dyn RuleStore>,
    backend: Arc<dyn EnforcementBackend>,
}

impl ApplyEngine {
    pub fn new(store: Arc<dyn RuleStore>, backend: Arc<dyn EnforcementBackend>) -> Self {
        Self { store, backend }
    }

    /// Pushes `rules` in one backend call and advances them on success.
    ///
    /// Every rule's address must be held by `scope`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a rule is still `Staged`; checked before
    ///   the backend is contacted
    /// - [`Error::EnforcementUnavailable`] propagated from the backend
    /// - store errors while advancing
    pub async fn apply(
        &self,
        scope: &AddressScope,
        rules: Vec<Rule>,
        continue_on_error: bool,
    ) -> Result<ApplyReport> {
        for rule in &rules {
            scope.ensure_covers(rule.source_address)?;
            if rule.state == RuleState::Staged {
                return Err(Error::invalid_state(format!(
                    "{rule} has not passed conflict detection and cannot be applied"
                )));
            }
        }

        if rules.is_empty() {
            debug!("Nothing to apply");
            return Ok(ApplyReport::empty());
        }

        info!("Applying {} rules (continue_on_error={})", rules.len(), continue_on_error);
        if !self.backend.apply(&rules, continue_on_error).await? {
            warn!("Enforcement backend rejected batch of {} rules", rules.len());
            return Ok(ApplyReport::rejected());
        }

        let mut report = ApplyReport {
            outcome: BatchOutcome::Applied,
            activated: 0,
            removed: 0,
        };
        for mut rule in rules {
            match lifecycle::advance(&mut rule, LifecycleEvent::Applied)? {
                Step::Transition(_) => {
                    self.store.update(&rule).await?;
                    report.activated += 1;
                }
                Step::Delete => {
                    self.store.remove(rule.id).await?;
                    report.removed += 1;
                }
                Step::Unchanged => {}
            }
        }

        info!(
            "Batch applied: {} activated, {} removed",
            report.activated, report.removed
        );
        Ok(report)
    }

    /// Pushes every non-staged rule of `address` after a revocation.
    ///
    /// Unlike [`ApplyEngine::apply`], an unreachable backend is not an
    /// error here: it is logged and reported as `Ok(false)`, the same as a
    /// rejected batch.
    pub async fn flush(
        &self,
        scope: &AddressScope,
        address: AddressId,
        continue_on_error: bool,
    ) -> Result<bool> {
        let pending = self.store.list_for_application(address).await?;
        match self.apply(scope, pending, continue_on_error).await {
            Ok(report) => Ok(report.success()),
            Err(e @ Error::EnforcementUnavailable(_)) => {
                warn!("Failed to push rules of address {}: {}", address, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
