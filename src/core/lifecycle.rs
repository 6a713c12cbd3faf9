//! Rule lifecycle state machine
//!
//! ```text
//! create ─► Staged ──passed──► Add ──applied──► Active
//!             │                 │                 │
//!             │ failed/revoke   └─────revoke──────┤
//!             ▼                                   ▼
//!          deleted ◄────────────applied────── Revoke
//! ```
//!
//! A rule that fails to apply keeps its state; re-running the apply is the
//! only retry mechanism.

use super::error::{Error, Result};
use super::rule::{Rule, RuleState};

/// Something that happened to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LifecycleEvent {
    #[strum(serialize = "conflict check passed")]
    ConflictCheckPassed,
    #[strum(serialize = "conflict check failed")]
    ConflictCheckFailed,
    #[strum(serialize = "revoke requested")]
    RevokeRequested,
    #[strum(serialize = "applied")]
    Applied,
}

/// What the store has to do with the rule after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Persist the rule in the new state
    Transition(RuleState),
    /// Remove the record; there is no state after this
    Delete,
    /// Leave the record alone
    Unchanged,
}

/// Computes the next step for a rule in `state` receiving `event`.
///
/// # Errors
///
/// Returns [`Error::InvalidState`] for combinations the lifecycle does not
/// allow, e.g. applying a rule that was never conflict-checked.
pub fn next(state: RuleState, event: LifecycleEvent) -> Result<Step> {
    use LifecycleEvent::{Applied, ConflictCheckFailed, ConflictCheckPassed, RevokeRequested};
    use RuleState::{Active, Add, Revoke, Staged};

    match (state, event) {
        (Staged, ConflictCheckPassed) => Ok(Step::Transition(Add)),
        (Staged, ConflictCheckFailed | RevokeRequested) => Ok(Step::Delete),
        (Add | Active, RevokeRequested) => Ok(Step::Transition(Revoke)),
        (Revoke, RevokeRequested) => Ok(Step::Unchanged),
        (Add, Applied) => Ok(Step::Transition(Active)),
        (Active, Applied) => Ok(Step::Unchanged),
        (Revoke, Applied) => Ok(Step::Delete),
        (state, event) => Err(Error::invalid_state(format!(
            "rule in state {state} cannot handle '{event}'"
        ))),
    }
}

/// Applies `event` to `rule` in place and returns the step for the store.
///
/// On [`Step::Transition`] the rule's state is already updated; on
/// [`Step::Delete`] and [`Step::Unchanged`] the rule is left as it was.
pub fn advance(rule: &mut Rule, event: LifecycleEvent) -> Result<Step> {
    let step = next(rule.state, event)?;
    if let Step::Transition(state) = step {
        rule.state = state;
    }
    Ok(step)
}
