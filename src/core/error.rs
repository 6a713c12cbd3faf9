use crate::core::rule::RuleId;
use thiserror::Error;

/// Core error types for netrules
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request or a reference to something that does not exist
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation is not legal given the current NAT or rule state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A new or changed rule would violate an invariant against an existing rule
    #[error("Rule conflict: {message}")]
    RuleConflict {
        reason: ConflictReason,
        /// The existing rule that caused the rejection, when there is one
        conflicting: Option<RuleId>,
        message: String,
    },

    /// The enforcement backend could not be reached or rejected the whole batch
    #[error("Enforcement unavailable: {0}")]
    EnforcementUnavailable(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a rule was rejected by conflict detection or NAT admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConflictReason {
    /// A one-to-one NAT rule and an independent rule would share an address
    #[strum(serialize = "one-to-one nat exclusivity")]
    NatExclusivity,
    /// The rules point at different internal networks
    #[strum(serialize = "network mismatch")]
    NetworkMismatch,
    /// The source port ranges overlap
    #[strum(serialize = "port overlap")]
    PortOverlap,
    /// The address is already mapped to a different VM
    #[strum(serialize = "vm mismatch")]
    VmMismatch,
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    pub fn conflict(
        reason: ConflictReason,
        conflicting: Option<RuleId>,
        message: impl Into<String>,
    ) -> Self {
        Error::RuleConflict {
            reason,
            conflicting,
            message: message.into(),
        }
    }

    /// Returns the conflict reason if this is a [`Error::RuleConflict`].
    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            Error::RuleConflict { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// `true` for failures a caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::EnforcementUnavailable(_))
    }

    /// Translates the error into a message and suggestions for the service layer.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::InvalidInput(msg) => ErrorTranslation::new(format!("Invalid request: {msg}"))
                .with_suggestion("Check that the address, network and VM ids exist")
                .with_suggestion("Port numbers must be between 1 and 65535"),
            Error::InvalidState(msg) => {
                ErrorTranslation::new(format!("Not allowed right now: {msg}"))
                    .with_suggestion("Check whether one-to-one NAT is enabled on the address")
            }
            Error::RuleConflict {
                reason: ConflictReason::PortOverlap,
                message,
                ..
            } => ErrorTranslation::new(message.clone())
                .with_suggestion("Choose a port range that does not overlap existing rules")
                .with_suggestion(
                    "Port forwarding rules may share ports only when their protocols differ",
                ),
            Error::RuleConflict {
                reason: ConflictReason::NatExclusivity | ConflictReason::VmMismatch,
                message,
                ..
            } => ErrorTranslation::new(message.clone())
                .with_suggestion("Disable one-to-one NAT before adding independent rules")
                .with_suggestion("Or revoke the existing rules before enabling one-to-one NAT"),
            Error::RuleConflict { message, .. } => ErrorTranslation::new(message.clone())
                .with_suggestion("All rules on an address must target the same network"),
            Error::EnforcementUnavailable(msg) => {
                ErrorTranslation::new(format!("Rules could not be pushed: {msg}"))
                    .with_suggestion("Pending rules kept their state and can be applied again")
            }
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorTranslation::new(format!("Internal error: {self}"))
            }
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;
