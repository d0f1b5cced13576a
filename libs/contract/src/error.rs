//! Error types for contract validation.

use thiserror::Error;

use crate::ContractKind;

/// Structural problems found by [`crate::Contract::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// Only resource templates may carry an estimate.
    #[error("contract '{name}' of kind {kind} carries a resource estimate")]
    UnexpectedEstimate { name: String, kind: ContractKind },

    /// Estimates are reserved by subtraction and must not be negative.
    #[error("contract '{name}' has negative estimate {value}")]
    NegativeEstimate { name: String, value: i64 },

    /// A child demand has no name.
    #[error("child demand without a name")]
    UnnamedDemand,

    /// Two child demands of the same category share a name.
    #[error("duplicate child demand '{0}'")]
    DuplicateDemand(String),
}
