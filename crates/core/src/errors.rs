use thiserror::Error;

use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("selection {index} is out of range (available options: {available})")]
    SelectionOutOfRange { index: usize, available: usize },
    #[error("missing prerequisites: {}", .0.join(", "))]
    MissingPrerequisites(Vec<String>),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("no debts were found for the informed document")]
    NoDebtsFound,
    #[error("no offers available for creditor `{creditor}`")]
    NoOffersAvailable { creditor: String },
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("external call timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl ApplicationError {
    /// Whether repeating the same step later can succeed without new user input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Integration(_) | Self::Timeout { .. } | Self::NoOffersAvailable { .. }
        )
    }

    /// Short machine-friendly class used as a structured log field.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::FlowTransition(_)) => "flow_transition",
            Self::Domain(DomainError::SelectionOutOfRange { .. }) => "selection_out_of_range",
            Self::Domain(DomainError::MissingPrerequisites(_)) => "missing_prerequisites",
            Self::Domain(DomainError::InvariantViolation(_)) => "invariant_violation",
            Self::NoDebtsFound => "no_debts_found",
            Self::NoOffersAvailable { .. } => "no_offers_available",
            Self::Integration(_) => "integration",
            Self::Timeout { .. } => "timeout",
        }
    }
}
