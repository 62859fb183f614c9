pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod extract;
pub mod flows;

pub use context::{ContextFlags, ContextGuard, ContextStore, ConversationContext, NegotiationData};
pub use domain::agreement::{AgreementInstallment, AgreementRequest, AgreementResult, PaymentLink};
pub use domain::creditor::Creditor;
pub use domain::offer::Offer;
pub use domain::turn::{Turn, TurnRole};
pub use errors::{ApplicationError, DomainError};
pub use flows::{FlowEngine, FlowState, FlowTransitionError, NegotiationFlow};
