use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Initial,
    AwaitingDocument,
    AwaitingCreditorSelection,
    AwaitingPlanSelection,
    AwaitingAgreementClose,
    Finished,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::AwaitingDocument => "awaiting_document",
            Self::AwaitingCreditorSelection => "awaiting_creditor_selection",
            Self::AwaitingPlanSelection => "awaiting_plan_selection",
            Self::AwaitingAgreementClose => "awaiting_agreement_close",
            Self::Finished => "finished",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    NegotiationRequested,
    CreditorsFound,
    OffersLoaded,
    OffersUnavailable,
    PlanChosen,
    AgreementRegistered,
    AgreementFailed,
}

/// Facts about the working set that some transitions depend on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub creditor_count: usize,
    pub missing_prerequisites: Vec<String>,
}

impl FlowContext {
    pub fn with_creditors(creditor_count: usize) -> Self {
        Self { creditor_count, ..Self::default() }
    }

    pub fn with_missing(missing_prerequisites: Vec<String>) -> Self {
        Self { missing_prerequisites, ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    RequestDocument,
    PresentCreditors,
    AutoSelectCreditor,
    PresentOffers,
    ReportNoOffers,
    CloseAgreement,
    PresentAgreement,
    OfferRetry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: FlowState,
    pub to: FlowState,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}
