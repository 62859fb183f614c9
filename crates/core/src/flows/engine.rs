use thiserror::Error;

use crate::flows::states::{FlowAction, FlowContext, FlowEvent, FlowState, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> FlowState;
    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct NegotiationFlow;

impl FlowDefinition for NegotiationFlow {
    fn initial_state(&self) -> FlowState {
        FlowState::Initial
    }

    fn transition(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_negotiation(current, event, context)
    }
}

#[derive(Clone, Debug)]
pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> FlowState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &FlowState,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }
}

impl Default for FlowEngine<NegotiationFlow> {
    fn default() -> Self {
        Self::new(NegotiationFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("missing required data before transition from {state:?}: {missing:?}")]
    MissingRequiredData { state: FlowState, missing: Vec<String> },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: FlowState, event: FlowEvent },
}

fn transition_negotiation(
    current: &FlowState,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowAction::{
        AutoSelectCreditor, CloseAgreement, OfferRetry, PresentAgreement, PresentCreditors,
        PresentOffers, ReportNoOffers, RequestDocument,
    };
    use FlowEvent::{
        AgreementFailed, AgreementRegistered, CreditorsFound, NegotiationRequested, OffersLoaded,
        OffersUnavailable, PlanChosen,
    };
    use FlowState::{
        AwaitingAgreementClose, AwaitingCreditorSelection, AwaitingDocument,
        AwaitingPlanSelection, Finished, Initial,
    };

    let require = |missing: Vec<String>| -> Result<(), FlowTransitionError> {
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FlowTransitionError::MissingRequiredData { state: *current, missing })
        }
    };

    let (to, actions) = match (current, event) {
        (Initial, NegotiationRequested) => (AwaitingDocument, vec![RequestDocument]),
        (Finished, CreditorsFound) => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
        (_, CreditorsFound) => match context.creditor_count {
            0 => {
                return Err(FlowTransitionError::MissingRequiredData {
                    state: *current,
                    missing: vec!["creditors".to_owned()],
                });
            }
            1 => (AwaitingCreditorSelection, vec![AutoSelectCreditor]),
            _ => (AwaitingCreditorSelection, vec![PresentCreditors]),
        },
        (AwaitingCreditorSelection, OffersLoaded) => (AwaitingPlanSelection, vec![PresentOffers]),
        (AwaitingCreditorSelection, OffersUnavailable) => {
            (AwaitingCreditorSelection, vec![ReportNoOffers])
        }
        (AwaitingPlanSelection, PlanChosen) => {
            require(context.missing_prerequisites.clone())?;
            (AwaitingAgreementClose, vec![CloseAgreement])
        }
        (AwaitingAgreementClose, AgreementRegistered) => {
            require(context.missing_prerequisites.clone())?;
            (Finished, vec![PresentAgreement])
        }
        (AwaitingAgreementClose, AgreementFailed) => (AwaitingAgreementClose, vec![OfferRetry]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}

#[cfg(test)]
mod tests {
    use crate::flows::engine::{FlowEngine, FlowTransitionError, NegotiationFlow};
    use crate::flows::states::{FlowAction, FlowContext, FlowEvent, FlowState};

    #[test]
    fn negotiation_happy_path_with_multiple_creditors() {
        let engine = FlowEngine::new(NegotiationFlow);
        let mut state = engine.initial_state();
        assert_eq!(state, FlowState::Initial);

        state = engine
            .apply(&state, &FlowEvent::NegotiationRequested, &FlowContext::default())
            .expect("initial -> awaiting document")
            .to;
        let listed = engine
            .apply(&state, &FlowEvent::CreditorsFound, &FlowContext::with_creditors(2))
            .expect("awaiting document -> creditor selection");
        assert_eq!(listed.to, FlowState::AwaitingCreditorSelection);
        assert_eq!(listed.actions, vec![FlowAction::PresentCreditors]);

        state = engine
            .apply(&listed.to, &FlowEvent::OffersLoaded, &FlowContext::default())
            .expect("creditor selection -> plan selection")
            .to;
        state = engine
            .apply(&state, &FlowEvent::PlanChosen, &FlowContext::default())
            .expect("plan selection -> agreement close")
            .to;
        assert_eq!(state, FlowState::AwaitingAgreementClose);

        let finished = engine
            .apply(&state, &FlowEvent::AgreementRegistered, &FlowContext::default())
            .expect("agreement close -> finished");
        assert_eq!(finished.to, FlowState::Finished);
        assert_eq!(finished.actions, vec![FlowAction::PresentAgreement]);
    }

    #[test]
    fn single_creditor_requests_auto_selection() {
        let engine = FlowEngine::default();
        let outcome = engine
            .apply(&FlowState::Initial, &FlowEvent::CreditorsFound, &FlowContext::with_creditors(1))
            .expect("document may be sent straight from the initial state");

        assert_eq!(outcome.to, FlowState::AwaitingCreditorSelection);
        assert_eq!(outcome.actions, vec![FlowAction::AutoSelectCreditor]);
    }

    #[test]
    fn failures_hold_the_waiting_state() {
        let engine = FlowEngine::default();
        let no_offers = engine
            .apply(
                &FlowState::AwaitingCreditorSelection,
                &FlowEvent::OffersUnavailable,
                &FlowContext::default(),
            )
            .expect("no offers keeps creditor selection");
        assert_eq!(no_offers.to, FlowState::AwaitingCreditorSelection);

        let failed_close = engine
            .apply(
                &FlowState::AwaitingAgreementClose,
                &FlowEvent::AgreementFailed,
                &FlowContext::default(),
            )
            .expect("failed close stays retryable");
        assert_eq!(failed_close.to, FlowState::AwaitingAgreementClose);
        assert_eq!(failed_close.actions, vec![FlowAction::OfferRetry]);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(&FlowState::Initial, &FlowEvent::PlanChosen, &FlowContext::default())
            .expect_err("plan cannot be chosen before any offer exists");

        assert!(matches!(
            error,
            FlowTransitionError::InvalidTransition {
                state: FlowState::Initial,
                event: FlowEvent::PlanChosen
            }
        ));
    }

    #[test]
    fn finished_flow_rejects_new_creditor_lists() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(&FlowState::Finished, &FlowEvent::CreditorsFound, &FlowContext::with_creditors(3))
            .expect_err("finished conversations do not restart through the table");

        assert!(matches!(error, FlowTransitionError::InvalidTransition { .. }));
    }

    #[test]
    fn missing_data_is_rejected() {
        let engine = FlowEngine::default();
        let empty = engine
            .apply(&FlowState::AwaitingDocument, &FlowEvent::CreditorsFound, &FlowContext::default())
            .expect_err("an empty creditor list is not a transition");
        assert!(matches!(empty, FlowTransitionError::MissingRequiredData { .. }));

        let error = engine
            .apply(
                &FlowState::AwaitingAgreementClose,
                &FlowEvent::AgreementRegistered,
                &FlowContext::with_missing(vec!["selected_offer".to_owned()]),
            )
            .expect_err("must reject missing prerequisites");
        assert!(matches!(
            error,
            FlowTransitionError::MissingRequiredData { ref missing, .. }
                if missing == &vec!["selected_offer".to_owned()]
        ));
    }

    #[test]
    fn replay_is_deterministic_for_same_event_sequence() {
        let engine = FlowEngine::default();
        let events = [
            (FlowEvent::NegotiationRequested, FlowContext::default()),
            (FlowEvent::CreditorsFound, FlowContext::with_creditors(2)),
            (FlowEvent::OffersUnavailable, FlowContext::default()),
            (FlowEvent::OffersLoaded, FlowContext::default()),
            (FlowEvent::PlanChosen, FlowContext::default()),
            (FlowEvent::AgreementFailed, FlowContext::default()),
            (FlowEvent::AgreementRegistered, FlowContext::default()),
        ];

        let run = |engine: &FlowEngine<NegotiationFlow>| {
            let mut state = engine.initial_state();
            let mut actions = Vec::new();
            for (event, context) in &events {
                let outcome = engine.apply(&state, event, context).expect("deterministic run");
                actions.push(outcome.actions);
                state = outcome.to;
            }
            (state, actions)
        };

        let first = run(&engine);
        let second = run(&engine);

        assert_eq!(first, second);
        assert_eq!(first.0, FlowState::Finished);
    }
}
