use std::sync::Arc;
use std::time::Duration;

use negocia_core::errors::{ApplicationError, DomainError};
use negocia_core::extract::{
    detect_negotiation_intent, extract_identification_number, extract_selection_by_external_id,
    extract_selection_number,
};
use negocia_core::flows::{FlowAction, FlowContext, FlowEvent, TransitionOutcome};
use negocia_core::{AgreementRequest, ConversationContext, FlowEngine, FlowState, NegotiationFlow, TurnRole};
use tracing::{info, warn};

use crate::gateway::DebtGateway;

/// Drives the negotiation flow: picks the operation for an inbound message,
/// calls the gateway and records every outcome as a history turn.
///
/// Every operation expects the caller to hold the user's context lock.
pub struct NegotiationOrchestrator {
    gateway: Arc<dyn DebtGateway>,
    engine: FlowEngine<NegotiationFlow>,
    agreement_timeout: Duration,
}

impl NegotiationOrchestrator {
    pub fn new(gateway: Arc<dyn DebtGateway>, agreement_timeout: Duration) -> Self {
        Self { gateway, engine: FlowEngine::default(), agreement_timeout }
    }

    /// Applies the first matching routing rule. `Ok(None)` means the message
    /// carried no flow signal and only needs a conversational reply.
    pub async fn route(
        &self,
        context: &mut ConversationContext,
        text: &str,
    ) -> Result<Option<TransitionOutcome>, ApplicationError> {
        let state = context.state();

        if state == FlowState::Initial && detect_negotiation_intent(text) {
            return self.request_document(context).map(Some);
        }

        if let Some(document) = extract_identification_number(text) {
            let accepts_document = context.data().document.is_none()
                || matches!(state, FlowState::Initial | FlowState::AwaitingDocument);
            if accepts_document {
                return self.process_document(context, &document).await.map(Some);
            }
        }

        match state {
            FlowState::AwaitingCreditorSelection => {
                let by_id = extract_selection_by_external_id(text, &context.data().creditors)
                    .map(|position| position + 1);
                let selection = by_id.or_else(|| extract_selection_number(text).map(to_index));
                match selection {
                    Some(index) => self.process_creditor_selection(context, index).await.map(Some),
                    None => Ok(None),
                }
            }
            FlowState::AwaitingPlanSelection => match extract_selection_number(text) {
                Some(number) => self.process_plan_selection(context, to_index(number)).map(Some),
                None => Ok(None),
            },
            FlowState::AwaitingAgreementClose => self.process_agreement_close(context).await.map(Some),
            _ => Ok(None),
        }
    }

    fn request_document(
        &self,
        context: &mut ConversationContext,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let outcome = self.apply(context, FlowEvent::NegotiationRequested, FlowContext::default())?;
        context.push_turn(
            TurnRole::User,
            "[Sistema] O cliente quer negociar. Solicite o CPF ou CNPJ para consultar as dívidas.",
        );
        context.set_state(outcome.to);
        self.log_transition(context, &outcome);
        Ok(outcome)
    }

    /// Looks up the creditors for a document and presents them. A single
    /// creditor is selected right away.
    pub async fn process_document(
        &self,
        context: &mut ConversationContext,
        document: &str,
    ) -> Result<TransitionOutcome, ApplicationError> {
        info!(
            event_name = "negotiation.document_received",
            user_id = %context.user_id,
            document = %mask_document(document),
            flow_state = context.state().as_str(),
            "looking up creditors"
        );

        let creditors = match self.gateway.list_creditors(document).await {
            Ok(creditors) => creditors,
            Err(error) => {
                context.push_turn(
                    TurnRole::User,
                    "[Sistema] Não foi possível consultar as dívidas deste documento agora. Peça para o cliente tentar novamente em instantes.",
                );
                return Err(self.integration_failure(context, "creditor lookup", &error));
            }
        };

        if creditors.is_empty() {
            context.push_turn(
                TurnRole::User,
                "[Sistema] Nenhuma dívida foi encontrada para o documento informado. Peça para o cliente conferir o número.",
            );
            info!(
                event_name = "negotiation.no_debts_found",
                user_id = %context.user_id,
                document = %mask_document(document),
                "creditor lookup returned no entries"
            );
            return Err(ApplicationError::NoDebtsFound);
        }

        let outcome = match self.apply(
            context,
            FlowEvent::CreditorsFound,
            FlowContext::with_creditors(creditors.len()),
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                context.push_turn(
                    TurnRole::User,
                    "[Sistema] Esta negociação já foi concluída. Um novo documento não pode ser consultado nesta conversa.",
                );
                return Err(error);
            }
        };

        let listing = creditors
            .iter()
            .enumerate()
            .map(|(position, creditor)| {
                format!("{}. {} (id {})", position + 1, creditor.label(), creditor.external_id)
            })
            .collect::<Vec<_>>()
            .join("\n");
        context.push_turn(
            TurnRole::User,
            format!("[Sistema] Dívidas encontradas para o documento informado:\n{listing}"),
        );
        context.accept_document(document, creditors);
        context.set_state(outcome.to);
        self.log_transition(context, &outcome);

        if outcome.actions.contains(&FlowAction::AutoSelectCreditor) {
            return self.process_creditor_selection(context, 1).await;
        }
        Ok(outcome)
    }

    /// Selects a creditor (1-based) and loads its offers.
    pub async fn process_creditor_selection(
        &self,
        context: &mut ConversationContext,
        index: usize,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let creditor = match context.select_creditor(index) {
            Ok(creditor) => creditor,
            Err(error) => {
                let available = context.data().creditors.len();
                context.push_turn(
                    TurnRole::User,
                    format!(
                        "[Sistema] A opção {index} não existe. Peça para o cliente escolher um número entre 1 e {available}."
                    ),
                );
                return Err(self.rejected(context, error.into()));
            }
        };

        info!(
            event_name = "negotiation.creditor_selected",
            user_id = %context.user_id,
            creditor_id = %creditor.external_id,
            "loading offers"
        );

        let offers = match self.gateway.list_offers(&creditor).await {
            Ok(offers) => offers,
            Err(error) => {
                self.hold_for_offers(context)?;
                context.push_turn(
                    TurnRole::User,
                    format!(
                        "[Sistema] Não foi possível consultar as ofertas de {} agora. O cliente pode tentar de novo ou escolher outra dívida.",
                        creditor.label()
                    ),
                );
                return Err(self.integration_failure(context, "offer lookup", &error));
            }
        };

        if offers.is_empty() {
            self.hold_for_offers(context)?;
            context.push_turn(
                TurnRole::User,
                format!(
                    "[Sistema] Não há ofertas disponíveis para {} no momento. O cliente pode escolher outra dívida.",
                    creditor.label()
                ),
            );
            return Err(self.rejected(
                context,
                ApplicationError::NoOffersAvailable { creditor: creditor.label() },
            ));
        }

        let outcome = self.apply(context, FlowEvent::OffersLoaded, FlowContext::default())?;
        let listing = offers
            .iter()
            .enumerate()
            .map(|(position, offer)| format!("{}. {}", position + 1, offer.summary()))
            .collect::<Vec<_>>()
            .join("\n");
        context.store_offers(offers)?;
        context.push_turn(
            TurnRole::User,
            format!("[Sistema] Ofertas disponíveis para {}:\n{listing}", creditor.label()),
        );
        context.set_state(outcome.to);
        self.log_transition(context, &outcome);
        Ok(outcome)
    }

    /// Records the chosen plan (1-based). The agreement is registered on the next message.
    pub fn process_plan_selection(
        &self,
        context: &mut ConversationContext,
        index: usize,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let offer = match context.select_offer(index) {
            Ok(offer) => offer,
            Err(error) => {
                let available = context.data().offers.len();
                context.push_turn(
                    TurnRole::User,
                    format!(
                        "[Sistema] O plano {index} não existe. Peça para o cliente escolher um número entre 1 e {available}."
                    ),
                );
                return Err(self.rejected(context, error.into()));
            }
        };

        let outcome = self.apply(
            context,
            FlowEvent::PlanChosen,
            FlowContext::with_missing(missing_prerequisites(context)),
        )?;
        context.push_turn(
            TurnRole::User,
            format!(
                "[Sistema] O cliente escolheu o plano {index}: {}. Informe que o acordo será registrado.",
                offer.summary()
            ),
        );
        context.set_state(outcome.to);
        self.log_transition(context, &outcome);
        Ok(outcome)
    }

    /// Registers the agreement under the configured deadline. Failures keep the
    /// selections so the next message retries.
    pub async fn process_agreement_close(
        &self,
        context: &mut ConversationContext,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let missing = missing_prerequisites(context);
        if !missing.is_empty() {
            context.push_turn(
                TurnRole::User,
                format!(
                    "[Sistema] O acordo não pode ser registrado ainda; faltam dados: {}.",
                    missing.join(", ")
                ),
            );
            return Err(self.rejected(context, DomainError::MissingPrerequisites(missing).into()));
        }

        let registered = self.apply(context, FlowEvent::AgreementRegistered, FlowContext::default())?;
        let request = {
            let data = context.data();
            match (&data.document, &data.selected_creditor, &data.selected_offer) {
                (Some(document), Some(creditor), Some(offer)) => AgreementRequest {
                    document: document.clone(),
                    creditor_external_id: creditor.external_id.clone(),
                    offer: offer.clone(),
                },
                _ => {
                    return Err(ApplicationError::Domain(DomainError::InvariantViolation(
                        "agreement prerequisites disappeared".to_string(),
                    )))
                }
            }
        };

        context.push_turn(
            TurnRole::User,
            "[Sistema] Registrando o acordo. Peça para o cliente aguardar um instante.",
        );
        info!(
            event_name = "negotiation.agreement_close_started",
            user_id = %context.user_id,
            creditor_id = %request.creditor_external_id,
            timeout_secs = self.agreement_timeout.as_secs(),
            "registering agreement"
        );

        let failure = match tokio::time::timeout(
            self.agreement_timeout,
            self.gateway.register_agreement(&request),
        )
        .await
        {
            Ok(Ok(result)) => {
                context.push_turn(
                    TurnRole::User,
                    format!(
                        "[Sistema] Acordo registrado. Apresente os dados abaixo ao cliente:\n{}",
                        result.summary()
                    ),
                );
                context.store_agreement(result);
                context.set_state(registered.to);
                self.log_transition(context, &registered);
                return Ok(registered);
            }
            Ok(Err(error)) => self.integration_failure(context, "agreement registration", &error),
            Err(_elapsed) => {
                let seconds = self.agreement_timeout.as_secs();
                warn!(
                    event_name = "negotiation.agreement_timeout",
                    user_id = %context.user_id,
                    timeout_secs = seconds,
                    "agreement registration timed out"
                );
                ApplicationError::Timeout { seconds }
            }
        };

        let retry = self.apply(context, FlowEvent::AgreementFailed, FlowContext::default())?;
        context.push_turn(
            TurnRole::User,
            "[Sistema] Não foi possível registrar o acordo agora. Peça desculpas e diga que basta enviar qualquer mensagem para tentar novamente.",
        );
        context.set_state(retry.to);
        self.log_transition(context, &retry);
        Err(failure)
    }

    fn hold_for_offers(&self, context: &mut ConversationContext) -> Result<(), ApplicationError> {
        context.store_offers(Vec::new())?;
        let outcome = self.apply(context, FlowEvent::OffersUnavailable, FlowContext::default())?;
        context.set_state(outcome.to);
        self.log_transition(context, &outcome);
        Ok(())
    }

    fn apply(
        &self,
        context: &ConversationContext,
        event: FlowEvent,
        flow_context: FlowContext,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.engine
            .apply(&context.state(), &event, &flow_context)
            .map_err(|error| self.rejected(context, DomainError::from(error).into()))
    }

    fn log_transition(&self, context: &ConversationContext, outcome: &TransitionOutcome) {
        info!(
            event_name = "flow.transition",
            user_id = %context.user_id,
            from = outcome.from.as_str(),
            to = outcome.to.as_str(),
            event = ?outcome.event,
            actions = ?outcome.actions,
            "flow state updated"
        );
    }

    fn rejected(&self, context: &ConversationContext, error: ApplicationError) -> ApplicationError {
        info!(
            event_name = "negotiation.step_rejected",
            user_id = %context.user_id,
            flow_state = context.state().as_str(),
            error_class = error.error_class(),
            error = %error,
            "negotiation step rejected"
        );
        error
    }

    fn integration_failure(
        &self,
        context: &ConversationContext,
        operation: &str,
        error: &anyhow::Error,
    ) -> ApplicationError {
        warn!(
            event_name = "negotiation.integration_failed",
            user_id = %context.user_id,
            flow_state = context.state().as_str(),
            operation,
            error = %error,
            "external call failed"
        );
        ApplicationError::Integration(format!("{operation}: {error:#}"))
    }
}

fn to_index(number: u32) -> usize {
    usize::try_from(number).unwrap_or(usize::MAX)
}

fn missing_prerequisites(context: &ConversationContext) -> Vec<String> {
    let data = context.data();
    let mut missing = Vec::new();
    if data.document.is_none() {
        missing.push("document".to_string());
    }
    if data.selected_creditor.is_none() {
        missing.push("selected_creditor".to_string());
    }
    if data.selected_offer.is_none() {
        missing.push("selected_offer".to_string());
    }
    missing
}

/// Keeps only the last four digits, e.g. `*******8901`.
pub fn mask_document(document: &str) -> String {
    let visible = document.len().saturating_sub(4);
    document
        .chars()
        .enumerate()
        .map(|(position, ch)| if position < visible { '*' } else { ch })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use negocia_core::errors::{ApplicationError, DomainError};
    use negocia_core::{
        AgreementRequest, AgreementResult, ConversationContext, Creditor, FlowState, Offer,
    };
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::{mask_document, NegotiationOrchestrator};
    use crate::gateway::DebtGateway;

    #[derive(Default)]
    struct FakeGateway {
        creditors: Mutex<VecDeque<Result<Vec<Creditor>>>>,
        offers: Mutex<VecDeque<Result<Vec<Offer>>>>,
        agreements: Mutex<VecDeque<Result<AgreementResult>>>,
        offer_lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DebtGateway for FakeGateway {
        async fn list_creditors(&self, _document: &str) -> Result<Vec<Creditor>> {
            self.creditors.lock().await.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn list_offers(&self, creditor: &Creditor) -> Result<Vec<Offer>> {
            self.offer_lookups.lock().await.push(creditor.external_id.clone());
            self.offers.lock().await.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn register_agreement(&self, _request: &AgreementRequest) -> Result<AgreementResult> {
            self.agreements.lock().await.pop_front().unwrap_or_else(|| Err(anyhow!("unscripted")))
        }
    }

    fn creditors(count: usize) -> Vec<Creditor> {
        (1..=count)
            .map(|position| Creditor::new(format!("Credor {position}"), "", format!("{position}0")))
            .collect()
    }

    fn offers(count: u32) -> Vec<Offer> {
        (1..=count)
            .map(|installments| Offer {
                description: format!("Plano {installments}x"),
                installments,
                installment_amount: None,
                total_amount: None,
                first_due_date: None,
                raw: json!({ "parcelas": installments }),
            })
            .collect()
    }

    fn orchestrator(gateway: Arc<FakeGateway>) -> NegotiationOrchestrator {
        NegotiationOrchestrator::new(gateway, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn single_creditor_goes_straight_to_plan_selection() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.creditors.lock().await.push_back(Ok(creditors(1)));
        gateway.offers.lock().await.push_back(Ok(offers(2)));
        let orchestrator = orchestrator(gateway.clone());
        let mut context = ConversationContext::new("u1");

        let outcome = orchestrator
            .route(&mut context, "meu cpf é 123.456.789-01")
            .await
            .expect("document accepted")
            .expect("flow signal");

        assert_eq!(outcome.to, FlowState::AwaitingPlanSelection);
        assert_eq!(context.state(), FlowState::AwaitingPlanSelection);
        assert_eq!(context.data().document.as_deref(), Some("12345678901"));
        assert_eq!(context.data().selected_creditor.as_ref(), Some(&creditors(1)[0]));
        assert_eq!(*gateway.offer_lookups.lock().await, vec!["10".to_string()]);
    }

    #[tokio::test]
    async fn empty_debt_lookup_keeps_state_and_explains() {
        let gateway = Arc::new(FakeGateway::default());
        let orchestrator = orchestrator(gateway);
        let mut context = ConversationContext::new("u1");
        context.set_state(FlowState::AwaitingDocument);

        let error = orchestrator
            .route(&mut context, "12345678901")
            .await
            .expect_err("no debts is reported");

        assert_eq!(error, ApplicationError::NoDebtsFound);
        assert_eq!(context.state(), FlowState::AwaitingDocument);
        assert!(context.data().document.is_none());
        assert!(context.history().last().is_some_and(|turn| turn.text.contains("Nenhuma dívida")));
    }

    #[tokio::test]
    async fn lookup_failure_is_recoverable() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.creditors.lock().await.push_back(Err(anyhow!("connection reset")));
        let orchestrator = orchestrator(gateway);
        let mut context = ConversationContext::new("u1");

        let error = orchestrator
            .process_document(&mut context, "12345678901")
            .await
            .expect_err("transport failure surfaces");

        assert!(matches!(error, ApplicationError::Integration(_)));
        assert!(error.is_retryable());
        assert_eq!(context.state(), FlowState::Initial);
        assert_eq!(context.history().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_creditor_keeps_selection_and_state() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.creditors.lock().await.push_back(Ok(creditors(2)));
        let orchestrator = orchestrator(gateway);
        let mut context = ConversationContext::new("u1");
        orchestrator.process_document(&mut context, "12345678901").await.expect("two creditors");
        let turns_before = context.history().len();

        let error = orchestrator
            .route(&mut context, "quero a 5")
            .await
            .expect_err("only two options");

        assert_eq!(
            error,
            ApplicationError::Domain(DomainError::SelectionOutOfRange { index: 5, available: 2 })
        );
        assert_eq!(context.state(), FlowState::AwaitingCreditorSelection);
        assert!(context.data().selected_creditor.is_none());
        assert_eq!(context.history().len(), turns_before + 1);
    }

    #[tokio::test]
    async fn external_id_wins_over_position() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.creditors.lock().await.push_back(Ok(creditors(3)));
        gateway.offers.lock().await.push_back(Ok(offers(1)));
        let orchestrator = orchestrator(gateway.clone());
        let mut context = ConversationContext::new("u1");
        orchestrator.process_document(&mut context, "12345678901").await.expect("three creditors");

        orchestrator.route(&mut context, "a do id 20").await.expect("selected by id");

        assert_eq!(context.data().selected_creditor.as_ref().map(|c| c.external_id.as_str()), Some("20"));
        assert_eq!(*gateway.offer_lookups.lock().await, vec!["20".to_string()]);
    }

    #[tokio::test]
    async fn empty_offers_keep_creditor_and_wait_for_another_choice() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.creditors.lock().await.push_back(Ok(creditors(2)));
        let orchestrator = orchestrator(gateway);
        let mut context = ConversationContext::new("u1");
        orchestrator.process_document(&mut context, "12345678901").await.expect("two creditors");

        let error = orchestrator
            .process_creditor_selection(&mut context, 2)
            .await
            .expect_err("no offers");

        assert!(matches!(error, ApplicationError::NoOffersAvailable { .. }));
        assert_eq!(context.state(), FlowState::AwaitingCreditorSelection);
        assert_eq!(context.data().selected_creditor.as_ref(), Some(&creditors(2)[1]));
        assert!(context.data().offers.is_empty());
    }

    #[tokio::test]
    async fn closing_without_prerequisites_changes_nothing() {
        let orchestrator = orchestrator(Arc::new(FakeGateway::default()));
        let mut context = ConversationContext::new("u1");
        context.set_state(FlowState::AwaitingAgreementClose);

        let error = orchestrator
            .process_agreement_close(&mut context)
            .await
            .expect_err("nothing selected");

        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::MissingPrerequisites(ref missing))
                if missing == &vec![
                    "document".to_string(),
                    "selected_creditor".to_string(),
                    "selected_offer".to_string(),
                ]
        ));
        assert_eq!(context.state(), FlowState::AwaitingAgreementClose);
        assert_eq!(context.history().len(), 1);
    }

    #[tokio::test]
    async fn unrelated_text_is_not_a_flow_signal() {
        let orchestrator = orchestrator(Arc::new(FakeGateway::default()));
        let mut context = ConversationContext::new("u1");

        let routed = orchestrator.route(&mut context, "bom dia").await.expect("no error");

        assert!(routed.is_none());
        assert_eq!(context.state(), FlowState::Initial);
        assert!(context.history().is_empty());
    }

    #[test]
    fn documents_are_masked_to_last_four_digits() {
        assert_eq!(mask_document("12345678901"), "*******8901");
        assert_eq!(mask_document("12345678000195"), "**********0195");
        assert_eq!(mask_document("123"), "123");
    }
}
