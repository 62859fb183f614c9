use std::sync::Arc;

use negocia_core::{ConversationContext, FlowState, Turn, TurnRole};
use tracing::{debug, warn};

use crate::llm::LlmClient;

pub const SYSTEM_PROMPT: &str = "\
Você é a atendente virtual da Cobrance, uma recuperadora de crédito, e conversa como uma pessoa real. \
Seja acolhedora, objetiva e profissional. Nunca diga que é uma IA nem que segue etapas.

Seu objetivo é ajudar o cliente a negociar: confirmar o CPF ou CNPJ, ajudar a escolher a dívida, \
apresentar os planos de pagamento e, após a escolha, informar que o acordo está sendo registrado.

Regras:
- Cumprimente apenas na primeira resposta da conversa.
- Responda com no máximo 300 caracteres.
- Use somente dados que aparecem na conversa. Nunca invente valores, prazos, nomes ou links.
- Quando faltar um dado (documento, dívida ou plano), peça de forma natural e ligada ao que o cliente disse.
- Para escolher uma dívida ou um plano, o cliente responde com o número da opção.";

pub const FALLBACK_REPLY: &str =
    "Desculpe, não consegui responder agora. Pode repetir sua mensagem em instantes?";

const TONE_RULES: &str =
    "Responda em português do Brasil, em tom cordial, com no máximo 300 caracteres e sem inventar dados.";

/// Builds generation requests and records model replies in the history.
pub struct DialogueComposer {
    llm: Arc<dyn LlmClient>,
    candidate_limit: usize,
}

impl DialogueComposer {
    pub fn new(llm: Arc<dyn LlmClient>, candidate_limit: usize) -> Self {
        Self { llm, candidate_limit: candidate_limit.max(1) }
    }

    /// Stores the system prompt as the first turn of a fresh conversation.
    pub fn prime(&self, context: &mut ConversationContext) {
        if context.latch_system_prompt() {
            context.push_turn(TurnRole::User, SYSTEM_PROMPT);
        }
    }

    /// Asks the LLM for the next reply. A failed or empty generation returns
    /// [`FALLBACK_REPLY`] and leaves the history untouched.
    pub async fn compose(&self, context: &mut ConversationContext) -> String {
        let request = self.build_request(context);

        match self.llm.complete(&request).await {
            Ok(reply) if !reply.trim().is_empty() => {
                let reply = reply.trim().to_string();
                context.push_turn(TurnRole::Model, reply.clone());
                if context.latch_greeting() {
                    debug!(
                        event_name = "negotiation.greeting_sent",
                        user_id = %context.user_id,
                        "first reply delivered"
                    );
                }
                reply
            }
            Ok(_) => {
                warn!(
                    event_name = "negotiation.generation_failed",
                    user_id = %context.user_id,
                    flow_state = context.state().as_str(),
                    error = "empty reply",
                    "generation returned no text; using fallback reply"
                );
                FALLBACK_REPLY.to_string()
            }
            Err(error) => {
                warn!(
                    event_name = "negotiation.generation_failed",
                    user_id = %context.user_id,
                    flow_state = context.state().as_str(),
                    error = %error,
                    "generation failed; using fallback reply"
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// System prompt, then the steering directive, then the rest of the history.
    pub fn build_request(&self, context: &ConversationContext) -> Vec<Turn> {
        let history = context.history();
        let starts_with_prompt = context.flags().system_prompt_sent()
            && history.first().is_some_and(|turn| turn.text == SYSTEM_PROMPT);
        let (prompt, rest) =
            if starts_with_prompt { history.split_at(1) } else { (&history[..0], history) };

        let mut request = Vec::with_capacity(history.len() + 1);
        request.extend_from_slice(prompt);
        request.push(Turn::user(self.directive(context)));
        request.extend_from_slice(rest);
        request
    }

    /// Per-request steering text. Built only from data already in the context.
    pub fn directive(&self, context: &ConversationContext) -> String {
        let data = context.data();
        let mut lines = vec![
            format!("[Orientação interna - estado atual: {}]", context.state().as_str()),
            TONE_RULES.to_string(),
        ];

        lines.push(if context.flags().greeting_sent() {
            "O cliente já foi cumprimentado; não cumprimente novamente.".to_string()
        } else {
            "Esta é a primeira resposta: cumprimente o cliente brevemente.".to_string()
        });

        match context.state() {
            FlowState::Initial => lines.push(
                "Entenda o que o cliente precisa. Se ele quiser negociar, peça o CPF ou CNPJ."
                    .to_string(),
            ),
            FlowState::AwaitingDocument => lines.push(
                "Peça o CPF (11 dígitos) ou CNPJ (14 dígitos) do cliente para consultar as dívidas."
                    .to_string(),
            ),
            FlowState::AwaitingCreditorSelection => {
                lines.push("Peça para o cliente escolher a dívida pelo número da opção:".to_string());
                let labels = data
                    .creditors
                    .iter()
                    .map(|creditor| format!("{} (id {})", creditor.label(), creditor.external_id))
                    .collect::<Vec<_>>();
                lines.extend(self.enumerate(&labels));
            }
            FlowState::AwaitingPlanSelection => {
                if let Some(creditor) = &data.selected_creditor {
                    lines.push(format!("Dívida escolhida: {}.", creditor.label()));
                }
                lines.push("Peça para o cliente escolher o plano pelo número da opção:".to_string());
                let summaries = data.offers.iter().map(|offer| offer.summary()).collect::<Vec<_>>();
                lines.extend(self.enumerate(&summaries));
            }
            FlowState::AwaitingAgreementClose => {
                if let Some(offer) = &data.selected_offer {
                    lines.push(format!("Plano escolhido: {}.", offer.summary()));
                }
                lines.push(
                    "Informe que o acordo está sendo registrado. Se houve falha, peça para o cliente enviar qualquer mensagem para tentar de novo."
                        .to_string(),
                );
            }
            FlowState::Finished => lines.push(
                "O acordo foi registrado. Tire dúvidas usando apenas os dados do acordo já informados."
                    .to_string(),
            ),
        }

        lines.join("\n")
    }

    fn enumerate(&self, items: &[String]) -> Vec<String> {
        let mut lines = items
            .iter()
            .take(self.candidate_limit)
            .enumerate()
            .map(|(position, item)| format!("{}. {item}", position + 1))
            .collect::<Vec<_>>();

        let hidden = items.len().saturating_sub(self.candidate_limit);
        match hidden {
            0 => {}
            1 => lines.push("(mais 1 opção disponível)".to_string()),
            _ => lines.push(format!("(mais {hidden} opções disponíveis)")),
        }
        lines
    }
}
