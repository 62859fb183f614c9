use std::sync::Arc;
use std::time::Duration;

use negocia_core::config::NegotiationConfig;
use negocia_core::{ContextStore, ConversationContext, FlowState, TurnRole};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::composer::DialogueComposer;
use crate::gateway::DebtGateway;
use crate::llm::LlmClient;
use crate::orchestrator::NegotiationOrchestrator;

// Larger ages overflow chrono's millisecond range.
const MAX_EVICTION_HOURS: i64 = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundReply {
    pub reply_text: String,
    pub current_state: FlowState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub agreement_timeout: Duration,
    pub candidate_limit: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { agreement_timeout: Duration::from_secs(30), candidate_limit: 5 }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &NegotiationConfig) -> Self {
        Self {
            agreement_timeout: Duration::from_secs(config.agreement_timeout_secs),
            candidate_limit: config.directive_candidate_limit,
        }
    }
}

/// Entry point for inbound chat messages.
pub struct AgentRuntime {
    store: Arc<ContextStore>,
    orchestrator: NegotiationOrchestrator,
    composer: DialogueComposer,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<ContextStore>,
        gateway: Arc<dyn DebtGateway>,
        llm: Arc<dyn LlmClient>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            orchestrator: NegotiationOrchestrator::new(gateway, settings.agreement_timeout),
            composer: DialogueComposer::new(llm, settings.candidate_limit),
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Handles one message end to end. Messages for the same user are processed
    /// one at a time in the order they acquire the user's lock.
    pub async fn handle_inbound_message(&self, user_id: &str, text: &str) -> InboundReply {
        let correlation_id = Uuid::new_v4();
        let span = info_span!("inbound_message", %correlation_id, user_id);

        async {
            let mut context = self.store.acquire(user_id).await;
            let state_before = context.state();
            info!(
                event_name = "negotiation.message_received",
                flow_state = state_before.as_str(),
                chars = text.chars().count(),
                "inbound message"
            );

            self.composer.prime(&mut context);
            context.push_turn(TurnRole::User, text);

            if let Err(error) = self.orchestrator.route(&mut context, text).await {
                warn!(
                    event_name = "negotiation.step_failed",
                    flow_state = context.state().as_str(),
                    error_class = error.error_class(),
                    retryable = error.is_retryable(),
                    error = %error,
                    "negotiation step did not complete"
                );
            }

            let reply_text = self.composer.compose(&mut context).await;
            let current_state = context.state();
            info!(
                event_name = "negotiation.reply_sent",
                from = state_before.as_str(),
                flow_state = current_state.as_str(),
                "reply ready"
            );

            InboundReply { reply_text, current_state }
        }
        .instrument(span)
        .await
    }

    /// Removes contexts idle for longer than `max_age_hours`. Users with a
    /// message in flight are skipped.
    pub fn evict_idle_contexts(&self, max_age_hours: u64) -> usize {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX).min(MAX_EVICTION_HOURS);
        let max_age = chrono::Duration::hours(hours);
        let evicted = self.store.evict_idle(max_age);
        if !evicted.is_empty() {
            info!(
                event_name = "context.eviction_sweep",
                count = evicted.len(),
                max_age_hours,
                "idle contexts removed"
            );
        }
        evicted.len()
    }

    pub async fn reset_context(&self, user_id: &str) -> bool {
        self.store.reset(user_id).await
    }

    pub async fn context_snapshot(&self, user_id: &str) -> Option<ConversationContext> {
        self.store.snapshot(user_id).await
    }

    pub fn active_contexts(&self) -> usize {
        self.store.len()
    }
}
