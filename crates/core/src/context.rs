//! Per-user conversation state and the store that owns it.
//!
//! The store keeps one `tokio::sync::Mutex` per user. Callers hold that lock
//! for the whole handling of a message, which serializes a user's messages
//! while different users proceed in parallel. The map itself sits behind a
//! std mutex that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::domain::agreement::AgreementResult;
use crate::domain::creditor::Creditor;
use crate::domain::offer::Offer;
use crate::domain::turn::{Turn, TurnRole};
use crate::errors::DomainError;
use crate::flows::FlowState;

/// Write-once flags. Each can go from `false` to `true` exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFlags {
    greeting_sent: bool,
    system_prompt_sent: bool,
}

impl ContextFlags {
    pub fn greeting_sent(&self) -> bool {
        self.greeting_sent
    }

    pub fn system_prompt_sent(&self) -> bool {
        self.system_prompt_sent
    }

    /// Returns `true` only on the call that flipped the latch.
    pub fn latch_greeting(&mut self) -> bool {
        !std::mem::replace(&mut self.greeting_sent, true)
    }

    /// Returns `true` only on the call that flipped the latch.
    pub fn latch_system_prompt(&mut self) -> bool {
        !std::mem::replace(&mut self.system_prompt_sent, true)
    }
}

/// Negotiation working set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NegotiationData {
    pub document: Option<String>,
    pub creditors: Vec<Creditor>,
    pub selected_creditor: Option<Creditor>,
    pub offers: Vec<Offer>,
    pub selected_offer: Option<Offer>,
    pub agreement_result: Option<AgreementResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    state: FlowState,
    history: Vec<Turn>,
    data: NegotiationData,
    flags: ContextFlags,
    created_at: DateTime<Utc>,
    last_interaction_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            state: FlowState::Initial,
            history: Vec::new(),
            data: NegotiationData::default(),
            flags: ContextFlags::default(),
            created_at: now,
            last_interaction_at: now,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn data(&self) -> &NegotiationData {
        &self.data
    }

    pub fn flags(&self) -> &ContextFlags {
        &self.flags
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_interaction_at(&self) -> DateTime<Utc> {
        self.last_interaction_at
    }

    pub fn set_state(&mut self, state: FlowState) {
        self.state = state;
        self.touch();
    }

    pub fn push_turn(&mut self, role: TurnRole, text: impl Into<String>) {
        self.history.push(Turn { role, text: text.into() });
        self.touch();
    }

    pub fn latch_greeting(&mut self) -> bool {
        let latched = self.flags.latch_greeting();
        if latched {
            self.touch();
        }
        latched
    }

    pub fn latch_system_prompt(&mut self) -> bool {
        let latched = self.flags.latch_system_prompt();
        if latched {
            self.touch();
        }
        latched
    }

    /// Accepts a new document and its creditor list, dropping every selection
    /// made against a previous list.
    pub fn accept_document(&mut self, document: impl Into<String>, creditors: Vec<Creditor>) {
        self.data = NegotiationData {
            document: Some(document.into()),
            creditors,
            ..NegotiationData::default()
        };
        self.touch();
    }

    /// Selects a creditor by 1-based position. An out-of-range index leaves the
    /// current selection untouched.
    pub fn select_creditor(&mut self, index: usize) -> Result<Creditor, DomainError> {
        let available = self.data.creditors.len();
        let creditor = index
            .checked_sub(1)
            .and_then(|position| self.data.creditors.get(position))
            .cloned()
            .ok_or(DomainError::SelectionOutOfRange { index, available })?;

        self.data.selected_creditor = Some(creditor.clone());
        self.data.offers.clear();
        self.data.selected_offer = None;
        self.touch();
        Ok(creditor)
    }

    /// Stores the offers of the selected creditor and clears any stale plan choice.
    pub fn store_offers(&mut self, offers: Vec<Offer>) -> Result<(), DomainError> {
        if self.data.selected_creditor.is_none() && !offers.is_empty() {
            return Err(DomainError::InvariantViolation(
                "offers can only be stored after a creditor is selected".to_string(),
            ));
        }

        self.data.offers = offers;
        self.data.selected_offer = None;
        self.touch();
        Ok(())
    }

    /// Selects a plan by 1-based position.
    pub fn select_offer(&mut self, index: usize) -> Result<Offer, DomainError> {
        if self.data.offers.is_empty() {
            return Err(DomainError::MissingPrerequisites(vec!["offers".to_string()]));
        }

        let available = self.data.offers.len();
        let offer = index
            .checked_sub(1)
            .and_then(|position| self.data.offers.get(position))
            .cloned()
            .ok_or(DomainError::SelectionOutOfRange { index, available })?;

        self.data.selected_offer = Some(offer.clone());
        self.touch();
        Ok(offer)
    }

    pub fn store_agreement(&mut self, result: AgreementResult) {
        self.data.agreement_result = Some(result);
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_interaction_at {
            self.last_interaction_at = now;
        }
    }
}

pub type ContextGuard = OwnedMutexGuard<ConversationContext>;

type ContextSlot = Arc<AsyncMutex<ConversationContext>>;

#[derive(Default)]
pub struct ContextStore {
    entries: Mutex<HashMap<String, ContextSlot>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the user's context, creating it on first use.
    ///
    /// The returned guard serializes all work for this user until dropped.
    pub async fn acquire(&self, user_id: &str) -> ContextGuard {
        loop {
            let slot = self.slot_or_insert(user_id);
            let guard = slot.clone().lock_owned().await;

            // An eviction may have removed the slot while we waited for it.
            let still_current = self
                .entries()
                .get(user_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
            if still_current {
                return guard;
            }

            debug!(
                event_name = "context.acquire_retry",
                user_id = %user_id,
                "context slot was evicted while waiting; retrying"
            );
        }
    }

    /// A copy of the user's context, waiting for any in-flight message to finish.
    pub async fn snapshot(&self, user_id: &str) -> Option<ConversationContext> {
        let slot = self.entries().get(user_id).cloned()?;
        let guard = slot.lock().await;
        Some(guard.clone())
    }

    /// Removes the user's context once no message is in flight for it.
    pub async fn reset(&self, user_id: &str) -> bool {
        let Some(slot) = self.entries().get(user_id).cloned() else {
            return false;
        };

        let _guard = slot.lock().await;
        let mut entries = self.entries();
        let removed = match entries.get(user_id) {
            Some(current) if Arc::ptr_eq(current, &slot) => entries.remove(user_id).is_some(),
            _ => false,
        };

        if removed {
            info!(event_name = "context.reset", user_id = %user_id, "conversation context reset");
        }
        removed
    }

    /// Removes contexts idle for longer than `max_age`, skipping users with a
    /// message in flight. Returns the evicted user ids.
    pub fn evict_idle(&self, max_age: Duration) -> Vec<String> {
        self.evict_idle_as_of(Utc::now(), max_age)
    }

    pub fn evict_idle_as_of(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let mut entries = self.entries();
        let mut evicted = Vec::new();

        entries.retain(|user_id, slot| {
            let Ok(context) = slot.try_lock() else {
                debug!(
                    event_name = "context.eviction_skipped",
                    user_id = %user_id,
                    "message in flight; skipping eviction"
                );
                return true;
            };

            let idle_for = now.signed_duration_since(context.last_interaction_at);
            if idle_for > max_age {
                info!(
                    event_name = "context.evicted",
                    user_id = %user_id,
                    idle_hours = idle_for.num_hours(),
                    "conversation context evicted"
                );
                evicted.push(user_id.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn slot_or_insert(&self, user_id: &str) -> ContextSlot {
        let mut entries = self.entries();
        entries
            .entry(user_id.to_string())
            .or_insert_with(|| {
                debug!(event_name = "context.created", user_id = %user_id, "conversation context created");
                Arc::new(AsyncMutex::new(ConversationContext::new(user_id)))
            })
            .clone()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ContextSlot>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{ContextStore, ConversationContext};
    use crate::domain::creditor::Creditor;
    use crate::domain::offer::Offer;
    use crate::domain::turn::TurnRole;
    use crate::errors::DomainError;
    use crate::flows::FlowState;

    fn creditors() -> Vec<Creditor> {
        vec![Creditor::new("Banco Azul", "Banco Azul", "10"), Creditor::new("Loja", "Loja SA", "20")]
    }

    fn offer(installments: u32) -> Offer {
        Offer {
            description: format!("Plano {installments}x"),
            installments,
            installment_amount: None,
            total_amount: None,
            first_due_date: None,
            raw: json!({ "parcelas": installments }),
        }
    }

    #[tokio::test]
    async fn acquire_creates_once_and_reuses() {
        let store = ContextStore::new();
        assert!(!store.contains("u1"));

        {
            let mut context = store.acquire("u1").await;
            context.push_turn(TurnRole::User, "oi");
        }
        let context = store.acquire("u1").await;

        assert_eq!(store.len(), 1);
        assert_eq!(context.history().len(), 1);
        assert_eq!(context.state(), FlowState::Initial);
    }

    #[test]
    fn latches_flip_exactly_once() {
        let mut context = ConversationContext::new("u1");
        assert!(!context.flags().greeting_sent());

        assert!(context.latch_greeting());
        assert!(!context.latch_greeting());
        assert!(context.flags().greeting_sent());

        assert!(context.latch_system_prompt());
        assert!(!context.latch_system_prompt());
        assert!(context.flags().system_prompt_sent());
    }

    #[test]
    fn out_of_range_creditor_keeps_previous_selection() {
        let mut context = ConversationContext::new("u1");
        context.accept_document("12345678901", creditors());
        let first = context.select_creditor(1).expect("first creditor exists");

        let error = context.select_creditor(3).expect_err("only two creditors");
        assert_eq!(error, DomainError::SelectionOutOfRange { index: 3, available: 2 });
        assert!(context.select_creditor(0).is_err());
        assert_eq!(context.data().selected_creditor.as_ref(), Some(&first));
    }

    #[test]
    fn offers_require_a_selected_creditor() {
        let mut context = ConversationContext::new("u1");
        context.accept_document("12345678901", creditors());

        assert!(matches!(
            context.store_offers(vec![offer(1)]),
            Err(DomainError::InvariantViolation(_))
        ));
        assert!(matches!(
            context.select_offer(1),
            Err(DomainError::MissingPrerequisites(_))
        ));

        context.select_creditor(2).expect("second creditor exists");
        context.store_offers(vec![offer(1), offer(6)]).expect("creditor selected");
        let chosen = context.select_offer(2).expect("two offers");
        assert_eq!(chosen.installments, 6);

        context.store_offers(vec![offer(12)]).expect("refresh offers");
        assert!(context.data().selected_offer.is_none());
    }

    #[test]
    fn new_document_clears_downstream_selections() {
        let mut context = ConversationContext::new("u1");
        context.accept_document("12345678901", creditors());
        context.select_creditor(1).expect("creditor exists");
        context.store_offers(vec![offer(3)]).expect("creditor selected");
        context.select_offer(1).expect("offer exists");

        context.accept_document("98765432100", vec![Creditor::new("Outro", "Outro", "30")]);

        assert_eq!(context.data().document.as_deref(), Some("98765432100"));
        assert!(context.data().selected_creditor.is_none());
        assert!(context.data().offers.is_empty());
        assert!(context.data().selected_offer.is_none());
    }

    #[test]
    fn last_interaction_never_moves_backwards() {
        let mut context = ConversationContext::new("u1");
        let mut previous = context.last_interaction_at();
        for index in 0..50 {
            context.push_turn(TurnRole::User, format!("msg {index}"));
            assert!(context.last_interaction_at() >= previous);
            previous = context.last_interaction_at();
        }
        assert!(context.created_at() <= context.last_interaction_at());
    }

    #[tokio::test]
    async fn eviction_removes_only_idle_contexts() {
        let store = ContextStore::new();
        drop(store.acquire("a").await);
        drop(store.acquire("b").await);

        let soon = Utc::now() + Duration::hours(1);
        assert!(store.evict_idle_as_of(soon, Duration::hours(24)).is_empty());
        assert_eq!(store.len(), 2);

        let later = Utc::now() + Duration::hours(25);
        let mut evicted = store.evict_idle_as_of(later, Duration::hours(24));
        evicted.sort();
        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn eviction_skips_users_with_message_in_flight() {
        let store = Arc::new(ContextStore::new());
        let guard = store.acquire("busy").await;

        let evicted = store.evict_idle_as_of(Utc::now() + Duration::hours(48), Duration::hours(24));
        assert!(evicted.is_empty());
        assert!(store.contains("busy"));

        drop(guard);
        let evicted = store.evict_idle_as_of(Utc::now() + Duration::hours(48), Duration::hours(24));
        assert_eq!(evicted, vec!["busy".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reset_removes_context_and_next_acquire_starts_fresh() {
        let store = ContextStore::new();
        {
            let mut context = store.acquire("u1").await;
            context.set_state(FlowState::AwaitingDocument);
        }

        assert!(store.reset("u1").await);
        assert!(!store.reset("u1").await);

        let context = store.acquire("u1").await;
        assert_eq!(context.state(), FlowState::Initial);
    }

    #[tokio::test]
    async fn snapshot_returns_copy_without_creating() {
        let store = ContextStore::new();
        assert!(store.snapshot("ghost").await.is_none());
        assert!(!store.contains("ghost"));

        drop(store.acquire("u1").await);
        let snapshot = store.snapshot("u1").await.expect("context exists");
        assert_eq!(snapshot.user_id, "u1");
    }
}
