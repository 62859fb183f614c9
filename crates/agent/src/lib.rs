//! Negotiation agent: the collaborators and orchestration around the core flow.
//!
//! The agent turns one inbound chat message into one outbound reply:
//! 1. **Routing** (`orchestrator`) - pick the flow operation from state and extracted signals
//! 2. **External calls** (`gateway`) - debt, offer and agreement services
//! 3. **Composition** (`composer`) - system prompt, steering directive and history to the LLM
//!
//! The LLM only phrases replies. Creditors, offers and agreement data always
//! come from the gateway and are carried in the conversation history verbatim.

pub mod composer;
pub mod gateway;
pub mod llm;
pub mod orchestrator;
pub mod runtime;

pub use composer::DialogueComposer;
pub use gateway::{DebtGateway, HttpDebtGateway};
pub use llm::{GeminiClient, LlmClient};
pub use orchestrator::NegotiationOrchestrator;
pub use runtime::{AgentRuntime, InboundReply, RuntimeSettings};
