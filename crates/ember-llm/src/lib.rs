//! Ember LLM - completion service adapters consumed by the slow loop

pub mod anthropic;
pub mod offline;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use offline::{OfflineCompletion, ScriptedCompletion, ScriptedReply};
pub use provider::{CompletionError, CompletionResult, CompletionService};
pub use types::*;
