//! Conversation, intent routing and answer generation

pub mod conversation;
pub mod generation;
pub mod intent;
pub mod llm;
pub mod orchestrator;
pub mod services;

pub use conversation::{AugmentedQuery, ConversationSession, ConversationTurn, looks_like_follow_up};
pub use generation::{GENERAL_KNOWLEDGE_CAVEAT, GeneratedAnswer, Generator, NO_CONTEXT_ANSWER, select_passages};
pub use intent::{
    ClassificationSource, DateRange, Intent, IntentClassification, IntentRouter, IntentSlots,
    extract_date_range, extract_email_slots,
};
pub use llm::{GenerationParams, LanguageModel, OpenAiCompatibleModel, Prompt, complete_with_timeout};
pub use orchestrator::{AgentResponse, KnowledgeAgent};
pub use services::{CalendarEvent, CalendarService, DraftReceipt, EmailDraft, EmailDrafter, format_events};
