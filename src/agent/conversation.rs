//! Conversation memory and follow-up query augmentation
//!
//! A [`ConversationSession`] keeps the most recent exchanges of one chat,
//! evicting strictly oldest-first. Follow-up questions ("tell me more",
//! "what about contractors?") are rewritten to carry a compact summary of the
//! last one or two turns so retrieval has something to match against.

use crate::agent::intent::Intent;
use crate::config::{ConversationConfig, FollowUpPolicy};
use crate::utils::{collapse_whitespace, truncate_chars};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One completed question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
    pub retrieved_chunk_ids: Vec<String>,
    /// Intent the turn was routed to, when known
    pub intent: Option<Intent>,
}

impl ConversationTurn {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        retrieved_chunk_ids: Vec<String>,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            timestamp: Utc::now(),
            retrieved_chunk_ids,
            intent: None,
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }
}

/// A question as handed to routing and retrieval
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedQuery {
    /// What the user typed
    pub original: String,
    /// Text used for retrieval; equals `original` unless this is a follow-up
    pub text: String,
    pub is_follow_up: bool,
}

const REFERENTIAL_WORDS: &[&str] = &[
    "it", "its", "it's", "that", "this", "those", "these", "they", "them", "their", "there", "he",
    "she", "him", "her", "also", "else", "more", "same", "further", "elaborate",
];

const REFERENTIAL_PHRASES: &[&str] = &[
    "what about",
    "how about",
    "and what",
    "why is that",
    "go on",
    "in detail",
];

/// Words that never make a question self-contained
const FILLER_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "can", "could", "do", "does", "explain", "for", "give", "how",
    "i", "is", "me", "more", "please", "show", "so", "tell", "the", "to", "what", "what's", "when",
    "where", "which", "who", "why", "would", "you", "ok", "okay", "then", "really", "about",
    "details", "detail", "again", "why's", "how's",
];

fn words(question: &str) -> Vec<String> {
    question
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase().replace('\u{2019}', "'"))
        .collect()
}

/// Heuristic follow-up test: referential phrasing, or a short question with
/// no content word of its own
pub fn looks_like_follow_up(question: &str, max_words: usize) -> bool {
    let words = words(question);
    if words.is_empty() {
        return false;
    }

    if words.iter().any(|w| REFERENTIAL_WORDS.contains(&w.as_str())) {
        return true;
    }
    let lowered = words.join(" ");
    if REFERENTIAL_PHRASES.iter().any(|p| lowered.contains(p)) {
        return true;
    }

    let has_subject = words
        .iter()
        .any(|w| w.chars().count() >= 3 && !FILLER_WORDS.contains(&w.as_str()));
    words.len() <= max_words && !has_subject
}

/// Bounded memory of one chat session
#[derive(Debug, Clone)]
pub struct ConversationSession {
    config: ConversationConfig,
    turns: VecDeque<ConversationTurn>,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

impl ConversationSession {
    pub fn new(config: ConversationConfig) -> Self {
        let capacity = config.max_exchanges.max(1);
        Self {
            config,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    pub fn max_exchanges(&self) -> usize {
        self.config.max_exchanges.max(1)
    }

    /// Whether `question` should be read against earlier turns
    pub fn is_follow_up(&self, question: &str) -> bool {
        if self.turns.is_empty() {
            return false;
        }
        match self.config.follow_up {
            FollowUpPolicy::Always => true,
            FollowUpPolicy::Never => false,
            FollowUpPolicy::Heuristic => {
                looks_like_follow_up(question, self.config.follow_up_max_words)
            }
        }
    }

    /// Prefix follow-ups with a summary of the latest turns; pass anything
    /// else through unchanged
    pub fn augment_query(&self, question: &str) -> AugmentedQuery {
        let original = question.trim().to_string();
        if !self.is_follow_up(&original) {
            return AugmentedQuery {
                text: original.clone(),
                original,
                is_follow_up: false,
            };
        }

        let summary = self.summary();
        log::debug!("Follow-up detected, folding in: {}", summary);
        AugmentedQuery {
            text: format!("{}\nCurrent question: {}", summary, original),
            original,
            is_follow_up: true,
        }
    }

    /// Compact rendering of the most recent 1-2 turns, oldest first
    pub fn summary(&self) -> String {
        let n = self.config.summary_turns.clamp(1, 2);
        let cap = self.config.summary_chars.max(1);
        let parts: Vec<String> = self
            .recent(n)
            .into_iter()
            .map(|turn| {
                format!(
                    "Earlier question: {} Earlier answer: {}",
                    truncate_chars(&collapse_whitespace(&turn.question), cap),
                    truncate_chars(&collapse_whitespace(&turn.answer), cap)
                )
            })
            .collect();
        parts.join("\n")
    }

    /// Record a completed exchange
    pub fn append(
        &mut self,
        question: impl Into<String>,
        answer: impl Into<String>,
        retrieved_chunk_ids: Vec<String>,
    ) {
        self.record(ConversationTurn::new(question, answer, retrieved_chunk_ids));
    }

    /// Push a turn, evicting the oldest when over `max_exchanges`
    pub fn record(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_exchanges() {
            self.turns.pop_front();
        }
    }

    /// Up to `n` most recent turns, oldest first
    pub fn recent(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    pub fn last_turn(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Forget every turn (session reset)
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
