//! Prompt assembly and answer generation
//!
//! Passages enter the prompt best-first until the character budget is spent;
//! whatever doesn't fit is dropped lowest score first. Each passage is
//! labelled with its source file so the model can cite it.

use crate::agent::conversation::ConversationTurn;
use crate::agent::llm::{GenerationParams, LanguageModel, Prompt, complete_with_timeout};
use crate::api::knowledge_base::RetrievedPassage;
use crate::config::{GenerationConfig, LlmConfig, NoContextPolicy};
use crate::error::{AgentError, Result};
use crate::utils::{collapse_whitespace, truncate_chars};
use std::sync::Arc;
use std::time::Duration;

/// Reply when nothing relevant was retrieved and the policy is to decline
pub const NO_CONTEXT_ANSWER: &str = "I couldn't find anything relevant to that in the knowledge base. \
Try rephrasing your question, or add documents that cover this topic.";

/// Prefix for answers given without knowledge-base support
pub const GENERAL_KNOWLEDGE_CAVEAT: &str =
    "I couldn't find this in the company knowledge base, so this answer is based on general knowledge:";

const SYSTEM_PROMPT: &str = "You are a helpful company assistant with access to the company knowledge base.

Instructions:
1. Use the search results to answer the user's question accurately
2. If the search results contain relevant information, base your answer on them
3. If the search results don't answer the question, say so politely
4. Always be helpful and conversational
5. Cite the source documents you are referencing by name";

const GENERAL_SYSTEM_PROMPT: &str = "You are a helpful company assistant. The company knowledge base \
has nothing on this question. Answer briefly from general knowledge and do not invent company-specific facts.";

const EMAIL_SYSTEM_PROMPT: &str = "You write short, professional workplace emails. \
Reply with the email body only: no subject line, no placeholders in brackets.";

/// Characters of each earlier answer quoted in the prompt
const HISTORY_ANSWER_CHARS: usize = 300;

/// A generated answer and what went into it
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    /// Chunks actually placed in the prompt, best first
    pub used_chunk_ids: Vec<String>,
    pub model_called: bool,
}

/// Passages that fit in `budget` characters, best first
///
/// A lone passage larger than the whole budget is cut down rather than
/// dropped, so the best match always contributes something.
pub fn select_passages(passages: &[RetrievedPassage], budget: usize) -> Vec<RetrievedPassage> {
    let mut ranked: Vec<&RetrievedPassage> = passages.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut selected = Vec::new();
    let mut used = 0usize;
    for passage in ranked {
        let len = passage.chunk.text.chars().count();
        if used + len <= budget {
            used += len;
            selected.push(passage.clone());
        } else {
            if selected.is_empty() && budget > 0 {
                let mut cut = passage.clone();
                cut.chunk.text = cut.chunk.text.chars().take(budget).collect();
                selected.push(cut);
            }
            break;
        }
    }

    if selected.len() < passages.len() {
        log::debug!(
            "Context budget {} kept {} of {} passages",
            budget,
            selected.len(),
            passages.len()
        );
    }
    selected
}

fn format_history(history: &[&ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in history {
        out.push_str(&format!(
            "User: {}\nAssistant: {}\n",
            collapse_whitespace(&turn.question),
            truncate_chars(&collapse_whitespace(&turn.answer), HISTORY_ANSWER_CHARS)
        ));
    }
    out
}

/// Builds prompts and calls the language model
pub struct Generator {
    model: Arc<dyn LanguageModel>,
    config: GenerationConfig,
    params: GenerationParams,
    timeout: Duration,
}

impl Generator {
    pub fn new(model: Arc<dyn LanguageModel>, config: GenerationConfig, llm: &LlmConfig) -> Self {
        Self {
            model,
            config,
            params: GenerationParams::from(llm),
            timeout: llm.timeout(),
        }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Knowledge-grounded prompt; returns the prompt and the chunk ids used
    pub fn build_prompt(
        &self,
        question: &str,
        passages: &[RetrievedPassage],
        history: &[&ConversationTurn],
    ) -> (Prompt, Vec<String>) {
        let selected = select_passages(passages, self.config.context_char_budget);
        let recent = &history[history.len().saturating_sub(self.config.history_turns)..];

        let mut user = String::from("Knowledge base search results:\n\n");
        for (i, passage) in selected.iter().enumerate() {
            user.push_str(&format!(
                "[{}] Source: {} (relevance {:.3})\n{}\n\n",
                i + 1,
                passage.filename,
                passage.score,
                passage.chunk.text.trim()
            ));
        }
        if !recent.is_empty() {
            user.push_str("Recent conversation:\n");
            user.push_str(&format_history(recent));
            user.push('\n');
        }
        user.push_str(&format!("User question: {}\n\nAnswer:", question));

        let ids = selected.into_iter().map(|p| p.chunk.id).collect();
        (Prompt::new(SYSTEM_PROMPT, user), ids)
    }

    async fn call_model(&self, prompt: &Prompt) -> Result<String> {
        log::debug!("Calling {} with a {}-char prompt", self.model.name(), prompt.char_len());
        complete_with_timeout(self.model.as_ref(), prompt, &self.params, self.timeout)
            .await
            .map_err(|e| match e {
                AgentError::GenerationFailed(_) => e,
                other => AgentError::GenerationFailed(other.to_string()),
            })
    }

    /// Answer `question` from `passages` and recent `history`
    pub async fn generate(
        &self,
        question: &str,
        passages: &[RetrievedPassage],
        history: &[&ConversationTurn],
    ) -> Result<GeneratedAnswer> {
        if passages.is_empty() {
            return self.generate_without_context(question, history).await;
        }

        let (prompt, used_chunk_ids) = self.build_prompt(question, passages, history);
        let text = self.call_model(&prompt).await?;
        Ok(GeneratedAnswer {
            text,
            used_chunk_ids,
            model_called: true,
        })
    }

    async fn generate_without_context(
        &self,
        question: &str,
        history: &[&ConversationTurn],
    ) -> Result<GeneratedAnswer> {
        match self.config.no_context {
            NoContextPolicy::Decline => Ok(GeneratedAnswer {
                text: NO_CONTEXT_ANSWER.to_string(),
                used_chunk_ids: Vec::new(),
                model_called: false,
            }),
            NoContextPolicy::GeneralKnowledge => {
                let recent = &history[history.len().saturating_sub(self.config.history_turns)..];
                let mut user = String::new();
                if !recent.is_empty() {
                    user.push_str("Recent conversation:\n");
                    user.push_str(&format_history(recent));
                    user.push('\n');
                }
                user.push_str(&format!("User question: {}\n\nAnswer:", question));

                let body = self
                    .call_model(&Prompt::new(GENERAL_SYSTEM_PROMPT, user))
                    .await?;
                Ok(GeneratedAnswer {
                    text: format!("{}\n\n{}", GENERAL_KNOWLEDGE_CAVEAT, body),
                    used_chunk_ids: Vec::new(),
                    model_called: true,
                })
            }
        }
    }

    /// Body text for an email draft, grounded in `passages` when present
    pub async fn compose_email(
        &self,
        recipient: Option<&str>,
        subject: &str,
        request: &str,
        passages: &[RetrievedPassage],
    ) -> Result<String> {
        let mut user = format!(
            "Request: {}\nRecipient: {}\nSubject: {}\n",
            request,
            recipient.unwrap_or("(not specified)"),
            subject
        );
        let selected = select_passages(passages, self.config.context_char_budget);
        if !selected.is_empty() {
            user.push_str("\nRelevant company information:\n");
            for passage in &selected {
                user.push_str(&format!("- From {}: {}\n", passage.filename, passage.chunk.text.trim()));
            }
        }
        user.push_str("\nEmail body:");
        self.call_model(&Prompt::new(EMAIL_SYSTEM_PROMPT, user)).await
    }
}
