//! One chat turn, end to end
//!
//! question -> augment with history -> classify -> handler -> record turn.
//! The session is only touched after the handler succeeds, so a failed or
//! cancelled turn leaves the conversation exactly as it was.

use crate::agent::conversation::{AugmentedQuery, ConversationSession, ConversationTurn};
use crate::agent::generation::Generator;
use crate::agent::intent::{
    ClassificationSource, DateRange, Intent, IntentClassification, IntentRouter, IntentSlots,
};
use crate::agent::llm::{LanguageModel, OpenAiCompatibleModel};
use crate::agent::services::{
    CalendarEvent, CalendarService, DraftReceipt, EmailDraft, EmailDrafter, format_events,
};
use crate::api::knowledge_base::{KnowledgeBase, RetrievedPassage};
use crate::api::retriever::Retriever;
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::ml::embedding::build_embedder;
use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a calendar or email collaborator call
const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

const GREETING_REPLY: &str = "Hi! I can answer questions about the company documents, \
look up your calendar, or draft emails. What would you like to know?";

const THANKS_REPLY: &str = "You're welcome! Let me know if there's anything else I can help with.";

const DEFAULT_EMAIL_SUBJECT: &str = "Follow-up";

/// Everything produced by one turn
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub answer: String,
    pub classification: IntentClassification,
    /// Passages the answer was built from, best first
    pub passages: Vec<RetrievedPassage>,
    pub events: Vec<CalendarEvent>,
    pub draft: Option<DraftReceipt>,
    pub was_follow_up: bool,
}

impl AgentResponse {
    fn new(answer: impl Into<String>, classification: IntentClassification, query: &AugmentedQuery) -> Self {
        Self {
            answer: answer.into(),
            classification,
            passages: Vec::new(),
            events: Vec::new(),
            draft: None,
            was_follow_up: query.is_follow_up,
        }
    }

    pub fn intent(&self) -> Intent {
        self.classification.intent
    }

    pub fn retrieved_chunk_ids(&self) -> Vec<String> {
        self.passages.iter().map(|p| p.chunk.id.clone()).collect()
    }
}

async fn with_service_timeout<T>(
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(SERVICE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::ExternalService(format!(
            "{} did not respond within {:?}",
            what, SERVICE_TIMEOUT
        ))),
    }
}

/// Document Q&A agent with optional calendar and email collaborators
pub struct KnowledgeAgent {
    retriever: Retriever,
    router: IntentRouter,
    generator: Generator,
    calendar: Option<Arc<dyn CalendarService>>,
    email: Option<Arc<dyn EmailDrafter>>,
}

impl KnowledgeAgent {
    pub fn new(retriever: Retriever, router: IntentRouter, generator: Generator) -> Self {
        Self {
            retriever,
            router,
            generator,
            calendar: None,
            email: None,
        }
    }

    /// Wire an agent around an open knowledge base and a language model
    pub fn with_model(
        config: &Config,
        knowledge_base: Arc<KnowledgeBase>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let router = if config.intent.model_fallback {
            IntentRouter::with_model(model.clone(), config.llm.timeout())
        } else {
            IntentRouter::rules_only()
        };
        Self::new(
            Retriever::new(knowledge_base, config.retrieval.clone()),
            router,
            Generator::new(model, config.generation.clone(), &config.llm),
        )
    }

    /// Open storage and connect to the configured model server
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let embedder = build_embedder(&config.embedding)?;
        let knowledge_base = Arc::new(KnowledgeBase::open(config, embedder)?);
        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatibleModel::new(&config.llm)?);
        Ok(Self::with_model(config, knowledge_base, model))
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarService>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_email(mut self, email: Arc<dyn EmailDrafter>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        self.retriever.knowledge_base()
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        self.generator.model()
    }

    /// Run one turn and record it in `session` on success
    pub async fn handle_turn(
        &self,
        session: &mut ConversationSession,
        question: &str,
    ) -> Result<AgentResponse> {
        let response = self.respond(session, question).await?;
        if !question.trim().is_empty() {
            session.record(
                ConversationTurn::new(question.trim(), response.answer.clone(), response.retrieved_chunk_ids())
                    .with_intent(response.intent()),
            );
        }
        Ok(response)
    }

    /// Run one turn against `session` without recording it
    pub async fn respond(
        &self,
        session: &ConversationSession,
        question: &str,
    ) -> Result<AgentResponse> {
        let query = session.augment_query(question);
        if query.original.is_empty() {
            let classification = IntentClassification {
                intent: Intent::Other,
                slots: IntentSlots::default(),
                source: ClassificationSource::Default,
            };
            return Ok(AgentResponse::new(GREETING_REPLY, classification, &query));
        }
        let classification = self.router.classify(&query).await;
        self.dispatch(session, &query, classification).await
    }

    /// Run the handler for an already classified query
    pub async fn dispatch(
        &self,
        session: &ConversationSession,
        query: &AugmentedQuery,
        classification: IntentClassification,
    ) -> Result<AgentResponse> {
        match classification.intent {
            Intent::KnowledgeQuery => self.answer_question(session, query, classification).await,
            Intent::CalendarQuery => self.lookup_calendar(query, classification).await,
            Intent::EmailDraft => self.draft_email(query, classification).await,
            Intent::Other => {
                let reply = if query.original.to_lowercase().contains("thank") {
                    THANKS_REPLY
                } else {
                    GREETING_REPLY
                };
                Ok(AgentResponse::new(reply, classification, query))
            }
        }
    }

    async fn answer_question(
        &self,
        session: &ConversationSession,
        query: &AugmentedQuery,
        classification: IntentClassification,
    ) -> Result<AgentResponse> {
        let passages = self.retriever.search(&query.text).await?;
        let history = session.recent(session.len());
        let generated = self
            .generator
            .generate(&query.original, &passages, &history)
            .await?;

        // Only passages that made it into the prompt count as sources
        let mut cited: Vec<RetrievedPassage> = Vec::with_capacity(generated.used_chunk_ids.len());
        for id in &generated.used_chunk_ids {
            if let Some(passage) = passages.iter().find(|p| &p.chunk.id == id) {
                cited.push(passage.clone());
            }
        }
        if cited.len() < passages.len() {
            log::debug!("Citing {} of {} retrieved passages", cited.len(), passages.len());
        }

        let mut response = AgentResponse::new(generated.text, classification, query);
        response.passages = cited;
        Ok(response)
    }

    async fn lookup_calendar(
        &self,
        query: &AugmentedQuery,
        classification: IntentClassification,
    ) -> Result<AgentResponse> {
        let range = classification
            .slots
            .date_range
            .unwrap_or_else(|| DateRange::single(Local::now().date_naive()));
        let Some(calendar) = &self.calendar else {
            let answer = format!(
                "Calendar access isn't connected, so I can't check your schedule for {}.",
                range
            );
            return Ok(AgentResponse::new(answer, classification, query));
        };

        let events = with_service_timeout("calendar", calendar.events(&range)).await?;
        log::info!("Calendar returned {} events for {}", events.len(), range);

        let mut response = AgentResponse::new(format_events(&range, &events), classification, query);
        response.events = events;
        Ok(response)
    }

    async fn draft_email(
        &self,
        query: &AugmentedQuery,
        classification: IntentClassification,
    ) -> Result<AgentResponse> {
        let recipient = classification.slots.recipient.clone();
        let subject = classification
            .slots
            .subject_hint
            .clone()
            .unwrap_or_else(|| DEFAULT_EMAIL_SUBJECT.to_string());

        // Knowledge-base context is optional here; a draft without it is still useful.
        let passages = match &classification.slots.subject_hint {
            Some(hint) => match self.retriever.search(hint).await {
                Ok(passages) => passages,
                Err(e) => {
                    log::warn!("Skipping knowledge context for email draft: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let body = self
            .generator
            .compose_email(recipient.as_deref(), &subject, &query.original, &passages)
            .await?;
        let draft = EmailDraft {
            recipient,
            subject,
            body,
        };

        let mut response = match &self.email {
            Some(email) => {
                let receipt = with_service_timeout("email", email.create_draft(&draft)).await?;
                log::info!("Created email draft {}", receipt.draft_id);
                let mut response = AgentResponse::new(
                    format!("I saved a draft{}.\n\n{}", describe_draft(&draft), render_draft(&draft)),
                    classification,
                    query,
                );
                response.draft = Some(receipt);
                response
            }
            None => AgentResponse::new(
                format!(
                    "Email drafting isn't connected, but here's a draft you can copy:\n\n{}",
                    render_draft(&draft)
                ),
                classification,
                query,
            ),
        };
        response.passages = passages;
        Ok(response)
    }
}

fn describe_draft(draft: &EmailDraft) -> String {
    match &draft.recipient {
        Some(recipient) => format!(" to {}", recipient),
        None => String::new(),
    }
}

fn render_draft(draft: &EmailDraft) -> String {
    let mut out = String::new();
    if let Some(recipient) = &draft.recipient {
        out.push_str(&format!("To: {}\n", recipient));
    }
    out.push_str(&format!("Subject: {}\n\n{}", draft.subject, draft.body));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{GenerationParams, Prompt};
    use crate::config::{ChunkingStrategy, NoContextPolicy};
    use crate::ml::embedding::HashingEmbedder;
    use crate::text::DocumentFormat;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct CannedModel {
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn complete(&self, prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.clone());
            Ok("Employees get 25 days of paid vacation (Employee Handbook).".to_string())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> String {
            "canned".to_string()
        }
    }

    struct FailingModel;

    #[async_trait]
    impl LanguageModel for FailingModel {
        async fn complete(&self, _prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            Err(AgentError::GenerationFailed("model offline".into()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(AgentError::ExternalService("offline".into()))
        }

        fn name(&self) -> String {
            "failing".to_string()
        }
    }

    struct FixedCalendar;

    #[async_trait]
    impl CalendarService for FixedCalendar {
        async fn events(&self, range: &DateRange) -> Result<Vec<CalendarEvent>> {
            let start = Utc
                .from_utc_datetime(&range.start.and_hms_opt(9, 0, 0).unwrap());
            Ok(vec![CalendarEvent {
                title: "Team standup".into(),
                start,
                end: start + chrono::Duration::minutes(15),
                attendees: vec![],
            }])
        }
    }

    struct RecordingDrafter {
        drafts: Mutex<Vec<EmailDraft>>,
    }

    #[async_trait]
    impl EmailDrafter for RecordingDrafter {
        async fn create_draft(&self, draft: &EmailDraft) -> Result<DraftReceipt> {
            self.drafts.lock().unwrap().push(draft.clone());
            Ok(DraftReceipt {
                draft_id: "draft-1".into(),
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.chunking.chunk_size = 40;
        config.chunking.overlap = 5;
        config.chunking.strategy = ChunkingStrategy::Word;
        config.embedding.dimension = 256;
        config.retrieval.min_score = 0.05;
        config.intent.model_fallback = false;
        config.generation.no_context = NoContextPolicy::Decline;
        config
    }

    async fn seeded_agent(model: Arc<dyn LanguageModel>) -> KnowledgeAgent {
        let config = test_config();
        let kb = KnowledgeBase::in_memory(&config, Arc::new(HashingEmbedder::new(256))).unwrap();
        kb.ingest_text(
            "Employee Handbook.txt",
            DocumentFormat::Txt,
            "Vacation policy: all employees receive 25 days of paid vacation per year.",
        )
        .await
        .unwrap();
        KnowledgeAgent::with_model(&config, Arc::new(kb), model)
    }

    fn canned() -> Arc<CannedModel> {
        Arc::new(CannedModel {
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_knowledge_turn_is_recorded() {
        let model = canned();
        let agent = seeded_agent(model.clone()).await;
        let mut session = ConversationSession::default();

        let response = agent
            .handle_turn(&mut session, "What's our vacation policy?")
            .await
            .unwrap();
        assert_eq!(response.intent(), Intent::KnowledgeQuery);
        assert!(!response.passages.is_empty());
        assert_eq!(session.len(), 1);

        let turn = session.last_turn().unwrap();
        assert_eq!(turn.intent, Some(Intent::KnowledgeQuery));
        assert_eq!(turn.retrieved_chunk_ids, response.retrieved_chunk_ids());

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].user.contains("Source: Employee Handbook.txt"));
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_session_untouched() {
        let agent = seeded_agent(Arc::new(FailingModel)).await;
        let mut session = ConversationSession::default();
        session.append("earlier", "answer", vec![]);

        let err = agent
            .handle_turn(&mut session, "What's our vacation policy?")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::GenerationFailed(_)));
        assert_eq!(session.len(), 1);
        assert_eq!(session.last_turn().unwrap().question, "earlier");
    }

    #[tokio::test]
    async fn test_calendar_without_service() {
        let agent = seeded_agent(canned()).await;
        let mut session = ConversationSession::default();
        let response = agent
            .handle_turn(&mut session, "What's on my calendar tomorrow?")
            .await
            .unwrap();
        assert_eq!(response.intent(), Intent::CalendarQuery);
        assert!(response.answer.contains("isn't connected"));
        assert!(response.passages.is_empty());
    }

    #[tokio::test]
    async fn test_calendar_with_service() {
        let agent = seeded_agent(canned()).await.with_calendar(Arc::new(FixedCalendar));
        let mut session = ConversationSession::default();
        let response = agent
            .handle_turn(&mut session, "What's on my calendar tomorrow?")
            .await
            .unwrap();
        assert_eq!(response.events.len(), 1);
        assert!(response.answer.contains("Team standup"));
    }

    #[tokio::test]
    async fn test_email_draft_goes_to_drafter() {
        let drafter = Arc::new(RecordingDrafter {
            drafts: Mutex::new(Vec::new()),
        });
        let agent = seeded_agent(canned()).await.with_email(drafter.clone());
        let mut session = ConversationSession::default();

        let response = agent
            .handle_turn(&mut session, "Draft an email to Sarah about the vacation policy")
            .await
            .unwrap();
        assert_eq!(response.intent(), Intent::EmailDraft);
        assert_eq!(response.draft.as_ref().unwrap().draft_id, "draft-1");

        let drafts = drafter.drafts.lock().unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].recipient.as_deref(), Some("Sarah"));
    }

    #[tokio::test]
    async fn test_small_talk_needs_no_model() {
        let agent = seeded_agent(Arc::new(FailingModel)).await;
        let mut session = ConversationSession::default();
        let response = agent.handle_turn(&mut session, "thanks!").await.unwrap();
        assert_eq!(response.intent(), Intent::Other);
        assert_eq!(response.answer, THANKS_REPLY);
    }

    #[tokio::test]
    async fn test_follow_up_stays_knowledge_query() {
        let agent = seeded_agent(canned()).await;
        let mut session = ConversationSession::default();
        agent
            .handle_turn(&mut session, "What's our vacation policy?")
            .await
            .unwrap();

        let response = agent.handle_turn(&mut session, "tell me more").await.unwrap();
        assert!(response.was_follow_up);
        assert_eq!(response.intent(), Intent::KnowledgeQuery);
        assert_eq!(session.len(), 2);
    }

    #[tokio::test]
    async fn test_sources_are_limited_to_prompt_passages() {
        let mut config = test_config();
        config.generation.context_char_budget = 100;
        let kb = KnowledgeBase::in_memory(&config, Arc::new(HashingEmbedder::new(256))).unwrap();
        kb.ingest_text(
            "Employee Handbook.txt",
            DocumentFormat::Txt,
            "Vacation policy: all employees receive 25 days of paid vacation per year.",
        )
        .await
        .unwrap();
        kb.ingest_text(
            "Travel Policy.txt",
            DocumentFormat::Txt,
            "Vacation travel policy: employees book vacation flights through the portal.",
        )
        .await
        .unwrap();
        let model = canned();
        let agent = KnowledgeAgent::with_model(&config, Arc::new(kb), model.clone());

        let retrieved = agent.retriever().search("What's our vacation policy?").await.unwrap();
        assert_eq!(retrieved.len(), 2);

        let mut session = ConversationSession::default();
        let response = agent
            .handle_turn(&mut session, "What's our vacation policy?")
            .await
            .unwrap();
        assert_eq!(response.passages.len(), 1);
        assert_eq!(response.passages[0].chunk.id, retrieved[0].chunk.id);
        assert_eq!(
            session.last_turn().unwrap().retrieved_chunk_ids,
            vec![retrieved[0].chunk.id.clone()]
        );

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts[0].user.matches("Source: ").count(), 1);
    }
}
