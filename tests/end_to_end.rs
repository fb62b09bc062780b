//! End-to-end tests: ingestion, retrieval, deletion and full agent turns

use async_trait::async_trait;
use knowledge_agent::agent::{
    ConversationSession, GenerationParams, Intent, KnowledgeAgent, LanguageModel,
    NO_CONTEXT_ANSWER, Prompt,
};
use knowledge_agent::api::{KnowledgeBase, Retriever, sample_documents};
use knowledge_agent::config::{ChunkingStrategy, Config, NoContextPolicy};
use knowledge_agent::ml::HashingEmbedder;
use knowledge_agent::text::DocumentFormat;
use knowledge_agent::{AgentError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const FLOOR: f32 = 0.1;

fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = 40;
    config.chunking.overlap = 5;
    config.chunking.strategy = ChunkingStrategy::Word;
    config.embedding.dimension = 256;
    config.retrieval.top_k = 3;
    config.retrieval.min_score = FLOOR;
    config.intent.model_fallback = false;
    config.generation.no_context = NoContextPolicy::Decline;
    config
}

/// Counts calls and answers with a fixed line
struct CountingModel {
    calls: AtomicUsize,
}

impl CountingModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LanguageModel for CountingModel {
    async fn complete(&self, _prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Based on the Engineering Guidelines, production runs on PostgreSQL.".to_string())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        "counting".to_string()
    }
}

async fn seeded_knowledge_base(config: &Config) -> (Arc<KnowledgeBase>, Vec<String>) {
    let kb = KnowledgeBase::in_memory(config, Arc::new(HashingEmbedder::new(256))).unwrap();
    let mut ids = Vec::new();
    for sample in sample_documents() {
        let record = kb
            .ingest_text(sample.filename, DocumentFormat::Txt, sample.text)
            .await
            .unwrap();
        ids.push(record.id);
    }
    (Arc::new(kb), ids)
}

#[tokio::test]
async fn test_query_finds_matching_document() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = test_config();
    let (kb, ids) = seeded_knowledge_base(&config).await;

    let documents = kb.list_documents()?;
    assert_eq!(documents.len(), 3);
    let total: usize = documents.iter().map(|d| d.chunk_count).sum();
    assert_eq!(kb.index_len()?, total);
    assert!(documents.iter().all(|d| d.chunk_count >= 1));

    let retriever = Retriever::new(kb.clone(), config.retrieval.clone());
    let passages = retriever
        .search("Which database and message queue does engineering use in production?")
        .await?;

    assert!(!passages.is_empty());
    let top = &passages[0];
    assert_eq!(top.chunk.document_id, ids[1]);
    assert_eq!(top.filename, "Engineering Guidelines.txt");
    assert!(top.score >= FLOOR);
    assert!(passages.windows(2).all(|w| w[0].score >= w[1].score));
    Ok(())
}

#[tokio::test]
async fn test_deleted_document_leaves_no_hits() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = test_config();
    let (kb, ids) = seeded_knowledge_base(&config).await;
    let before = kb.index_len()?;
    let doomed = kb.get_document(&ids[1])?;

    let removed = kb.delete_document(&ids[1])?;
    assert_eq!(removed, doomed.chunk_count);
    assert_eq!(kb.index_len()?, before - removed);
    assert!(matches!(kb.get_document(&ids[1]), Err(AgentError::NotFound(_))));

    let retriever = Retriever::new(kb.clone(), config.retrieval.clone());
    let passages = retriever
        .retrieve("database message queue production engineering", 100, -1.0)
        .await?;
    assert!(!passages.is_empty());
    assert!(passages.iter().all(|p| p.chunk.document_id != ids[1]));
    Ok(())
}

#[tokio::test]
async fn test_reingestion_is_idempotent() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = test_config();
    let (kb, ids) = seeded_knowledge_base(&config).await;
    let before = kb.stats()?;

    let sample = sample_documents()[0];
    let again = kb
        .ingest_text(sample.filename, DocumentFormat::Txt, sample.text)
        .await?;
    assert_eq!(again.id, ids[0]);

    let after = kb.stats()?;
    assert_eq!(after.document_count, before.document_count);
    assert_eq!(after.chunk_count, before.chunk_count);
    assert_eq!(after.index_entries, before.index_entries);
    Ok(())
}

#[tokio::test]
async fn test_floor_above_all_scores_gives_no_context_answer() {
    let mut config = test_config();
    config.retrieval.min_score = 1.5;
    let (kb, _) = seeded_knowledge_base(&config).await;
    let model = CountingModel::new();
    let agent = KnowledgeAgent::with_model(&config, kb, model.clone());

    let retrieved = agent
        .retriever()
        .search("What's our vacation policy?")
        .await
        .unwrap();
    assert!(retrieved.is_empty());

    let mut first = ConversationSession::default();
    let mut second = ConversationSession::default();
    let a = agent
        .handle_turn(&mut first, "What's our vacation policy?")
        .await
        .unwrap();
    let b = agent
        .handle_turn(&mut second, "What's our vacation policy?")
        .await
        .unwrap();

    assert_eq!(a.intent(), Intent::KnowledgeQuery);
    assert_eq!(a.answer, NO_CONTEXT_ANSWER);
    assert_eq!(a.answer, b.answer);
    assert!(a.passages.is_empty());
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_session_keeps_most_recent_turns() {
    let mut config = test_config();
    config.conversation.max_exchanges = 3;
    let (kb, _) = seeded_knowledge_base(&config).await;
    let agent = KnowledgeAgent::with_model(&config, kb, CountingModel::new());
    let mut session = ConversationSession::new(config.conversation.clone());

    let questions = [
        "What's our vacation policy?",
        "Which database do we use in production?",
        "What is the pricing for the starter plan?",
        "How often are security audits?",
        "What is the home office stipend?",
    ];
    for (i, question) in questions.iter().enumerate() {
        agent.handle_turn(&mut session, question).await.unwrap();
        assert_eq!(session.len(), (i + 1).min(3));
    }

    let kept: Vec<&str> = session.turns().map(|t| t.question.as_str()).collect();
    assert_eq!(kept, questions[2..].to_vec());
}

#[tokio::test]
async fn test_ingestion_runs_alongside_queries() {
    let config = test_config();
    let (kb, _) = seeded_knowledge_base(&config).await;
    let retriever = Retriever::new(kb.clone(), config.retrieval.clone());

    let ingest = kb.ingest_text(
        "Travel Policy.txt",
        DocumentFormat::Txt,
        "Travel policy: book flights through the company portal. Economy class for trips under six hours.",
    );
    let query = retriever.retrieve("flights travel portal", 10, -1.0);
    let (record, passages) = tokio::join!(ingest, query);

    record.unwrap();
    for passage in passages.unwrap() {
        assert!(kb.get_chunk(&passage.chunk.id).is_ok());
    }
    assert_eq!(kb.list_documents().unwrap().len(), 4);
}
