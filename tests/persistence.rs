//! On-disk round trips of the knowledge base and vector index

use approx::assert_relative_eq;
use knowledge_agent::api::{KnowledgeBase, Retriever, sample_documents};
use knowledge_agent::config::{ChunkingStrategy, Config, DistanceMetric};
use knowledge_agent::ml::{HashingEmbedder, INDEX_FORMAT_VERSION, VectorIndex, build_embedder};
use knowledge_agent::text::DocumentFormat;
use knowledge_agent::AgentError;
use std::path::Path;
use std::sync::Arc;

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = 40;
    config.chunking.overlap = 5;
    config.chunking.strategy = ChunkingStrategy::Word;
    config.embedding.dimension = 256;
    config.retrieval.min_score = 0.0;
    config.storage.database_path = dir.join("knowledge.db");
    config.storage.index_path = dir.join("knowledge.idx");
    config
}

const QUERIES: [&str; 3] = [
    "How many vacation days do employees get?",
    "Which frontend framework do we use?",
    "What does the enterprise plan cost?",
];

async fn rankings(kb: Arc<KnowledgeBase>, config: &Config) -> Vec<Vec<(String, f32)>> {
    let retriever = Retriever::new(kb, config.retrieval.clone());
    let mut out = Vec::new();
    for query in QUERIES {
        let passages = retriever.retrieve(query, 5, -1.0).await.unwrap();
        out.push(
            passages
                .into_iter()
                .map(|p| (p.chunk.id, p.score))
                .collect(),
        );
    }
    out
}

#[tokio::test]
async fn test_reopen_restores_rankings() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());

    let before = {
        let kb = Arc::new(KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?);
        kb.seed_samples().await?;
        rankings(kb, &config).await
    };
    assert!(config.storage.index_path.exists());

    let kb = Arc::new(KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?);
    assert_eq!(kb.list_documents()?.len(), 3);
    let after = rankings(kb, &config).await;

    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(&after) {
        let b_ids: Vec<&str> = b.iter().map(|(id, _)| id.as_str()).collect();
        let a_ids: Vec<&str> = a.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(b_ids, a_ids);
        for ((_, bs), (_, as_)) in b.iter().zip(a) {
            assert_relative_eq!(*bs, *as_, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_index_is_rebuilt_from_store() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());

    let expected = {
        let kb = KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?;
        kb.seed_samples().await?;
        kb.index_len()?
    };
    std::fs::remove_file(&config.storage.index_path)?;

    let kb = KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?;
    assert_eq!(kb.index_len()?, expected);
    assert_eq!(kb.rebuild_index()?, expected);
    Ok(())
}

#[tokio::test]
async fn test_stale_index_entries_are_dropped_on_open() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());

    let kb = KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?;
    let sample = sample_documents()[2];
    kb.ingest_text(sample.filename, DocumentFormat::Txt, sample.text)
        .await?;
    let chunks = kb.stats()?.chunk_count;
    drop(kb);

    // An entry the store has never heard of
    let mut index = VectorIndex::open(&config.storage.index_path)?;
    index.insert("ghost-00000", HashingEmbedder::new(256).embed_sync("pipeline reviews"))?;
    index.save(&config.storage.index_path)?;

    let kb = KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?;
    assert_eq!(kb.index_len()?, chunks);
    Ok(())
}

#[test]
fn test_version_mismatch_fails_fast() {
    let mut index = VectorIndex::new(2, DistanceMetric::Cosine);
    index.insert("a", vec![1.0, 0.0]).unwrap();
    let mut bytes = index.persist().unwrap();
    bytes[4..8].copy_from_slice(&(INDEX_FORMAT_VERSION + 1).to_le_bytes());

    assert!(matches!(
        VectorIndex::load(&bytes),
        Err(AgentError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_dimension_change_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path());
    {
        let kb = KnowledgeBase::open(&config, build_embedder(&config.embedding)?)?;
        kb.seed_samples().await?;
    }

    let result = KnowledgeBase::open(&config, Arc::new(HashingEmbedder::new(128)));
    assert!(matches!(result, Err(AgentError::InvalidConfiguration(_))));
    Ok(())
}
