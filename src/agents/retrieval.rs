//! Retrieval seam for the agent façade.
//!
//! The full indexing subsystem lives elsewhere; agents only need
//! "give me the context relevant to this request". [`EmbeddingRetriever`]
//! is a small in-memory implementation backed by the embedder pool.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::llm::EmbedderPool;

/// Source of retrieval context.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Context block for `query` built from at most `top_k` chunks. An
    /// empty string means nothing relevant was found.
    async fn relevant_context(&self, query: &str, top_k: usize) -> Result<String>;
}

/// A scored match.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub score: f32,
}

struct Document {
    id: String,
    text: String,
    embedding: Vec<f32>,
}

/// Minimum cosine similarity for a chunk to count as relevant.
const DEFAULT_THRESHOLD: f32 = 0.3;

/// In-memory vector collection.
pub struct EmbeddingRetriever {
    embedder: Arc<EmbedderPool>,
    documents: RwLock<Vec<Document>>,
    threshold: f32,
}

impl EmbeddingRetriever {
    pub fn new(embedder: Arc<EmbedderPool>) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Embed and add `(id, text)` pairs. Returns the new collection size.
    pub async fn add_documents(&self, docs: Vec<(String, String)>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(self.documents.read().await.len());
        }
        let texts = docs.iter().map(|(_, text)| text.clone()).collect();
        let embeddings = self.embedder.embed_multiple(texts).await?;

        let mut documents = self.documents.write().await;
        for ((id, text), embedding) in docs.into_iter().zip(embeddings) {
            documents.push(Document { id, text, embedding });
        }
        Ok(documents.len())
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Best matches above the threshold, highest score first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        if self.is_empty().await {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let documents = self.documents.read().await;
        let mut scored: Vec<RetrievedChunk> = documents
            .iter()
            .map(|doc| RetrievedChunk {
                id: doc.id.clone(),
                text: doc.text.clone(),
                score: cosine_similarity(&query_embedding, &doc.embedding),
            })
            .filter(|chunk| chunk.score >= self.threshold)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait]
impl ContextRetriever for EmbeddingRetriever {
    async fn relevant_context(&self, query: &str, top_k: usize) -> Result<String> {
        let chunks = self.search(query, top_k).await?;
        Ok(chunks
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] (source: {}, score {:.2})\n{}", i + 1, c.id, c.score, c.text))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// Cosine similarity; 0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{EmbeddingClient, PoolStrategy, ProviderConfig};
    use std::time::Duration;

    /// Embeds text as keyword presence flags.
    struct KeywordEmbedder;

    const KEYWORDS: [&str; 3] = ["rust", "sqlite", "weather"];

    #[async_trait]
    impl EmbeddingClient for KeywordEmbedder {
        async fn embed(&self, _model: String, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    KEYWORDS
                        .iter()
                        .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
                        .collect()
                })
                .collect())
        }
    }

    fn retriever() -> EmbeddingRetriever {
        let client: Arc<dyn EmbeddingClient> = Arc::new(KeywordEmbedder);
        let pool = EmbedderPool::new(
            PoolStrategy::RoundRobin,
            Duration::from_secs(1),
            vec![(ProviderConfig::new("kw", "http://unused", "kw"), client)],
        );
        EmbeddingRetriever::new(Arc::new(pool))
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn ranks_relevant_documents_first() {
        let r = retriever();
        r.add_documents(vec![
            ("a".into(), "Rust and SQLite notes".into()),
            ("b".into(), "Weather report".into()),
            ("c".into(), "Rust ownership".into()),
        ])
        .await
        .unwrap();
        assert_eq!(r.len().await, 3);

        let hits = r.search("rust sqlite", 2).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let context = r.relevant_context("weather", 5).await.unwrap();
        assert!(context.starts_with("[1] (source: b"));
        assert!(!context.contains("Rust"));
    }

    #[tokio::test]
    async fn threshold_drops_weak_matches() {
        let r = retriever().with_threshold(0.9);
        r.add_documents(vec![
            ("a".into(), "Rust and SQLite notes".into()),
            ("c".into(), "Rust ownership".into()),
        ])
        .await
        .unwrap();

        let hits = r.search("rust sqlite", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn empty_collection_yields_empty_context() {
        let r = retriever();
        assert_eq!(r.relevant_context("anything", 5).await.unwrap(), "");
    }
}
