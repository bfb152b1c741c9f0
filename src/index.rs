//! Index store: keyword (inverted, TF-IDF) and vector indexes over
//! document chunks.
//!
//! The [`IndexStore`] trait defines the storage operations needed by the
//! retrieval engine, enabling pluggable backends. [`MemoryIndex`] is the
//! in-process implementation: `HashMap` state behind a single
//! `std::sync::RwLock`, so a document's keyword and vector structures
//! are always mutated under one write lock and readers see either the
//! pre- or post-update state, never a half-written document.
//!
//! Embeddings are populated separately from chunking: [`IndexStore::upsert`]
//! leaves fresh chunks without vectors, and a backfill pass drains
//! [`IndexStore::pending_embeddings`] once the AI backend is reachable.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chunk::chunk_document;
use crate::models::{Chunk, Document};

/// Outcome of an upsert, for logging and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Content hash changed (or document is new): re-chunked, embeddings
    /// invalidated.
    Indexed { chunks: usize },
    /// Content hash unchanged: no-op.
    Unchanged,
    /// Document carried the deletion flag: all chunks removed.
    Removed,
}

/// A candidate chunk returned from keyword or vector search.
///
/// Carries document metadata so the retrieval engine can merge, dedupe,
/// and tie-break without further lookups.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub path: String,
    pub updated_at: DateTime<Utc>,
    /// Raw score: TF-IDF sum for keyword hits, cosine similarity for
    /// vector hits. Normalized later, per channel.
    pub raw_score: f64,
    pub snippet: String,
}

/// A chunk still awaiting an embedding vector.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
}

/// Abstract index backend.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or update a document. Re-chunks and invalidates embeddings
    /// only when the content hash differs from the stored one.
    async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome>;

    /// Delete all chunks and embeddings for a document.
    async fn remove(&self, document_id: &str) -> Result<()>;

    /// Tokenized full-text search with TF-IDF scoring.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkHit>>;

    /// Cosine similarity search over chunk embeddings. When `threshold`
    /// is set, only chunks meeting it are returned.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<ChunkHit>>;

    /// Chunks whose embeddings are missing or stale.
    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingChunk>>;

    /// Attach an embedding vector to a chunk.
    async fn set_embedding(&self, chunk_id: &str, vector: Vec<f32>) -> Result<()>;

    /// Fetch a stored document snapshot by id.
    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    async fn document_count(&self) -> Result<usize>;
}

// ============ In-memory implementation ============

struct IndexedChunk {
    chunk: Chunk,
    /// Term frequencies for the chunk's tokens.
    tokens: HashMap<String, usize>,
    embedding: Option<Vec<f32>>,
}

struct IndexedDocument {
    doc: Document,
    chunks: Vec<IndexedChunk>,
}

/// In-memory index over note chunks.
pub struct MemoryIndex {
    docs: RwLock<HashMap<String, IndexedDocument>>,
    max_tokens: usize,
}

impl MemoryIndex {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            max_tokens,
        }
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome> {
        let mut docs = self.docs.write().unwrap();

        if doc.deleted {
            docs.remove(&doc.id);
            return Ok(UpsertOutcome::Removed);
        }

        if let Some(existing) = docs.get(&doc.id) {
            if existing.doc.content_hash == doc.content_hash {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let chunks: Vec<IndexedChunk> = chunk_document(doc, self.max_tokens)
            .into_iter()
            .map(|chunk| IndexedChunk {
                tokens: term_frequencies(&chunk.text),
                chunk,
                embedding: None,
            })
            .collect();

        let count = chunks.len();
        docs.insert(
            doc.id.clone(),
            IndexedDocument {
                doc: doc.clone(),
                chunks,
            },
        );
        Ok(UpsertOutcome::Indexed { chunks: count })
    }

    async fn remove(&self, document_id: &str) -> Result<()> {
        self.docs.write().unwrap().remove(document_id);
        Ok(())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkHit>> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().unwrap();
        let total_chunks: usize = docs.values().map(|d| d.chunks.len()).sum();
        if total_chunks == 0 {
            return Ok(Vec::new());
        }

        // Document frequency per query term, over chunks.
        let mut df: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            let count = docs
                .values()
                .flat_map(|d| d.chunks.iter())
                .filter(|c| c.tokens.contains_key(term.as_str()))
                .count();
            df.insert(term.as_str(), count);
        }

        let mut hits: Vec<ChunkHit> = Vec::new();
        for indexed in docs.values() {
            for ic in &indexed.chunks {
                let mut score = 0.0f64;
                for term in &terms {
                    let tf = ic.tokens.get(term.as_str()).copied().unwrap_or(0);
                    if tf == 0 {
                        continue;
                    }
                    let dfi = df.get(term.as_str()).copied().unwrap_or(0);
                    let idf = (1.0 + total_chunks as f64 / (1.0 + dfi as f64)).ln();
                    score += tf as f64 * idf;
                }
                if score > 0.0 {
                    hits.push(ChunkHit {
                        chunk_id: ic.chunk.id.clone(),
                        document_id: indexed.doc.id.clone(),
                        title: indexed.doc.title.clone(),
                        path: indexed.doc.path.clone(),
                        updated_at: indexed.doc.updated_at,
                        raw_score: score,
                        snippet: keyword_snippet(&ic.chunk.text, &terms),
                    });
                }
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<ChunkHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().unwrap();
        let mut hits: Vec<ChunkHit> = Vec::new();
        for indexed in docs.values() {
            for ic in &indexed.chunks {
                let Some(embedding) = &ic.embedding else {
                    continue;
                };
                let sim = cosine_similarity(query_vec, embedding);
                if let Some(t) = threshold {
                    if sim < t {
                        continue;
                    }
                }
                hits.push(ChunkHit {
                    chunk_id: ic.chunk.id.clone(),
                    document_id: indexed.doc.id.clone(),
                    title: indexed.doc.title.clone(),
                    path: indexed.doc.path.clone(),
                    updated_at: indexed.doc.updated_at,
                    raw_score: sim as f64,
                    snippet: prefix_chars(&ic.chunk.text, 240),
                });
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<PendingChunk>> {
        let docs = self.docs.read().unwrap();
        let mut pending: Vec<PendingChunk> = Vec::new();
        for indexed in docs.values() {
            for ic in &indexed.chunks {
                if ic.embedding.is_none() {
                    pending.push(PendingChunk {
                        chunk_id: ic.chunk.id.clone(),
                        document_id: indexed.doc.id.clone(),
                        text: ic.chunk.text.clone(),
                    });
                    if pending.len() >= limit {
                        return Ok(pending);
                    }
                }
            }
        }
        Ok(pending)
    }

    async fn set_embedding(&self, chunk_id: &str, vector: Vec<f32>) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        for indexed in docs.values_mut() {
            if let Some(ic) = indexed.chunks.iter_mut().find(|c| c.chunk.id == chunk_id) {
                ic.embedding = Some(vector);
                return Ok(());
            }
        }
        // The chunk may have been replaced by a concurrent re-index; the
        // next backfill pass picks up its successor.
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(document_id).map(|d| d.doc.clone()))
    }

    async fn document_count(&self) -> Result<usize> {
        Ok(self.docs.read().unwrap().len())
    }
}

// ============ Scoring helpers ============

/// Lowercase and split on non-alphanumeric boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn term_frequencies(text: &str) -> HashMap<String, usize> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }
    tf
}

/// Deterministic hit ordering: raw score desc, then most recently
/// updated, then path, then chunk id.
fn sort_hits(hits: &mut [ChunkHit]) {
    hits.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.path.cmp(&b.path))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Excerpt around the first query-term occurrence, char-safe.
fn keyword_snippet(text: &str, terms: &[String]) -> String {
    let lower = text.to_lowercase();
    let pos = terms
        .iter()
        .filter_map(|t| lower.find(t.as_str()))
        .min()
        .unwrap_or(0);
    // Back up to the nearest char boundary, then take a window.
    let mut start = pos.min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let window: String = text[start..].chars().take(240).collect();
    window.replace('\n', " ").trim().to_string()
}

fn prefix_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect::<String>().replace('\n', " ").trim().to_string()
}

/// Cosine similarity between two embedding vectors. Returns 0.0 for
/// empty or mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, path: &str, content: &str) -> Document {
        Document::new(id, path, path.trim_end_matches(".md"), content)
    }

    #[tokio::test]
    async fn test_upsert_hash_gated() {
        let index = MemoryIndex::new(700);
        let d = doc("d1", "a.md", "the design doc describes the architecture");

        let out = index.upsert(&d).await.unwrap();
        assert!(matches!(out, UpsertOutcome::Indexed { chunks: 1 }));

        // Same content: no-op.
        let out = index.upsert(&d).await.unwrap();
        assert_eq!(out, UpsertOutcome::Unchanged);

        // Changed content: re-indexed, embeddings invalidated.
        let d2 = doc("d1", "a.md", "completely new content about deployment");
        let out = index.upsert(&d2).await.unwrap();
        assert!(matches!(out, UpsertOutcome::Indexed { .. }));
    }

    #[tokio::test]
    async fn test_deleted_document_removed() {
        let index = MemoryIndex::new(700);
        let mut d = doc("d1", "a.md", "searchable text");
        index.upsert(&d).await.unwrap();
        assert_eq!(index.document_count().await.unwrap(), 1);

        d.deleted = true;
        let out = index.upsert(&d).await.unwrap();
        assert_eq!(out, UpsertOutcome::Removed);
        assert_eq!(index.document_count().await.unwrap(), 0);
        assert!(index.keyword_search("searchable", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_relevance() {
        let index = MemoryIndex::new(700);
        index
            .upsert(&doc("d1", "a.md", "design design design of the system"))
            .await
            .unwrap();
        index
            .upsert(&doc("d2", "b.md", "a single design mention here"))
            .await
            .unwrap();
        index
            .upsert(&doc("d3", "c.md", "nothing relevant at all"))
            .await
            .unwrap();

        let hits = index.keyword_search("design", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "d1");
        assert!(hits[0].raw_score > hits[1].raw_score);
    }

    #[tokio::test]
    async fn test_keyword_search_empty_query() {
        let index = MemoryIndex::new(700);
        index.upsert(&doc("d1", "a.md", "content")).await.unwrap();
        assert!(index.keyword_search("", 10).await.unwrap().is_empty());
        assert!(index.keyword_search("   ", 10).await.unwrap().is_empty());
        assert!(index.keyword_search("content", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_threshold() {
        let index = MemoryIndex::new(700);
        index.upsert(&doc("d1", "a.md", "alpha")).await.unwrap();
        index.upsert(&doc("d2", "b.md", "beta")).await.unwrap();

        let pending = index.pending_embeddings(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        for p in &pending {
            let v = if p.document_id == "d1" {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            };
            index.set_embedding(&p.chunk_id, v).await.unwrap();
        }
        assert!(index.pending_embeddings(10).await.unwrap().is_empty());

        let hits = index.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "d1");

        let hits = index.vector_search(&[1.0, 0.0], 10, Some(0.5)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
    }

    #[tokio::test]
    async fn test_reindex_invalidates_embeddings() {
        let index = MemoryIndex::new(700);
        let d = doc("d1", "a.md", "original text");
        index.upsert(&d).await.unwrap();

        let pending = index.pending_embeddings(10).await.unwrap();
        index
            .set_embedding(&pending[0].chunk_id, vec![1.0, 0.0])
            .await
            .unwrap();
        assert!(index.pending_embeddings(10).await.unwrap().is_empty());

        let d2 = doc("d1", "a.md", "rewritten text entirely");
        index.upsert(&d2).await.unwrap();
        // Stale vectors are gone; the chunk must be re-embedded.
        assert_eq!(index.pending_embeddings(10).await.unwrap().len(), 1);
        assert!(index.vector_search(&[1.0, 0.0], 10, None).await.unwrap().is_empty());
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Design-Doc, v2!"), vec!["design", "doc", "v2"]);
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
