//! Retrieval engine: keyword, semantic, and mixed search over the index.
//!
//! Mixed mode fetches candidates from both channels, min-max normalizes
//! each channel's scores independently, aggregates chunk hits per
//! document (max score wins), then blends with the configured weights. A
//! document present in only one channel keeps that channel's normalized
//! score unweighted, so single-channel matches are not penalized for
//! being absent from the other index.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::error::Error;
use crate::index::{ChunkHit, IndexStore};
use crate::models::{SearchResult, SearchSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Mixed,
}

impl SearchMode {
    /// Whether this mode requires a query embedding from the AI backend.
    pub fn needs_ai(&self) -> bool {
        matches!(self, SearchMode::Semantic | SearchMode::Mixed)
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "mixed" => Ok(SearchMode::Mixed),
            other => Err(Error::InvalidArgument(format!(
                "Unknown search mode: {}. Use keyword, semantic, or mixed.",
                other
            ))),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Keyword => write!(f, "keyword"),
            SearchMode::Semantic => write!(f, "semantic"),
            SearchMode::Mixed => write!(f, "mixed"),
        }
    }
}

/// Best per-document hit for one channel, after normalization.
struct DocChannelScore {
    score: f64,
    hit: ChunkHit,
}

pub struct RetrievalEngine {
    index: Arc<dyn IndexStore>,
    keyword_weight: f64,
    semantic_weight: f64,
    /// Candidates fetched per channel before merging; larger than any
    /// sensible result limit so merging sees both channels' full heads.
    candidate_k: usize,
}

impl RetrievalEngine {
    pub fn new(index: Arc<dyn IndexStore>, config: &RetrievalConfig) -> Self {
        Self {
            index,
            keyword_weight: config.keyword_weight,
            semantic_weight: config.semantic_weight,
            candidate_k: config.candidate_k,
        }
    }

    /// Run a search. Semantic and mixed modes require `query_vec`; the
    /// caller (degradation controller) is responsible for obtaining it
    /// or falling back to keyword mode first.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
        threshold: Option<f32>,
        query_vec: Option<&[f32]>,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        if mode.needs_ai() && query_vec.is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} search requires a query embedding",
                mode
            ))
            .into());
        }

        let fetch = self.candidate_k.max(limit);

        let keyword_hits = match mode {
            SearchMode::Semantic => Vec::new(),
            _ => self.index.keyword_search(query, fetch).await?,
        };

        let vector_hits = match (mode, query_vec) {
            (SearchMode::Keyword, _) | (_, None) => Vec::new(),
            (_, Some(vec)) => self.index.vector_search(vec, fetch, threshold).await?,
        };

        let mut results = merge_channels(
            keyword_hits,
            vector_hits,
            self.keyword_weight,
            self.semantic_weight,
        );
        results.truncate(limit);
        Ok(results)
    }
}

/// Min-max normalize raw scores to `[0, 1]`. A degenerate channel where
/// every score is equal maps everything to 1.0 so a sole hit is not
/// zeroed out.
fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    if range < f64::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores.iter().map(|s| (s - min) / range).collect()
}

/// Collapse chunk hits to per-document scores for one channel, keeping
/// the highest-scoring chunk's metadata as the representative hit.
fn per_document(hits: Vec<ChunkHit>) -> HashMap<String, DocChannelScore> {
    let raw: Vec<f64> = hits.iter().map(|h| h.raw_score).collect();
    let normalized = normalize_scores(&raw);

    let mut best: HashMap<String, DocChannelScore> = HashMap::new();
    for (hit, score) in hits.into_iter().zip(normalized) {
        match best.get(&hit.document_id) {
            Some(existing) if existing.score >= score => {}
            _ => {
                best.insert(hit.document_id.clone(), DocChannelScore { score, hit });
            }
        }
    }
    best
}

fn merge_channels(
    keyword_hits: Vec<ChunkHit>,
    vector_hits: Vec<ChunkHit>,
    keyword_weight: f64,
    semantic_weight: f64,
) -> Vec<SearchResult> {
    let mut keyword = per_document(keyword_hits);
    let vector = per_document(vector_hits);

    let mut results: Vec<SearchResult> = Vec::new();

    for (doc_id, v) in vector {
        let result = match keyword.remove(&doc_id) {
            Some(k) => {
                let blended = (keyword_weight * k.score + semantic_weight * v.score)
                    / (keyword_weight + semantic_weight);
                // Snippet and source attribution follow the stronger channel.
                let (hit, source) = if k.score >= v.score {
                    (k.hit, SearchSource::Keyword)
                } else {
                    (v.hit, SearchSource::Semantic)
                };
                to_result(hit, blended, source)
            }
            None => to_result(v.hit, v.score, SearchSource::Semantic),
        };
        results.push(result);
    }

    // Keyword-only documents keep their normalized score as-is.
    for (_, k) in keyword {
        results.push(to_result(k.hit, k.score, SearchSource::Keyword));
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.path.cmp(&b.path))
    });

    results
}

fn to_result(hit: ChunkHit, score: f64, source: SearchSource) -> SearchResult {
    SearchResult {
        document_id: hit.document_id,
        title: hit.title,
        path: hit.path,
        score: score.clamp(0.0, 1.0),
        snippet: hit.snippet,
        source,
        updated_at: hit.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::index::MemoryIndex;
    use crate::models::Document;
    use chrono::Utc;

    fn hit(doc_id: &str, score: f64) -> ChunkHit {
        ChunkHit {
            chunk_id: format!("{}-c0", doc_id),
            document_id: doc_id.to_string(),
            title: doc_id.to_string(),
            path: format!("{}.md", doc_id),
            updated_at: Utc::now(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    #[test]
    fn test_normalize_scores() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[3.0]), vec![1.0]);
        assert_eq!(normalize_scores(&[2.0, 2.0, 2.0]), vec![1.0, 1.0, 1.0]);

        let n = normalize_scores(&[1.0, 3.0, 5.0]);
        assert_eq!(n[0], 0.0);
        assert_eq!(n[1], 0.5);
        assert_eq!(n[2], 1.0);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("keyword".parse::<SearchMode>().unwrap(), SearchMode::Keyword);
        assert_eq!("MIXED".parse::<SearchMode>().unwrap(), SearchMode::Mixed);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert!(!SearchMode::Keyword.needs_ai());
        assert!(SearchMode::Semantic.needs_ai());
    }

    #[test]
    fn test_merge_blends_overlap() {
        // d1 in both channels, d2 keyword-only, d3 semantic-only.
        let keyword = vec![hit("d1", 4.0), hit("d2", 2.0), hit("dx", 0.5)];
        let vector = vec![hit("d1", 0.9), hit("d3", 0.7), hit("dy", 0.1)];

        let results = merge_channels(keyword, vector, 0.5, 0.5);
        let by_id: HashMap<_, _> = results.iter().map(|r| (r.document_id.clone(), r)).collect();

        // d1 normalizes to 1.0 in both channels: blended score 1.0.
        assert!((by_id["d1"].score - 1.0).abs() < 1e-9);

        // Single-channel docs keep their own normalized score alone.
        let d2_norm = (2.0 - 0.5) / (4.0 - 0.5);
        assert!((by_id["d2"].score - d2_norm).abs() < 1e-9);
        assert_eq!(by_id["d2"].source, SearchSource::Keyword);

        let d3_norm = (0.7 - 0.1) / (0.9 - 0.1);
        assert!((by_id["d3"].score - d3_norm).abs() < 1e-9);
        assert_eq!(by_id["d3"].source, SearchSource::Semantic);
    }

    #[test]
    fn test_merge_weight_extremes() {
        let keyword = vec![hit("d1", 4.0), hit("d2", 1.0)];
        let vector = vec![hit("d1", 0.2), hit("d2", 0.9)];

        // All weight on keyword: overlap docs score by keyword alone.
        let results = merge_channels(keyword.clone(), vector.clone(), 1.0, 0.0);
        let by_id: HashMap<_, _> = results.iter().map(|r| (r.document_id.clone(), r)).collect();
        assert!((by_id["d1"].score - 1.0).abs() < 1e-9);
        assert!((by_id["d2"].score - 0.0).abs() < 1e-9);

        let results = merge_channels(keyword, vector, 0.0, 1.0);
        let by_id: HashMap<_, _> = results.iter().map(|r| (r.document_id.clone(), r)).collect();
        assert!((by_id["d1"].score - 0.0).abs() < 1e-9);
        assert!((by_id["d2"].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_dedupes_chunks_per_document() {
        // Two chunks of the same document in one channel: max survives.
        let mut h1 = hit("d1", 5.0);
        h1.chunk_id = "d1-c0".to_string();
        let mut h2 = hit("d1", 1.0);
        h2.chunk_id = "d1-c1".to_string();

        let results = merge_channels(vec![h1, h2, hit("d2", 3.0)], Vec::new(), 0.5, 0.5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, "d1");
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_engine_empty_query_and_zero_limit() {
        let index = Arc::new(MemoryIndex::new(700));
        index
            .upsert(&Document::new("d1", "a.md", "a", "hello world"))
            .await
            .unwrap();
        let engine = RetrievalEngine::new(index, &RetrievalConfig::default());

        let r = engine
            .search("", SearchMode::Keyword, 10, None, None)
            .await
            .unwrap();
        assert!(r.is_empty());

        let r = engine
            .search("hello", SearchMode::Keyword, 0, None, None)
            .await
            .unwrap();
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_engine_semantic_requires_embedding() {
        let index = Arc::new(MemoryIndex::new(700));
        let engine = RetrievalEngine::new(index, &RetrievalConfig::default());

        let err = engine
            .search("hello", SearchMode::Semantic, 10, None, None)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
        assert!(!crate::error::is_degradable(&err));
    }

    #[tokio::test]
    async fn test_engine_keyword_scores_normalized() {
        let index = Arc::new(MemoryIndex::new(700));
        index
            .upsert(&Document::new("d1", "a.md", "a", "rust rust rust systems"))
            .await
            .unwrap();
        index
            .upsert(&Document::new("d2", "b.md", "b", "rust once here"))
            .await
            .unwrap();
        let engine = RetrievalEngine::new(index, &RetrievalConfig::default());

        let results = engine
            .search("rust", SearchMode::Keyword, 10, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, "d1");
        assert!((results[0].score - 1.0).abs() < 1e-9);
        assert!((results[1].score - 0.0).abs() < 1e-9);
        // Scores are non-increasing and in [0, 1].
        for w in results.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }
}
