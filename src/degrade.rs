//! Degradation controller: the policy layer between API surfaces and
//! the AI backend.
//!
//! Every AI-dependent feature flows through here. When the backend is
//! unavailable (or AI is switched off), requests are served by their
//! non-AI fallback instead of failing: semantic and mixed search drop to
//! keyword search, tag suggestion drops to keyword heuristics, link
//! discovery returns empty. Degraded responses carry `degraded: true`
//! and a reason string so clients can surface the reduced fidelity.
//!
//! Degradable errors (transport, timeout, backend) trigger the same
//! fallback mid-request; anything else propagates to the caller.

use std::sync::Arc;

use anyhow::Result;

use crate::availability::AvailabilityMonitor;
use crate::backend::BackendClient;
use crate::error::is_degradable;
use crate::index::IndexStore;
use crate::models::{LinkResponse, RelatedDocument, SearchResponse, TagResponse};
use crate::search::{RetrievalEngine, SearchMode};

/// Fixed vocabulary for heuristic tag fallback, matched as
/// case-insensitive substrings over title + content. Order matters:
/// earlier matches rank first.
const TAG_VOCABULARY: &[(&str, &str)] = &[
    ("meeting", "meeting"),
    ("project", "project"),
    ("plan", "planning"),
    ("todo", "todo"),
    ("task", "todo"),
    ("design", "design"),
    ("architecture", "design"),
    ("research", "research"),
    ("idea", "ideas"),
    ("journal", "journal"),
    ("daily", "journal"),
    ("recipe", "recipes"),
    ("book", "reading"),
    ("read", "reading"),
];

pub struct DegradationController {
    monitor: Arc<AvailabilityMonitor>,
    engine: RetrievalEngine,
    backend: Arc<BackendClient>,
    index: Arc<dyn IndexStore>,
    similarity_threshold: Option<f32>,
    default_max_tags: usize,
}

impl DegradationController {
    pub fn new(
        monitor: Arc<AvailabilityMonitor>,
        engine: RetrievalEngine,
        backend: Arc<BackendClient>,
        index: Arc<dyn IndexStore>,
        similarity_threshold: Option<f32>,
        default_max_tags: usize,
    ) -> Self {
        Self {
            monitor,
            engine,
            backend,
            index,
            similarity_threshold,
            default_max_tags,
        }
    }

    /// `None` when AI is usable right now, otherwise the reason string.
    pub async fn ai_ready(&self) -> Option<String> {
        if self.monitor.is_available(false).await {
            None
        } else {
            Some(self.monitor.degradation_reason().await)
        }
    }

    /// Search with automatic degradation. Keyword mode never degrades;
    /// semantic and mixed modes fall back to keyword results (flagged
    /// degraded) when the backend is unavailable or fails mid-request.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<SearchResponse> {
        // Nothing to retrieve: skip the availability check and the
        // query-embedding round trip entirely.
        if query.trim().is_empty() || limit == 0 {
            return Ok(SearchResponse::ok(Vec::new()));
        }

        if !mode.needs_ai() {
            let results = self
                .engine
                .search(query, mode, limit, self.similarity_threshold, None)
                .await?;
            return Ok(SearchResponse::ok(results));
        }

        if !self.monitor.is_available(false).await {
            let results = self.keyword_fallback(query, limit).await?;
            return Ok(SearchResponse::degraded(
                results,
                self.monitor.degradation_reason().await,
            ));
        }

        match self.ai_search(query, mode, limit).await {
            Ok(results) => Ok(SearchResponse::ok(results)),
            Err(e) if is_degradable(&e) => {
                tracing::warn!(error = %e, %mode, "AI search failed; falling back to keyword");
                let results = self.keyword_fallback(query, limit).await?;
                Ok(SearchResponse::degraded(
                    results,
                    crate::availability::REASON_UNAVAILABLE,
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn ai_search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
    ) -> Result<Vec<crate::models::SearchResult>> {
        let query_vec = self.backend.embed_query(query).await?;
        self.engine
            .search(
                query,
                mode,
                limit,
                self.similarity_threshold,
                Some(&query_vec),
            )
            .await
    }

    async fn keyword_fallback(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<crate::models::SearchResult>> {
        self.engine
            .search(query, SearchMode::Keyword, limit, None, None)
            .await
    }

    /// Suggest tags for a note. Uses the backend when available, the
    /// keyword heuristic otherwise (or when the backend call fails).
    pub async fn suggest_tags(
        &self,
        title: &str,
        content: &str,
        max_tags: Option<usize>,
    ) -> TagResponse {
        let max_tags = max_tags.unwrap_or(self.default_max_tags);

        if !self.monitor.is_available(false).await {
            return TagResponse {
                tags: fallback_tags(title, content, max_tags),
                degraded: true,
                degradation_reason: Some(self.monitor.degradation_reason().await),
            };
        }

        match self.backend.suggest_tags(title, content, max_tags).await {
            Ok(mut tags) => {
                tags.truncate(max_tags);
                TagResponse {
                    tags,
                    degraded: false,
                    degradation_reason: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "tag suggestion failed; using keyword heuristic");
                TagResponse {
                    tags: fallback_tags(title, content, max_tags),
                    degraded: true,
                    degradation_reason: Some(crate::availability::REASON_UNAVAILABLE.to_string()),
                }
            }
        }
    }

    /// Discover documents related to the given one via embedding
    /// similarity. Returns an empty, degraded response when AI is
    /// unavailable.
    pub async fn discover_links(&self, document_id: &str, limit: usize) -> Result<LinkResponse> {
        if !self.monitor.is_available(false).await {
            return Ok(LinkResponse {
                links: Vec::new(),
                degraded: true,
                degradation_reason: Some(self.monitor.degradation_reason().await),
            });
        }

        let Some(doc) = self.index.get_document(document_id).await? else {
            return Err(crate::error::Error::InvalidArgument(format!(
                "Unknown document: {}",
                document_id
            ))
            .into());
        };

        match self.related_documents(&doc, limit).await {
            Ok(links) => Ok(LinkResponse {
                links,
                degraded: false,
                degradation_reason: None,
            }),
            Err(e) if is_degradable(&e) => {
                tracing::warn!(error = %e, document_id, "link discovery failed");
                Ok(LinkResponse {
                    links: Vec::new(),
                    degraded: true,
                    degradation_reason: Some(crate::availability::REASON_UNAVAILABLE.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn related_documents(
        &self,
        doc: &crate::models::Document,
        limit: usize,
    ) -> Result<Vec<RelatedDocument>> {
        // Embed the head of the document as its representative vector.
        let head: String = doc.content.chars().take(2000).collect();
        let vec = self.backend.embed_query(&head).await?;

        // Over-fetch so filtering out the document's own chunks still
        // leaves enough results.
        let hits = self
            .index
            .vector_search(&vec, limit * 2 + 8, self.similarity_threshold)
            .await?;

        let mut links: Vec<RelatedDocument> = Vec::new();
        for hit in hits {
            if hit.document_id == doc.id {
                continue;
            }
            if links.iter().any(|l| l.document_id == hit.document_id) {
                continue;
            }
            links.push(RelatedDocument {
                document_id: hit.document_id,
                title: hit.title,
                path: hit.path,
                similarity: hit.raw_score,
            });
            if links.len() >= limit {
                break;
            }
        }
        Ok(links)
    }
}

/// Pure keyword heuristic used when the backend cannot suggest tags.
///
/// Deterministic: file-extension tags first, then vocabulary matches in
/// declaration order, deduped, defaulting to `["notes"]`.
pub fn fallback_tags(title: &str, content: &str, max_tags: usize) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    let lower_title = title.to_lowercase();
    if lower_title.ends_with(".md") || lower_title.ends_with(".markdown") {
        tags.push("markdown".to_string());
    } else if lower_title.ends_with(".txt") {
        tags.push("plain-text".to_string());
    }

    let haystack = format!("{} {}", lower_title, content.to_lowercase());
    for (needle, tag) in TAG_VOCABULARY {
        if haystack.contains(needle) && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    if tags.is_empty() {
        tags.push("notes".to_string());
    }

    tags.truncate(max_tags);
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_tags_extension_and_vocabulary() {
        let tags = fallback_tags("meeting-notes.md", "project plan for Q3", 5);
        assert_eq!(tags[0], "markdown");
        assert!(tags.contains(&"meeting".to_string()));
        assert!(tags.contains(&"project".to_string()));
        assert!(tags.contains(&"planning".to_string()));
    }

    #[test]
    fn test_fallback_tags_default_and_cap() {
        assert_eq!(fallback_tags("untitled", "nothing matches here", 5), vec!["notes"]);

        let tags = fallback_tags(
            "meeting.md",
            "project plan todo design research idea journal",
            3,
        );
        assert_eq!(tags.len(), 3);
        assert_eq!(tags, vec!["markdown", "meeting", "project"]);
    }

    #[test]
    fn test_fallback_tags_deterministic() {
        let a = fallback_tags("daily journal.txt", "book ideas and a recipe", 5);
        let b = fallback_tags("daily journal.txt", "book ideas and a recipe", 5);
        assert_eq!(a, b);
        assert_eq!(a[0], "plain-text");
    }

    #[test]
    fn test_fallback_tags_dedupes_vocabulary() {
        // "plan" and "task" both present; "todo" appears once.
        let tags = fallback_tags("x", "todo list of tasks", 5);
        assert_eq!(tags.iter().filter(|t| *t == "todo").count(), 1);
    }
}
