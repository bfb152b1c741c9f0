//! Core data models shared across the retrieval and chat pipeline.
//!
//! These types represent the documents, chunks, search results, and
//! streamed chat state that flow between the index store, the retrieval
//! engine, the degradation controller, and the chat orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Snapshot of a note pushed in by the external document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Document {
    /// Build a document snapshot from raw note content, deriving the
    /// content hash and size.
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            path: path.into(),
            title: title.into(),
            content_hash: Self::hash_content(&content),
            size: content.len() as u64,
            content,
            created_at: now,
            updated_at: now,
            deleted: false,
            tags: Vec::new(),
        }
    }

    /// SHA-256 hex digest used for staleness detection at index time.
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A sub-span of a document's content used as the unit of indexing.
///
/// `text` is always `content[start..end]` of the source document at the
/// time of indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
}

/// Which retrieval channel produced a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Keyword,
    Semantic,
}

/// One ranked search result. Score is normalized to `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_id: String,
    pub title: String,
    pub path: String,
    pub score: f64,
    pub snippet: String,
    pub source: SearchSource,
    pub updated_at: DateTime<Utc>,
}

/// Search response, optionally flagged as degraded. The `degraded` flag
/// is omitted from the wire entirely for non-degraded responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

impl SearchResponse {
    pub fn ok(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            degraded: false,
            degradation_reason: None,
        }
    }

    pub fn degraded(results: Vec<SearchResult>, reason: impl Into<String>) -> Self {
        Self {
            results,
            degraded: true,
            degradation_reason: Some(reason.into()),
        }
    }
}

/// Tag suggestion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagResponse {
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

/// Related-link discovery response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkResponse {
    pub links: Vec<RelatedDocument>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

/// A document related to a query or another document, with its
/// similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedDocument {
    pub document_id: String,
    pub title: String,
    pub path: String,
    pub similarity: f64,
}

/// Cached availability of the AI backend, owned by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityState {
    /// Administrative switch from configuration.
    pub enabled: bool,
    /// Result of the most recent probe (fail-closed).
    pub available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub cache_duration_ms: u64,
}

// ============ Chat types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the chat history supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// A chat message, mutated incrementally while streaming. Content only
/// ever grows while a stream is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_process: Option<ThinkingProcess>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplements: Vec<Supplement>,
}

impl ChatMessage {
    pub fn assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            thinking_process: None,
            supplements: Vec::new(),
        }
    }
}

/// Self-evaluation verdict on a draft answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
    Insufficient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub completeness: Completeness,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
}

/// Kind of follow-up action (and of the supplement it produces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    KnowledgeSearch,
    ToolUsage,
    ContentExpansion,
}

/// Declaration order doubles as execution order: `High < Medium < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub priority: ActionPriority,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    pub status: ActionStatus,
}

/// Streamed record of the orchestrator's self-evaluation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingProcess {
    pub evaluation: Evaluation,
    pub follow_up_needed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<SuggestedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<CurrentAction>,
}

/// Additional content produced by a follow-up action. Terminal once
/// `is_streaming` flips false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supplement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub content: String,
    pub is_streaming: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        let a = Document::new("d1", "notes/a.md", "A", "hello world");
        let b = Document::new("d2", "notes/b.md", "B", "hello world");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, Document::hash_content("hello world!"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(ActionPriority::High < ActionPriority::Medium);
        assert!(ActionPriority::Medium < ActionPriority::Low);
    }

    #[test]
    fn test_degraded_flag_omitted_when_clear() {
        let json = serde_json::to_value(SearchResponse::ok(Vec::new())).unwrap();
        assert!(json.get("degraded").is_none());
        assert!(json.get("degradation_reason").is_none());

        let json =
            serde_json::to_value(SearchResponse::degraded(Vec::new(), "AI features are disabled"))
                .unwrap();
        assert_eq!(json["degraded"], true);
        assert_eq!(json["degradation_reason"], "AI features are disabled");
    }

    #[test]
    fn test_action_type_wire_names() {
        let json = serde_json::to_string(&ActionType::KnowledgeSearch).unwrap();
        assert_eq!(json, "\"knowledge_search\"");
        let json = serde_json::to_string(&ActionType::ContentExpansion).unwrap();
        assert_eq!(json, "\"content_expansion\"");
    }
}
