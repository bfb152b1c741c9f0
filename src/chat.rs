//! Chat orchestrator: retrieval-augmented answering with a bounded
//! self-evaluation loop.
//!
//! The pipeline per request: retrieve context (mixed search), draft an
//! answer, evaluate the draft, then execute up to
//! `max_supplement_rounds` follow-up actions (knowledge search, content
//! expansion, tool use) ordered by priority, re-evaluating after each.
//! Every stage is emitted as [`Frame`]s on an `mpsc` channel; the HTTP
//! layer encodes them as SSE.
//!
//! Cancellation is the receiver being dropped. Every send checks for
//! that and returns cleanly, so an abandoned stream stops mid-pipeline
//! without surfacing an error.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::config::ChatConfig;
use crate::degrade::DegradationController;
use crate::error::Error;
use crate::index::tokenize;
use crate::models::{
    ActionStatus, ActionType, ChatMessage, Completeness, CurrentAction, Evaluation,
    HistoryMessage, RelatedDocument, Role, SearchResult, SuggestedAction, ThinkingProcess,
};
use crate::protocol::{Frame, MessageAssembler};
use crate::search::SearchMode;

const ANSWER_SYSTEM_PROMPT: &str = "You are a personal knowledge-base assistant. Answer the \
user's question using the provided notes as context. If the notes do not cover the question, \
say so instead of inventing details.";

const EXPANSION_SYSTEM_PROMPT: &str = "Expand on the following aspect of the previous answer. \
Be concise and concrete.";

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<HistoryMessage>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub search_limit: Option<usize>,
    /// Per-request context budget in characters; the configured default
    /// applies when unset.
    #[serde(default)]
    pub max_context_length: Option<usize>,
    #[serde(default = "default_true")]
    pub enable_tools: bool,
    /// When false, skip evaluation and supplements entirely.
    #[serde(default = "default_true")]
    pub use_intent_analysis: bool,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    /// The question being answered: the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

struct QueuedAction {
    action: SuggestedAction,
    order: usize,
    done: bool,
}

pub struct ChatOrchestrator {
    controller: Arc<DegradationController>,
    backend: Arc<BackendClient>,
    config: ChatConfig,
}

impl ChatOrchestrator {
    pub fn new(
        controller: Arc<DegradationController>,
        backend: Arc<BackendClient>,
        config: ChatConfig,
    ) -> Self {
        Self {
            controller,
            backend,
            config,
        }
    }

    /// Drive one chat request, emitting frames on `tx`. A dropped
    /// receiver cancels the pipeline; that is not an error.
    pub async fn run(&self, req: &ChatRequest, tx: mpsc::Sender<Frame>) -> Result<()> {
        let question = req
            .last_user_message()
            .ok_or_else(|| Error::InvalidArgument("no user message in request".to_string()))?
            .to_string();

        if let Some(reason) = self.controller.ai_ready().await {
            let note = format!("I can't generate an answer right now: {}.", reason);
            if tx.send(Frame::ContentDelta { content: note }).await.is_err() {
                return Ok(());
            }
            let _ = tx
                .send(Frame::Finish {
                    reason: "degraded".to_string(),
                })
                .await;
            return Ok(());
        }

        // ---- Retrieval ----
        let limit = req.search_limit.unwrap_or(self.config.context_k);
        let retrieval = self
            .controller
            .search(&question, SearchMode::Mixed, limit)
            .await?;
        let max_context = req
            .max_context_length
            .unwrap_or(self.config.max_context_length);
        let context = build_context(&retrieval.results, max_context);

        // ---- Drafting ----
        let system = format!("{}\n\nNotes:\n{}", ANSWER_SYSTEM_PROMPT, context);
        let draft = match self.backend.generate(&system, &req.messages).await {
            Ok(draft) => draft,
            Err(e) if e.is_degradable() => {
                tracing::warn!(error = %e, "draft generation failed");
                let note =
                    "I ran into a problem reaching the AI service while answering. Please try \
                     again in a moment."
                        .to_string();
                if tx.send(Frame::ContentDelta { content: note }).await.is_err() {
                    return Ok(());
                }
                let _ = tx
                    .send(Frame::Finish {
                        reason: "error".to_string(),
                    })
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for piece in char_chunks(&draft, self.config.delta_chunk_chars) {
            if tx.send(Frame::ContentDelta { content: piece }).await.is_err() {
                return Ok(());
            }
        }

        if !req.use_intent_analysis {
            return self.finish(&tx, &retrieval.results).await;
        }

        // ---- Evaluation and supplements ----
        let mut thinking = self.evaluate(&question, &draft, req.enable_tools).await;
        if tx.send(Frame::ThinkingUpdate(thinking.clone())).await.is_err() {
            return Ok(());
        }

        let mut queue: Vec<QueuedAction> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut transcript = draft.clone();
        let mut rounds = 0;

        while thinking.follow_up_needed && rounds < self.config.max_supplement_rounds {
            for action in &thinking.suggested_actions {
                if seen.insert(action.description.clone()) {
                    queue.push(QueuedAction {
                        action: action.clone(),
                        order: queue.len(),
                        done: false,
                    });
                }
            }

            // Highest priority first; insertion order breaks ties.
            let next = queue
                .iter_mut()
                .filter(|q| !q.done)
                .min_by_key(|q| (q.action.priority, q.order));
            let Some(next) = next else {
                break;
            };
            next.done = true;
            let action = next.action.clone();

            thinking.current_action = Some(CurrentAction {
                action_type: action.action_type,
                description: action.description.clone(),
                status: ActionStatus::Processing,
            });
            if tx.send(Frame::ThinkingUpdate(thinking.clone())).await.is_err() {
                return Ok(());
            }

            let content = self
                .execute_action(&action, &question, req.enable_tools, limit)
                .await;

            let supplement_id = Uuid::new_v4().to_string();
            if tx
                .send(Frame::SupplementStart {
                    id: supplement_id.clone(),
                    kind: action.action_type,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
            for piece in char_chunks(&content, self.config.delta_chunk_chars) {
                if tx
                    .send(Frame::SupplementDelta {
                        id: supplement_id.clone(),
                        content: piece,
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }

            transcript.push_str("\n\n");
            transcript.push_str(&content);
            rounds += 1;

            let mut next_thinking = self
                .evaluate(&question, &transcript, req.enable_tools)
                .await;
            next_thinking.current_action = Some(CurrentAction {
                action_type: action.action_type,
                description: action.description,
                status: ActionStatus::Completed,
            });
            thinking = next_thinking;
            if tx.send(Frame::ThinkingUpdate(thinking.clone())).await.is_err() {
                return Ok(());
            }
        }

        self.finish(&tx, &retrieval.results).await
    }

    /// Run a request to completion and return the assembled message,
    /// for non-streaming clients and the CLI.
    pub async fn run_aggregate(
        &self,
        req: &ChatRequest,
    ) -> Result<(ChatMessage, Vec<RelatedDocument>)> {
        let (tx, mut rx) = mpsc::channel(32);
        let mut assembler = MessageAssembler::new(Uuid::new_v4().to_string());

        let run = self.run(req, tx);
        let collect = async {
            while let Some(frame) = rx.recv().await {
                assembler.apply(&frame);
            }
        };
        let (run_result, ()) = tokio::join!(run, collect);
        run_result?;

        let related = assembler.related_documents().to_vec();
        Ok((assembler.into_message(), related))
    }

    async fn finish(&self, tx: &mpsc::Sender<Frame>, results: &[SearchResult]) -> Result<()> {
        let related: Vec<RelatedDocument> = results
            .iter()
            .map(|r| RelatedDocument {
                document_id: r.document_id.clone(),
                title: r.title.clone(),
                path: r.path.clone(),
                similarity: r.score,
            })
            .collect();

        if !related.is_empty()
            && tx
                .send(Frame::Metadata {
                    related_documents: related,
                })
                .await
                .is_err()
        {
            return Ok(());
        }

        let _ = tx
            .send(Frame::Finish {
                reason: "stop".to_string(),
            })
            .await;
        Ok(())
    }

    /// Evaluate the draft via the backend, with the keyword heuristic as
    /// fallback so evaluation never fails a request.
    async fn evaluate(&self, question: &str, draft: &str, allow_tools: bool) -> ThinkingProcess {
        match self.backend.evaluate(question, draft, allow_tools).await {
            Ok(tp) => tp,
            Err(e) => {
                tracing::warn!(error = %e, "evaluation failed; using term-coverage heuristic");
                heuristic_evaluate(question, draft)
            }
        }
    }

    async fn execute_action(
        &self,
        action: &SuggestedAction,
        question: &str,
        enable_tools: bool,
        limit: usize,
    ) -> String {
        let result: Result<String> = match action.action_type {
            ActionType::KnowledgeSearch => {
                let query = action.search_query.as_deref().unwrap_or(question);
                self.supplemental_search(query, limit).await
            }
            ActionType::ContentExpansion => {
                let history = [HistoryMessage {
                    role: Role::User,
                    content: action.description.clone(),
                }];
                self.backend
                    .generate(EXPANSION_SYSTEM_PROMPT, &history)
                    .await
                    .map_err(Into::into)
            }
            ActionType::ToolUsage => {
                if !enable_tools {
                    return "(tool use is disabled for this request)".to_string();
                }
                self.backend
                    .invoke_tool(&action.description)
                    .await
                    .map_err(Into::into)
            }
        };

        // A failed follow-up never fails the whole answer; the main
        // draft has already been streamed.
        match result {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, action = ?action.action_type, "follow-up action failed");
                "(the follow-up step could not be completed)".to_string()
            }
        }
    }

    async fn supplemental_search(&self, query: &str, limit: usize) -> Result<String> {
        let response = self
            .controller
            .search(query, SearchMode::Mixed, limit)
            .await?;
        if response.results.is_empty() {
            return Ok(format!("No additional notes found for \"{}\".", query));
        }

        let mut out = String::new();
        for r in &response.results {
            out.push_str(&format!("- {} ({}): {}\n", r.title, r.path, r.snippet));
        }
        Ok(out)
    }
}

/// Concatenate result snippets into the answer context, capped at
/// `max_chars` characters on a char boundary.
fn build_context(results: &[SearchResult], max_chars: usize) -> String {
    let mut context = String::new();
    for r in results {
        context.push_str(&format!("### {} ({})\n{}\n\n", r.title, r.path, r.snippet));
    }
    if context.chars().count() > max_chars {
        context = context.chars().take(max_chars).collect();
    }
    context
}

/// Split text into pieces of at most `n` characters, char-safe.
fn char_chunks(text: &str, n: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == n {
            pieces.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Term-coverage evaluation used when the backend cannot assess the
/// draft. Pure and deterministic: coverage of the question's terms in
/// the draft decides completeness, and any missing terms become one
/// knowledge-search suggestion.
pub fn heuristic_evaluate(question: &str, draft: &str) -> ThinkingProcess {
    let terms = tokenize(question);
    let draft_terms: HashSet<String> = tokenize(draft).into_iter().collect();

    let (covered, missing): (Vec<&String>, Vec<&String>) =
        terms.iter().partition(|t| draft_terms.contains(*t));

    let coverage = if terms.is_empty() {
        1.0
    } else {
        covered.len() as f64 / terms.len() as f64
    };

    let completeness = if coverage >= 0.8 {
        Completeness::Complete
    } else if coverage >= 0.4 {
        Completeness::Partial
    } else {
        Completeness::Insufficient
    };
    let follow_up_needed = completeness != Completeness::Complete;

    let suggested_actions = if follow_up_needed {
        let query = missing
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        vec![SuggestedAction {
            action_type: ActionType::KnowledgeSearch,
            priority: if completeness == Completeness::Insufficient {
                crate::models::ActionPriority::High
            } else {
                crate::models::ActionPriority::Medium
            },
            description: format!("Search notes for: {}", query),
            search_query: Some(query),
        }]
    } else {
        Vec::new()
    };

    ThinkingProcess {
        evaluation: Evaluation {
            completeness,
            confidence: coverage,
            reasoning: format!(
                "Draft covers {} of {} question terms.",
                covered.len(),
                terms.len()
            ),
        },
        follow_up_needed,
        suggested_actions,
        current_action: None,
    }
}
