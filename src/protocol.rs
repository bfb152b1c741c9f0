//! Streaming chat protocol: SSE framing, chunk payloads, and the
//! client-side message assembler.
//!
//! Each frame is serialized as one `data: <JSON>\n\n` line; the stream
//! ends with the literal `data: [DONE]` sentinel. The JSON payload uses
//! a completion-chunk shape (`choices[0].delta.content`) extended with
//! side-channel fields for the thinking process, supplements, and final
//! metadata. A single wire chunk may carry several logical frames;
//! [`decode_line`] yields them in a canonical order so an assembler fed
//! from the wire reconstructs the same message the server built.

use serde::{Deserialize, Serialize};

use crate::models::{
    ActionType, ChatMessage, RelatedDocument, Role, Supplement, ThinkingProcess,
};

/// One logical streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A fragment of the assistant's main answer.
    ContentDelta { content: String },
    /// Full replacement of the thinking-process state.
    ThinkingUpdate(ThinkingProcess),
    /// A new supplement begins; closes any prior streaming supplement.
    SupplementStart { id: String, kind: ActionType },
    /// A fragment of the identified supplement's content.
    SupplementDelta { id: String, content: String },
    /// Final metadata, sent once before the finish frame.
    Metadata {
        related_documents: Vec<RelatedDocument>,
    },
    /// Terminal frame; `reason` is `stop`, `degraded`, or `error`.
    Finish { reason: String },
}

// ============ Wire shapes ============

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamChunk {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking_process: Option<ThinkingProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supplement_start: Option<SupplementStartPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supplement: Option<SupplementDeltaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<MetadataPayload>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SupplementStartPayload {
    id: String,
    #[serde(rename = "type")]
    kind: ActionType,
}

#[derive(Debug, Serialize, Deserialize)]
struct SupplementDeltaPayload {
    id: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataPayload {
    #[serde(default)]
    related_documents: Vec<RelatedDocument>,
}

// ============ Encoding ============

/// Serialize one frame as an SSE data line.
pub fn encode_frame(frame: &Frame) -> String {
    let chunk = match frame {
        Frame::ContentDelta { content } => StreamChunk {
            choices: vec![Choice {
                delta: Delta {
                    role: Some(Role::Assistant),
                    content: Some(content.clone()),
                },
                finish_reason: None,
            }],
            ..Default::default()
        },
        Frame::ThinkingUpdate(tp) => StreamChunk {
            thinking_process: Some(tp.clone()),
            ..Default::default()
        },
        Frame::SupplementStart { id, kind } => StreamChunk {
            supplement_start: Some(SupplementStartPayload {
                id: id.clone(),
                kind: *kind,
            }),
            ..Default::default()
        },
        Frame::SupplementDelta { id, content } => StreamChunk {
            supplement: Some(SupplementDeltaPayload {
                id: id.clone(),
                content: content.clone(),
            }),
            ..Default::default()
        },
        Frame::Metadata { related_documents } => StreamChunk {
            metadata: Some(MetadataPayload {
                related_documents: related_documents.clone(),
            }),
            ..Default::default()
        },
        Frame::Finish { reason } => StreamChunk {
            choices: vec![Choice {
                delta: Delta::default(),
                finish_reason: Some(reason.clone()),
            }],
            ..Default::default()
        },
    };

    // StreamChunk serialization cannot fail: no maps with non-string
    // keys, no custom serializers.
    let json = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

/// The terminal sentinel line.
pub fn encode_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Result of decoding one SSE data line.
#[derive(Debug, PartialEq)]
pub enum DecodeEvent {
    /// The `[DONE]` sentinel.
    Done,
    /// Logical frames carried by the chunk, in canonical order.
    Frames(Vec<Frame>),
}

/// Decode one SSE line. Returns `None` for non-data lines (blank
/// keep-alives) and for malformed payloads, which are logged and
/// skipped so one bad chunk does not kill the stream.
pub fn decode_line(line: &str) -> Option<DecodeEvent> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(DecodeEvent::Done);
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed stream chunk");
            return None;
        }
    };

    let mut frames = Vec::new();

    for choice in &chunk.choices {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                frames.push(Frame::ContentDelta {
                    content: content.clone(),
                });
            }
        }
    }
    if let Some(tp) = chunk.thinking_process {
        frames.push(Frame::ThinkingUpdate(tp));
    }
    if let Some(start) = chunk.supplement_start {
        frames.push(Frame::SupplementStart {
            id: start.id,
            kind: start.kind,
        });
    }
    if let Some(delta) = chunk.supplement {
        frames.push(Frame::SupplementDelta {
            id: delta.id,
            content: delta.content,
        });
    }
    if let Some(metadata) = chunk.metadata {
        frames.push(Frame::Metadata {
            related_documents: metadata.related_documents,
        });
    }
    for choice in chunk.choices {
        if let Some(reason) = choice.finish_reason {
            frames.push(Frame::Finish { reason });
        }
    }

    Some(DecodeEvent::Frames(frames))
}

// ============ Assembly ============

/// Incrementally folds frames into the final [`ChatMessage`].
///
/// Assembly is associative over frame boundaries: however the deltas
/// were split, applying them in order yields the same message.
pub struct MessageAssembler {
    message: ChatMessage,
    related: Vec<RelatedDocument>,
    finish_reason: Option<String>,
}

impl MessageAssembler {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message: ChatMessage::assistant(message_id),
            related: Vec::new(),
            finish_reason: None,
        }
    }

    pub fn apply(&mut self, frame: &Frame) {
        match frame {
            Frame::ContentDelta { content } => {
                self.message.content.push_str(content);
            }
            Frame::ThinkingUpdate(tp) => {
                self.message.thinking_process = Some(tp.clone());
            }
            Frame::SupplementStart { id, kind } => {
                for s in &mut self.message.supplements {
                    s.is_streaming = false;
                }
                self.message.supplements.push(Supplement {
                    id: id.clone(),
                    kind: *kind,
                    content: String::new(),
                    is_streaming: true,
                });
            }
            Frame::SupplementDelta { id, content } => {
                match self.message.supplements.iter_mut().find(|s| &s.id == id) {
                    Some(s) => s.content.push_str(content),
                    None => {
                        tracing::warn!(supplement_id = %id, "delta for unknown supplement");
                    }
                }
            }
            Frame::Metadata { related_documents } => {
                self.related = related_documents.clone();
            }
            Frame::Finish { reason } => {
                for s in &mut self.message.supplements {
                    s.is_streaming = false;
                }
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn related_documents(&self) -> &[RelatedDocument] {
        &self.related
    }

    pub fn into_message(self) -> ChatMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Completeness, Evaluation};

    fn thinking(complete: bool) -> ThinkingProcess {
        ThinkingProcess {
            evaluation: Evaluation {
                completeness: if complete {
                    Completeness::Complete
                } else {
                    Completeness::Partial
                },
                confidence: 0.8,
                reasoning: "checked".to_string(),
            },
            follow_up_needed: !complete,
            suggested_actions: Vec::new(),
            current_action: None,
        }
    }

    fn roundtrip(frame: &Frame) -> Vec<Frame> {
        match decode_line(&encode_frame(frame)) {
            Some(DecodeEvent::Frames(frames)) => frames,
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_wire_format() {
        let line = encode_frame(&Frame::ContentDelta {
            content: "hi".to_string(),
        });
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));

        let json: serde_json::Value =
            serde_json::from_str(line.trim().strip_prefix("data:").unwrap().trim()).unwrap();
        assert_eq!(json["choices"][0]["delta"]["content"], "hi");
        assert_eq!(json["choices"][0]["delta"]["role"], "assistant");

        assert_eq!(encode_done(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_decode_sentinel_and_garbage() {
        assert_eq!(decode_line("data: [DONE]"), Some(DecodeEvent::Done));
        assert_eq!(decode_line("data: [DONE]\n\n"), Some(DecodeEvent::Done));
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line(": keep-alive"), None);
        // Malformed JSON is skipped, not fatal.
        assert_eq!(decode_line("data: {not json"), None);
    }

    #[test]
    fn test_frames_roundtrip() {
        let frames = vec![
            Frame::ContentDelta {
                content: "partial ".to_string(),
            },
            Frame::ThinkingUpdate(thinking(false)),
            Frame::SupplementStart {
                id: "s1".to_string(),
                kind: ActionType::KnowledgeSearch,
            },
            Frame::SupplementDelta {
                id: "s1".to_string(),
                content: "extra".to_string(),
            },
            Frame::Metadata {
                related_documents: vec![RelatedDocument {
                    document_id: "d1".to_string(),
                    title: "t".to_string(),
                    path: "t.md".to_string(),
                    similarity: 0.9,
                }],
            },
            Frame::Finish {
                reason: "stop".to_string(),
            },
        ];

        for frame in &frames {
            let decoded = roundtrip(frame);
            assert_eq!(decoded.len(), 1);
            assert_eq!(&decoded[0], frame);
        }
    }

    #[test]
    fn test_assembly_invariant_under_chunking() {
        let deltas = ["The answer ", "is ", "42."];

        // Split one: one frame per fragment.
        let mut a = MessageAssembler::new("m1");
        for d in deltas {
            a.apply(&Frame::ContentDelta {
                content: d.to_string(),
            });
        }

        // Split two: a single concatenated frame.
        let mut b = MessageAssembler::new("m1");
        b.apply(&Frame::ContentDelta {
            content: deltas.concat(),
        });

        assert_eq!(a.into_message().content, b.into_message().content);
    }

    #[test]
    fn test_assembler_supplement_lifecycle() {
        let mut asm = MessageAssembler::new("m1");
        asm.apply(&Frame::ContentDelta {
            content: "draft".to_string(),
        });
        asm.apply(&Frame::SupplementStart {
            id: "s1".to_string(),
            kind: ActionType::KnowledgeSearch,
        });
        asm.apply(&Frame::SupplementDelta {
            id: "s1".to_string(),
            content: "found ".to_string(),
        });
        asm.apply(&Frame::SupplementDelta {
            id: "s1".to_string(),
            content: "more".to_string(),
        });

        // Starting a second supplement closes the first.
        asm.apply(&Frame::SupplementStart {
            id: "s2".to_string(),
            kind: ActionType::ContentExpansion,
        });
        asm.apply(&Frame::SupplementDelta {
            id: "s2".to_string(),
            content: "detail".to_string(),
        });

        // A delta for an unknown id is ignored.
        asm.apply(&Frame::SupplementDelta {
            id: "nope".to_string(),
            content: "lost".to_string(),
        });

        asm.apply(&Frame::Finish {
            reason: "stop".to_string(),
        });
        assert_eq!(asm.finish_reason(), Some("stop"));

        let msg = asm.into_message();
        assert_eq!(msg.content, "draft");
        assert_eq!(msg.supplements.len(), 2);
        assert_eq!(msg.supplements[0].content, "found more");
        assert!(!msg.supplements[0].is_streaming);
        assert_eq!(msg.supplements[1].content, "detail");
        assert!(!msg.supplements[1].is_streaming);
    }

    #[test]
    fn test_thinking_update_replaces_state() {
        let mut asm = MessageAssembler::new("m1");
        asm.apply(&Frame::ThinkingUpdate(thinking(false)));
        asm.apply(&Frame::ThinkingUpdate(thinking(true)));

        let msg = asm.into_message();
        let tp = msg.thinking_process.unwrap();
        assert_eq!(tp.evaluation.completeness, Completeness::Complete);
        assert!(!tp.follow_up_needed);
    }
}
