//! HTTP client for the AI backend (embedding + generation service).
//!
//! All calls carry the configured timeout; a timeout is reported as
//! [`Error::Timeout`] and treated like any other transport failure by
//! the degradation controller.
//!
//! # Retry Strategy
//!
//! POST calls retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! The status probe never retries; the availability monitor's TTL cache
//! already rate-limits it.

use serde::Deserialize;
use std::time::Duration;

use crate::config::AiConfig;
use crate::error::{Error, Result};
use crate::models::{HistoryMessage, ThinkingProcess};

/// Health payload from `GET {base}/status`. Absent fields read as false.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProbeStatus {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub available: bool,
}

pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl BackendClient {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            max_retries: config.max_retries,
        })
    }

    /// Probe the backend health endpoint. Any transport error or
    /// non-success status propagates as an error; the monitor maps it to
    /// "unavailable".
    pub async fn probe_status(&self) -> Result<ProbeStatus> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Backend(format!("status probe returned {}", status)));
        }

        response
            .json::<ProbeStatus>()
            .await
            .map_err(|e| Error::Backend(format!("invalid status payload: {}", e)))
    }

    /// Embed a batch of texts. Returns one vector per input, in order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "input": texts });
        let json = self.post_json("/embed", &body).await?;
        parse_embed_response(&json)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| Error::Backend("empty embedding response".to_string()))
    }

    /// Generate an answer for the given history, with retrieved context
    /// injected through the system prompt.
    pub async fn generate(&self, system: &str, history: &[HistoryMessage]) -> Result<String> {
        let mut messages = vec![serde_json::json!({ "role": "system", "content": system })];
        for msg in history {
            messages.push(serde_json::json!({ "role": msg.role, "content": msg.content }));
        }

        let body = serde_json::json!({ "messages": messages });
        let json = self.post_json("/generate", &body).await?;
        json.get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Backend("generate response missing content".to_string()))
    }

    /// Ask the backend to assess a draft answer's completeness and
    /// propose follow-up actions.
    pub async fn evaluate(
        &self,
        question: &str,
        draft: &str,
        allow_tools: bool,
    ) -> Result<ThinkingProcess> {
        let body = serde_json::json!({
            "question": question,
            "draft": draft,
            "allow_tools": allow_tools,
        });
        let json = self.post_json("/evaluate", &body).await?;
        serde_json::from_value(json)
            .map_err(|e| Error::Backend(format!("invalid evaluation payload: {}", e)))
    }

    /// Suggest tags for a note.
    pub async fn suggest_tags(
        &self,
        title: &str,
        content: &str,
        max_tags: usize,
    ) -> Result<Vec<String>> {
        let body = serde_json::json!({
            "title": title,
            "content": content,
            "max_tags": max_tags,
        });
        let json = self.post_json("/tags", &body).await?;
        let tags = json
            .get("tags")
            .and_then(|t| t.as_array())
            .ok_or_else(|| Error::Backend("tags response missing tags array".to_string()))?;
        Ok(tags
            .iter()
            .filter_map(|t| t.as_str())
            .map(|t| t.to_string())
            .collect())
    }

    /// Execute a tool invocation requested by the self-evaluation loop.
    pub async fn invoke_tool(&self, description: &str) -> Result<String> {
        let body = serde_json::json!({ "description": description });
        let json = self.post_json("/tools", &body).await?;
        json.get("output")
            .and_then(|o| o.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Backend("tool response missing output".to_string()))
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            Error::Backend(format!("invalid JSON from backend: {}", e))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = Error::Backend(format!("backend returned {}: {}", status, body_text));

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(Error::Timeout))
    }
}

fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::Backend("embed response missing embeddings array".to_string()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| Error::Backend("embedding is not an array".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_status_missing_fields_read_false() {
        let st: ProbeStatus = serde_json::from_str("{}").unwrap();
        assert!(!st.enabled);
        assert!(!st.available);

        let st: ProbeStatus = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(st.enabled);
        assert!(!st.available);
    }

    #[test]
    fn test_parse_embed_response() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let vecs = parse_embed_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].len(), 2);

        let json = serde_json::json!({ "data": [] });
        assert!(parse_embed_response(&json).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let config = AiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            max_retries: 0,
            timeout_secs: 1,
            ..AiConfig::default()
        };
        let client = BackendClient::new(&config).unwrap();

        let err = client.probe_status().await.unwrap_err();
        assert!(err.is_degradable(), "expected degradable, got {:?}", err);
    }
}
