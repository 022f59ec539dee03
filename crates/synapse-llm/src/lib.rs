//! Bounded fan-out of chat-completion requests and merging of the answers into encyclopedia entries.

mod client;
mod encyclopedia;
mod fanout;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use client::{LlmConfig, OpenAiCompatClient};
pub use encyclopedia::{
    load_topics, Article, EncyclopediaGenerator, GenerationSettings, GenerationSummary,
    TopicOutcome,
};
pub use fanout::{fan_out, FanOutResult};

pub const CRATE_NAME: &str = "synapse-llm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("request to {model} failed: {source}")]
    Request {
        model: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{model} returned HTTP {status}: {body}")]
    Status {
        model: String,
        status: u16,
        body: String,
    },
    #[error("could not decode response from {model}: {detail}")]
    Decode { model: String, detail: String },
    #[error("{model} returned no content")]
    EmptyResponse { model: String },
    #[error("request task for {model} aborted: {detail}")]
    Task { model: String, detail: String },
}

/// One chat-completion endpoint. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Blank-line separated blocks, each collapsed to single-spaced text.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        } else {
            current.extend(line.split_whitespace());
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

/// Paragraphs of every response, deduplicated by content hash.
///
/// Responses are taken in the order given; within each, paragraphs are split
/// on blank lines and whitespace-normalized. The first occurrence of a
/// paragraph wins.
pub fn merge_paragraphs<'a>(responses: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for response in responses {
        for paragraph in paragraphs(response) {
            let digest = hex::encode(Sha256::digest(paragraph.as_bytes()));
            if seen.insert(digest) {
                merged.push(paragraph);
            }
        }
    }
    merged.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_occurrence_in_model_order() {
        let a = "Dentists treat teeth.\n\nThey   work in clinics.\n";
        let b = "They work\nin clinics.\n\n\n\nMost need a licence.";
        let c = "Dentists treat teeth.";
        assert_eq!(
            merge_paragraphs([a, b, c]),
            "Dentists treat teeth.\n\nThey work in clinics.\n\nMost need a licence."
        );
    }

    #[test]
    fn merge_of_blank_responses_is_empty() {
        assert_eq!(merge_paragraphs(["", "  \n\n \n"]), "");
    }

    #[test]
    fn request_serializes_without_unset_sampling_fields() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: Some(64),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 64
            })
        );
    }
}
