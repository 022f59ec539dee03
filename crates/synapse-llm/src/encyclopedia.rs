//! Topic → multi-model article generation, written as one JSON file per topic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use synapse_core::slugify;
use synapse_storage::write_atomic;
use tracing::{info, warn};

use crate::fanout::fan_out;
use crate::{merge_paragraphs, ChatBackend, ChatMessage, ChatRequest};

const SYSTEM_PROMPT: &str = "You write concise, factual encyclopedia entries for small-business \
industries. Use plain paragraphs separated by blank lines. No headings, lists, or markdown.";

/// Topics file: one topic per line; blank lines and `#` comments are ignored.
pub async fn load_topics(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading topics file {}", path.display()))?;
    let mut topics: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !topics.iter().any(|t| slugify(t) == slugify(line)) {
            topics.push(line.to_string());
        }
    }
    Ok(topics)
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub models: Vec<String>,
    pub concurrency: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            concurrency: 4,
            temperature: Some(0.3),
            max_tokens: Some(1200),
        }
    }
}

/// The JSON document written for each topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub name: String,
    pub slug: String,
    pub content: String,
    /// Models whose answers contributed, in configured order.
    pub models: Vec<String>,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicOutcome {
    pub topic: String,
    pub path: Option<PathBuf>,
    pub failed_models: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationSummary {
    pub topics: Vec<TopicOutcome>,
    pub total_tokens: u64,
}

impl GenerationSummary {
    pub fn written(&self) -> usize {
        self.topics.iter().filter(|t| t.path.is_some()).count()
    }

    pub fn failed_requests(&self) -> usize {
        self.topics.iter().map(|t| t.failed_models.len()).sum()
    }
}

pub struct EncyclopediaGenerator {
    backend: Arc<dyn ChatBackend>,
    settings: GenerationSettings,
    out_dir: PathBuf,
}

impl EncyclopediaGenerator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        settings: GenerationSettings,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            settings,
            out_dir: out_dir.into(),
        }
    }

    fn request_for(&self, topic: &str, model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Write an encyclopedia entry about the \"{topic}\" industry: what the \
                     businesses do, who their customers are, how they make money, and \
                     common licensing or regulation."
                )),
            ],
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Asks every model about every topic, bounded by `concurrency` requests in flight.
    ///
    /// A topic is written when at least one model answered; topics with no
    /// answers are reported without a path.
    pub async fn generate(&self, topics: &[String]) -> anyhow::Result<GenerationSummary> {
        anyhow::ensure!(
            !self.settings.models.is_empty(),
            "at least one model is required"
        );
        let models = &self.settings.models;
        let requests = topics
            .iter()
            .flat_map(|topic| models.iter().map(move |model| self.request_for(topic, model)))
            .collect::<Vec<_>>();
        info!(
            topics = topics.len(),
            models = models.len(),
            requests = requests.len(),
            concurrency = self.settings.concurrency,
            "starting generation"
        );

        let mut results = fan_out(Arc::clone(&self.backend), requests, self.settings.concurrency)
            .await
            .into_iter();
        let mut summary = GenerationSummary::default();

        for topic in topics {
            let mut answers = Vec::new();
            let mut contributing = Vec::new();
            let mut failed_models = Vec::new();
            let mut tokens = 0u64;
            for model in models {
                let Some(result) = results.next() else {
                    anyhow::bail!("fan-out returned fewer results than requests");
                };
                match result.result {
                    Ok(response) => {
                        tokens += response.usage.total();
                        answers.push(response.content);
                        contributing.push(model.clone());
                    }
                    Err(err) => {
                        warn!(topic = %topic, model = %model, error = %err, "model failed for topic");
                        failed_models.push(model.clone());
                    }
                }
            }
            summary.total_tokens += tokens;

            let slug = slugify(topic);
            let path = if answers.is_empty() || slug.is_empty() {
                warn!(topic = %topic, "no article written");
                None
            } else {
                let article = Article {
                    name: topic.clone(),
                    slug: slug.clone(),
                    content: merge_paragraphs(answers.iter().map(String::as_str)),
                    models: contributing,
                    total_tokens: tokens,
                };
                let path = self.out_dir.join(format!("{slug}.json"));
                let bytes = serde_json::to_vec_pretty(&article).context("serializing article")?;
                write_atomic(&path, &bytes)
                    .await
                    .with_context(|| format!("writing article {}", path.display()))?;
                Some(path)
            };
            summary.topics.push(TopicOutcome {
                topic: topic.clone(),
                path,
                failed_models,
            });
        }

        info!(
            written = summary.written(),
            failed_requests = summary.failed_requests(),
            total_tokens = summary.total_tokens,
            "generation finished"
        );
        Ok(summary)
    }
}
