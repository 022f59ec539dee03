use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{ChatBackend, ChatRequest, ChatResponse, LlmError};

#[derive(Debug)]
pub struct FanOutResult {
    /// Position of the request in the submitted list.
    pub index: usize,
    pub model: String,
    pub result: Result<ChatResponse, LlmError>,
}

/// Runs every request with at most `limit` in flight.
///
/// Results come back ordered by request index regardless of completion
/// order. A failed or panicked request only affects its own slot.
pub async fn fan_out(
    backend: Arc<dyn ChatBackend>,
    requests: Vec<ChatRequest>,
    limit: usize,
) -> Vec<FanOutResult> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let total = requests.len();
    let mut models = Vec::with_capacity(total);
    let mut tasks = JoinSet::new();

    for (index, request) in requests.into_iter().enumerate() {
        models.push(request.model.clone());
        let backend = Arc::clone(&backend);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => backend.complete(&request).await,
                Err(err) => Err(LlmError::Task {
                    model: request.model.clone(),
                    detail: err.to_string(),
                }),
            };
            (index, result)
        });
    }

    let mut slots: Vec<Option<Result<ChatResponse, LlmError>>> =
        std::iter::repeat_with(|| None).take(total).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                match &result {
                    Ok(response) => debug!(index, model = %response.model, "request finished"),
                    Err(err) => warn!(index, error = %err, "request failed"),
                }
                slots[index] = Some(result);
            }
            Err(err) => warn!(error = %err, "request task aborted"),
        }
    }

    slots
        .into_iter()
        .zip(models)
        .enumerate()
        .map(|(index, (slot, model))| {
            let result = slot.unwrap_or_else(|| {
                Err(LlmError::Task {
                    model: model.clone(),
                    detail: "task panicked or was cancelled".to_string(),
                })
            });
            FanOutResult {
                index,
                model,
                result,
            }
        })
        .collect()
}
