use super::{CompletionBackend, CompletionRequest, LlmError, ModelDescriptor, ResponseFormat};
use crate::cancel::CancelToken;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub fallback_models: Vec<ModelDescriptor>,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_format: ResponseFormat,
}

impl CompletionOptions {
    pub fn json(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            response_format: ResponseFormat::Json,
        }
    }

    pub fn text(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            response_format: ResponseFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionAttempt {
    pub model: ModelDescriptor,
    pub attempt_index: usize,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: ModelDescriptor,
    pub attempts: Vec<CompletionAttempt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAttempt {
    pub index: usize,
    pub model: ModelDescriptor,
    /// Delay to wait after this attempt fails; `None` on the last permitted attempt.
    pub backoff_after: Option<Duration>,
}

/// Ordered, bounded sequence of models to try for one call.
#[derive(Debug, Clone)]
pub struct FallbackPlan {
    candidates: Vec<ModelDescriptor>,
    limit: usize,
    next: usize,
    retry_delay: Duration,
}

impl FallbackPlan {
    pub fn new(
        preferred: &ModelDescriptor,
        fallbacks: &[ModelDescriptor],
        max_retries: usize,
        retry_delay: Duration,
    ) -> Self {
        let mut candidates = vec![preferred.clone()];
        for model in fallbacks {
            if !candidates.contains(model) {
                candidates.push(model.clone());
            }
        }
        let limit = candidates.len().min(max_retries);
        Self {
            candidates,
            limit,
            next: 0,
            retry_delay,
        }
    }

    #[cfg(test)]
    pub fn candidates(&self) -> &[ModelDescriptor] {
        &self.candidates
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// `retry_delay * 2^attempt_index`, saturating.
    pub fn backoff(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1_u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

impl Iterator for FallbackPlan {
    type Item = PlannedAttempt;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.limit {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let backoff_after = (index + 1 < self.limit).then(|| self.backoff(index));
        Some(PlannedAttempt {
            index,
            model: self.candidates[index].clone(),
            backoff_after,
        })
    }
}

/// Sends one prompt pair to the first model in the fallback chain that answers.
#[derive(Clone)]
pub struct FallbackClient {
    backend: Arc<dyn CompletionBackend>,
    settings: Arc<FallbackSettings>,
}

impl FallbackClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, settings: FallbackSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    pub fn plan(&self, preferred: &ModelDescriptor) -> FallbackPlan {
        FallbackPlan::new(
            preferred,
            &self.settings.fallback_models,
            self.settings.max_retries,
            self.settings.retry_delay,
        )
    }

    pub async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        preferred: &ModelDescriptor,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        let plan = self.plan(preferred);
        if plan.limit() == 0 {
            return Err(LlmError::NoCandidates);
        }

        let mut attempts = Vec::with_capacity(plan.limit());
        let mut last_error: Option<LlmError> = None;

        for step in plan {
            let request = CompletionRequest {
                system_prompt: system_prompt.to_string(),
                user_prompt: user_prompt.to_string(),
                model: step.model.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                response_format: options.response_format,
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                result = self.backend.complete(&request) => result,
            };

            match result {
                Ok(text) => {
                    crate::metrics::llm_attempt(step.model.as_str(), true);
                    debug!(
                        target = "listing.llm",
                        model = %step.model,
                        attempt = step.index,
                        "completion_succeeded"
                    );
                    attempts.push(CompletionAttempt {
                        model: step.model.clone(),
                        attempt_index: step.index,
                        outcome: AttemptOutcome::Success,
                        error: None,
                    });
                    return Ok(Completion {
                        text,
                        model: step.model,
                        attempts,
                    });
                }
                Err(err) => {
                    crate::metrics::llm_attempt(step.model.as_str(), false);
                    warn!(
                        target = "listing.llm",
                        model = %step.model,
                        attempt = step.index,
                        error = %err,
                        "completion_attempt_failed"
                    );
                    attempts.push(CompletionAttempt {
                        model: step.model.clone(),
                        attempt_index: step.index,
                        outcome: AttemptOutcome::Failure,
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                    if let Some(delay) = step.backoff_after {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(LlmError::Exhausted {
            attempts: attempts.len(),
            last: Box::new(last_error.unwrap_or(LlmError::NoCandidates)),
        })
    }
}
