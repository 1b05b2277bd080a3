use crate::cancel::CancelToken;
use crate::llm::{CompletionOptions, FallbackClient, LlmError, ModelDescriptor};
use crate::mapping::strip_markdown_fence;
use crate::models::{
    BatchResponse, EnhanceRequest, EnhancementResult, Marketplace, OverridesResponse,
    ProductRecord, RecordOverride,
};
use crate::prompts::{self, PromptParams, RenderedPrompt, Task, TemplateError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DESCRIPTION_LIMIT: usize = 2000;
const BULLET_CHAR_LIMIT: usize = 250;
const KEYWORD_COUNT: usize = 15;

/// Short model aliases accepted from callers.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt4o", "openai/gpt-4o"),
    ("claude", "anthropic/claude-3.5-sonnet"),
    ("gemini", "google/gemini-pro-1.5"),
    ("mistral", "mistralai/mistral-large"),
    ("llama", "meta-llama/llama-3.1-70b-instruct"),
];

#[derive(Clone)]
pub struct PipelineConfig {
    pub default_model: ModelDescriptor,
    pub temperature: f32,
    pub max_tokens: u32,
    pub concurrency: usize,
}

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("model call failed: {0}")]
    Llm(LlmError),
    #[error("unparseable model response: {0}")]
    Parse(String),
    #[error("cancelled")]
    Cancelled,
    #[error("task `{0}` cannot be generated for a single record")]
    UnsupportedTask(Task),
}

impl From<LlmError> for EnhanceError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => EnhanceError::Cancelled,
            other => EnhanceError::Llm(other),
        }
    }
}

/// Ordered results of one batch call. `results.len()` always equals the
/// number of input records.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<EnhancementResult>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    Text { text: String },
    List { items: Vec<String> },
    Suggestion { value: String, confidence: f32 },
}

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub llm: FallbackClient,
}

impl Pipeline {
    pub fn new(llm: FallbackClient, config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            llm,
        }
    }

    pub fn resolve_model(&self, preference: &str) -> ModelDescriptor {
        resolve_model(preference, &self.config.default_model)
    }

    /// Runs a request end to end and wraps the outcome for the HTTP layer.
    pub async fn run(&self, request: EnhanceRequest, cancel: &CancelToken) -> BatchResponse {
        let started = Instant::now();
        let model = self.resolve_model(&request.model);
        let outcome = self
            .enhance_batch(request.records, &request.marketplace, &request.model, cancel)
            .await;
        let enhanced_count = outcome.results.iter().filter(|r| r.enhanced).count();
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::batch_elapsed(elapsed_ms);
        BatchResponse {
            batch_id: format!("BATCH-{}", Uuid::new_v4().simple()),
            marketplace: request.marketplace,
            model,
            failed_count: outcome.results.len() - enhanced_count,
            enhanced_count,
            results: outcome.results,
            cancelled: outcome.cancelled,
            elapsed_ms,
        }
    }

    pub async fn enhance_batch(
        &self,
        records: Vec<ProductRecord>,
        marketplace: &Marketplace,
        model_preference: &str,
        cancel: &CancelToken,
    ) -> BatchOutcome {
        let model = self.resolve_model(model_preference);
        let total = records.len();
        info!(
            target = "listing.pipeline",
            records = total,
            marketplace = %marketplace,
            model = %model,
            concurrency = self.config.concurrency,
            "batch_started"
        );

        let model = &model;
        let outcomes: Vec<(EnhancementResult, bool)> =
            stream::iter(records.into_iter().enumerate())
                .map(|(index, record)| async move {
                    self.enhance_one(index, record, marketplace, model, cancel)
                        .await
                })
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

        let cancelled = outcomes.iter().any(|(_, was_cancelled)| *was_cancelled);
        let results: Vec<EnhancementResult> =
            outcomes.into_iter().map(|(result, _)| result).collect();
        let enhanced = results.iter().filter(|r| r.enhanced).count();
        info!(
            target = "listing.pipeline",
            records = total,
            enhanced,
            failed = total - enhanced,
            cancelled,
            "batch_finished"
        );
        BatchOutcome { results, cancelled }
    }

    /// The flag is true when the record was stopped by cancellation.
    async fn enhance_one(
        &self,
        index: usize,
        record: ProductRecord,
        marketplace: &Marketplace,
        model: &ModelDescriptor,
        cancel: &CancelToken,
    ) -> (EnhancementResult, bool) {
        if cancel.is_cancelled() {
            crate::metrics::record_outcome(false);
            let result = EnhancementResult::failed(record, EnhanceError::Cancelled.to_string());
            return (result, true);
        }
        debug!(
            target = "listing.pipeline",
            index,
            product_id = %record.product_id,
            "record_enhancing"
        );
        match self.try_enhance(&record, marketplace, model, cancel).await {
            Ok((merged, used)) => {
                crate::metrics::record_outcome(true);
                (EnhancementResult::enhanced(merged, used), false)
            }
            Err(err) => {
                crate::metrics::record_outcome(false);
                warn!(
                    target = "listing.pipeline",
                    index,
                    product_id = %record.product_id,
                    error = %err,
                    "record_enhancement_failed"
                );
                let was_cancelled = matches!(err, EnhanceError::Cancelled);
                (EnhancementResult::failed(record, err.to_string()), was_cancelled)
            }
        }
    }

    async fn try_enhance(
        &self,
        record: &ProductRecord,
        marketplace: &Marketplace,
        model: &ModelDescriptor,
        cancel: &CancelToken,
    ) -> Result<(ProductRecord, ModelDescriptor), EnhanceError> {
        let prompt = listing_prompt(record, marketplace)?;
        let completion = self
            .llm
            .complete(
                &prompt.system,
                &prompt.user,
                model,
                &CompletionOptions::json(self.config.temperature, self.config.max_tokens),
                cancel,
            )
            .await?;
        debug!(
            target = "listing.pipeline",
            product_id = %record.product_id,
            model = %completion.model,
            attempts = completion.attempts.len(),
            "record_completion_received"
        );
        let patch = ListingPatch::parse(&completion.text)?;
        let mut merged = record.clone();
        patch.apply_to(&mut merged);
        Ok((merged, completion.model))
    }

    /// Generates content for a single task without touching the record.
    pub async fn generate(
        &self,
        task: Task,
        record: &ProductRecord,
        marketplace: &Marketplace,
        model_preference: &str,
        cancel: &CancelToken,
    ) -> Result<TaskOutput, EnhanceError> {
        let params = task_params(task, record, marketplace)?;
        let prompt = prompts::render(task, &params)?;
        let model = self.resolve_model(model_preference);
        let options = match task {
            Task::Title | Task::Description => {
                CompletionOptions::text(self.config.temperature, self.config.max_tokens)
            }
            _ => CompletionOptions::json(self.config.temperature, self.config.max_tokens),
        };
        let completion = self
            .llm
            .complete(&prompt.system, &prompt.user, &model, &options, cancel)
            .await?;
        let text = completion.text.trim();

        match task {
            Task::Title => Ok(TaskOutput::Text {
                text: truncate_chars(clean_line(text), marketplace.title_limit()),
            }),
            Task::Description => Ok(TaskOutput::Text {
                text: truncate_chars(text, DESCRIPTION_LIMIT),
            }),
            Task::BulletPoints => Ok(TaskOutput::List {
                items: string_list(&parse_object(text)?, "bullet_points", None),
            }),
            Task::Keywords => Ok(TaskOutput::List {
                items: string_list(&parse_object(text)?, "keywords", Some(',')),
            }),
            Task::Category => suggestion(&parse_object(text)?, "category"),
            Task::Brand => suggestion(&parse_object(text)?, "brand"),
            Task::FieldMapping | Task::ListingEnhancement => Err(EnhanceError::UnsupportedTask(task)),
        }
    }
}

pub fn resolve_model(preference: &str, default: &ModelDescriptor) -> ModelDescriptor {
    let preference = preference.trim();
    if preference.contains('/') {
        return ModelDescriptor::new(preference);
    }
    let key = preference.to_lowercase().replace(['-', '_', ' ', '.'], "");
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, model)| ModelDescriptor::new(*model))
        .unwrap_or_else(|| default.clone())
}

fn product_json(record: &ProductRecord) -> String {
    serde_json::to_string_pretty(record).unwrap_or_else(|_| json!({"title": record.title}).to_string())
}

pub fn listing_prompt(
    record: &ProductRecord,
    marketplace: &Marketplace,
) -> Result<RenderedPrompt, TemplateError> {
    let params = PromptParams::new()
        .set("marketplace", marketplace.name())
        .set("marketplace_guidelines", marketplace.guidelines())
        .set("product_json", product_json(record))
        .set("title_limit", marketplace.title_limit().to_string())
        .set("description_limit", DESCRIPTION_LIMIT.to_string())
        .set("bullet_count", marketplace.bullet_count().to_string());
    prompts::render(Task::ListingEnhancement, &params)
}

fn task_params(
    task: Task,
    record: &ProductRecord,
    marketplace: &Marketplace,
) -> Result<PromptParams, EnhanceError> {
    let base = PromptParams::new()
        .set("marketplace", marketplace.name())
        .set("product_json", product_json(record));
    let params = match task {
        Task::Title => base
            .set("marketplace_guidelines", marketplace.guidelines())
            .set("character_limit", marketplace.title_limit().to_string()),
        Task::Description => base
            .set("marketplace_guidelines", marketplace.guidelines())
            .set("character_limit", DESCRIPTION_LIMIT.to_string()),
        Task::BulletPoints => base
            .set("marketplace_guidelines", marketplace.guidelines())
            .set("bullet_count", marketplace.bullet_count().to_string())
            .set("character_limit", BULLET_CHAR_LIMIT.to_string()),
        Task::Keywords => base.set("keyword_count", KEYWORD_COUNT.to_string()),
        Task::Category | Task::Brand => base,
        Task::FieldMapping | Task::ListingEnhancement => {
            return Err(EnhanceError::UnsupportedTask(task));
        }
    };
    Ok(params)
}

/// Fields a model response (or a user edit) may overwrite. `None` means
/// "leave the record alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub bullet_points: Option<Vec<String>>,
    pub search_terms: Option<Vec<String>>,
    pub category: Option<String>,
    pub brand: Option<String>,
}

impl ListingPatch {
    pub fn parse(text: &str) -> Result<Self, EnhanceError> {
        Ok(Self::from_value(&parse_object(text)?))
    }

    /// Empty strings, empty arrays, nulls and wrongly typed values are dropped.
    pub fn from_value(value: &Value) -> Self {
        let search_terms = non_empty_list(value.get("search_terms"), Some(','))
            .or_else(|| non_empty_list(value.get("keywords"), Some(',')));
        Self {
            title: non_empty_str(value.get("title")),
            description: non_empty_str(value.get("description")),
            bullet_points: non_empty_list(value.get("bullet_points"), None),
            search_terms,
            category: non_empty_str(value.get("category")),
            brand: non_empty_str(value.get("brand")),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(self, record: &mut ProductRecord) {
        if let Some(title) = self.title {
            record.title = title;
        }
        if let Some(description) = self.description {
            record.description = Some(description);
        }
        if let Some(bullets) = self.bullet_points {
            record.bullet_points = bullets;
        }
        if let Some(terms) = self.search_terms {
            record.search_terms = terms;
        }
        if let Some(category) = self.category {
            record.category = Some(category);
        }
        if let Some(brand) = self.brand {
            record.brand = Some(brand);
        }
    }
}

fn parse_object(text: &str) -> Result<Value, EnhanceError> {
    let cleaned = strip_markdown_fence(text);
    let value: Value =
        serde_json::from_str(&cleaned).map_err(|err| EnhanceError::Parse(err.to_string()))?;
    if !value.is_object() {
        return Err(EnhanceError::Parse("expected a JSON object".into()));
    }
    Ok(value)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A lone string is split on `separator` when one is given, otherwise it
/// becomes a single item.
fn non_empty_list(value: Option<&Value>, separator: Option<char>) -> Option<Vec<String>> {
    let items: Vec<String> = match value? {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(joined) => match separator {
            Some(sep) => joined
                .split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => Some(joined.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .into_iter()
                .collect(),
        },
        _ => Vec::new(),
    };
    (!items.is_empty()).then_some(items)
}

fn string_list(value: &Value, key: &str, separator: Option<char>) -> Vec<String> {
    non_empty_list(value.get(key), separator).unwrap_or_default()
}

fn suggestion(value: &Value, key: &str) -> Result<TaskOutput, EnhanceError> {
    let suggested = value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    Ok(TaskOutput::Suggestion {
        value: suggested,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

fn clean_line(text: &str) -> &str {
    text.lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"')
        .trim()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect::<String>().trim_end().to_string()
}

/// Merges user edits into finished results by `product_id`.
pub fn apply_overrides(
    mut results: Vec<EnhancementResult>,
    overrides: Vec<RecordOverride>,
) -> OverridesResponse {
    let positions: HashMap<String, usize> = results
        .iter()
        .enumerate()
        .map(|(idx, r)| (r.record.product_id.clone(), idx))
        .collect();
    for result in &mut results {
        result.refresh_status();
    }
    let mut unmatched = Vec::new();
    for edit in overrides {
        match positions.get(&edit.product_id) {
            Some(&idx) => {
                let patch = ListingPatch::from_value(&edit.fields);
                if patch.is_empty() {
                    continue;
                }
                let result = &mut results[idx];
                patch.apply_to(&mut result.record);
                result.edited = true;
            }
            None => unmatched.push(edit.product_id),
        }
    }
    OverridesResponse { results, unmatched }
}
