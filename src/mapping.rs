use crate::cancel::CancelToken;
use crate::llm::{CompletionOptions, FallbackClient, LlmError, ModelDescriptor};
use crate::models::ProductRecord;
use crate::prompts::{self, PromptParams, Task, TemplateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{info, warn};

/// One already-parsed CSV row, header → cell text.
pub type RawRow = BTreeMap<String, String>;

const MAX_SAMPLES: usize = 3;
const MAPPING_TEMPERATURE: f32 = 0.2;
const MAPPING_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardField {
    ProductId,
    Title,
    Description,
    Price,
    Brand,
    Category,
    BulletPoints,
    Images,
    Asin,
    Sku,
    Upc,
    Dimensions,
    Weight,
    Color,
    Size,
    Unmapped,
}

impl StandardField {
    pub const ALL: [StandardField; 16] = [
        StandardField::ProductId,
        StandardField::Title,
        StandardField::Description,
        StandardField::Price,
        StandardField::Brand,
        StandardField::Category,
        StandardField::BulletPoints,
        StandardField::Images,
        StandardField::Asin,
        StandardField::Sku,
        StandardField::Upc,
        StandardField::Dimensions,
        StandardField::Weight,
        StandardField::Color,
        StandardField::Size,
        StandardField::Unmapped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StandardField::ProductId => "product_id",
            StandardField::Title => "title",
            StandardField::Description => "description",
            StandardField::Price => "price",
            StandardField::Brand => "brand",
            StandardField::Category => "category",
            StandardField::BulletPoints => "bullet_points",
            StandardField::Images => "images",
            StandardField::Asin => "asin",
            StandardField::Sku => "sku",
            StandardField::Upc => "upc",
            StandardField::Dimensions => "dimensions",
            StandardField::Weight => "weight",
            StandardField::Color => "color",
            StandardField::Size => "size",
            StandardField::Unmapped => "unmapped",
        }
    }

    /// Untrusted label from a model response. Anything outside the fixed
    /// enumeration becomes `Unmapped`.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        StandardField::ALL
            .into_iter()
            .find(|field| field.as_str() == normalized)
            .unwrap_or(StandardField::Unmapped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub original_column: String,
    pub standard_field: StandardField,
    pub confidence: f32,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no columns to map")]
    NoHeaders,
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("malformed mapping response: {0}")]
    Malformed(String),
}

/// Infers a column → schema mapping for a CSV header set via the model chain.
#[derive(Clone)]
pub struct FieldMapper {
    llm: FallbackClient,
    model: ModelDescriptor,
}

impl FieldMapper {
    pub fn new(llm: FallbackClient, model: ModelDescriptor) -> Self {
        Self { llm, model }
    }

    pub async fn infer_mappings(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        cancel: &CancelToken,
    ) -> Result<Vec<FieldMapping>, MappingError> {
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(MappingError::NoHeaders);
        }

        let standard_fields = StandardField::ALL
            .iter()
            .map(StandardField::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let params = PromptParams::new()
            .set("standard_fields", standard_fields)
            .set("column_samples", column_samples(headers, sample_rows));
        let prompt = prompts::render(Task::FieldMapping, &params)?;

        let completion = self
            .llm
            .complete(
                &prompt.system,
                &prompt.user,
                &self.model,
                &CompletionOptions::json(MAPPING_TEMPERATURE, MAPPING_MAX_TOKENS),
                cancel,
            )
            .await?;

        let parsed = parse_mappings(&completion.text)?;
        let mappings = reconcile(headers, parsed);
        info!(
            target = "listing.mapping",
            columns = headers.len(),
            mapped = mappings
                .iter()
                .filter(|m| m.standard_field != StandardField::Unmapped)
                .count(),
            model = %completion.model,
            "field_mappings_inferred"
        );
        Ok(mappings)
    }
}

/// `"{header}: {s1} | {s2} | {s3}"` per header, one per line.
pub fn column_samples(headers: &[String], rows: &[RawRow]) -> String {
    headers
        .iter()
        .map(|header| {
            let samples: Vec<&str> = rows
                .iter()
                .filter_map(|row| row.get(header))
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .take(MAX_SAMPLES)
                .collect();
            format!("{header}: {}", samples.join(" | "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_mappings(text: &str) -> Result<Vec<FieldMapping>, MappingError> {
    let cleaned = strip_markdown_fence(text);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|err| MappingError::Malformed(format!("invalid json: {err}")))?;
    let entries = value
        .get("column_mappings")
        .and_then(Value::as_array)
        .ok_or_else(|| MappingError::Malformed("missing `column_mappings` array".into()))?;

    let mut mappings = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(column) = entry
            .get("original_column")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
        else {
            warn!(target = "listing.mapping", entry = %entry, "mapping_entry_without_column");
            continue;
        };
        let standard_field = entry
            .get("standard_field")
            .and_then(Value::as_str)
            .map(StandardField::from_label)
            .unwrap_or(StandardField::Unmapped);
        let confidence = match entry.get("confidence") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        let notes = entry
            .get("notes")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        mappings.push(FieldMapping {
            original_column: column.to_string(),
            standard_field,
            confidence: (confidence as f32).clamp(0.0, 1.0),
            notes,
        });
    }
    Ok(mappings)
}

/// Keeps one mapping per known header, in header order. Columns the model
/// skipped come back as `Unmapped`; columns it made up are dropped.
fn reconcile(headers: &[String], parsed: Vec<FieldMapping>) -> Vec<FieldMapping> {
    let mut by_column: BTreeMap<String, FieldMapping> = BTreeMap::new();
    for mapping in parsed {
        by_column
            .entry(mapping.original_column.clone())
            .or_insert(mapping);
    }
    let mut seen: HashSet<String> = HashSet::new();
    headers
        .iter()
        .filter(|h| !h.trim().is_empty() && seen.insert(h.to_string()))
        .map(|header| {
            by_column.remove(header).unwrap_or_else(|| FieldMapping {
                original_column: header.clone(),
                standard_field: StandardField::Unmapped,
                confidence: 0.0,
                notes: "not returned by model".into(),
            })
        })
        .collect()
}

/// Converts parsed rows into records using a confirmed mapping.
pub fn apply_mappings(mappings: &[FieldMapping], rows: &[RawRow]) -> Vec<ProductRecord> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| record_from_row(mappings, index, row))
        .collect()
}

pub fn record_from_row(mappings: &[FieldMapping], index: usize, row: &RawRow) -> ProductRecord {
    let mut record = ProductRecord::default();
    for mapping in mappings {
        let Some(raw) = row.get(&mapping.original_column) else {
            continue;
        };
        let value = raw.trim();
        if value.is_empty() {
            continue;
        }
        match mapping.standard_field {
            StandardField::ProductId => set_if_empty(&mut record.product_id, value),
            StandardField::Title => set_if_empty(&mut record.title, value),
            StandardField::Description => set_opt(&mut record.description, value),
            StandardField::Brand => set_opt(&mut record.brand, value),
            StandardField::Category => set_opt(&mut record.category, value),
            StandardField::Asin => set_opt(&mut record.asin, value),
            StandardField::Sku => set_opt(&mut record.sku, value),
            StandardField::Upc => set_opt(&mut record.upc, value),
            StandardField::Price => {
                if record.price.is_none() {
                    record.price = parse_price(value);
                }
            }
            StandardField::BulletPoints => {
                if record.bullet_points.is_empty() {
                    record.bullet_points = split_list(value, &['|', ';', '\n']);
                }
            }
            StandardField::Images => {
                if record.images.is_empty() {
                    record.images = split_list(value, &['|', ';', ',', '\n', ' ']);
                }
            }
            StandardField::Dimensions
            | StandardField::Weight
            | StandardField::Color
            | StandardField::Size => {
                record
                    .extra
                    .entry(mapping.standard_field.as_str().to_string())
                    .or_insert_with(|| Value::String(value.to_string()));
            }
            StandardField::Unmapped => {
                record
                    .extra
                    .entry(extra_key(&mapping.original_column))
                    .or_insert_with(|| Value::String(value.to_string()));
            }
        }
    }
    if record.product_id.is_empty() {
        record.product_id = record
            .sku
            .clone()
            .unwrap_or_else(|| format!("row-{}", index + 1));
    }
    record
}

/// Keys `ProductRecord` serializes as typed fields. An unmapped column with
/// one of these names would shadow the real field once `extra` is flattened.
const RECORD_FIELDS: [&str; 12] = [
    "product_id",
    "title",
    "description",
    "bullet_points",
    "brand",
    "category",
    "price",
    "images",
    "asin",
    "sku",
    "upc",
    "search_terms",
];

fn extra_key(column: &str) -> String {
    if RECORD_FIELDS.contains(&column) {
        format!("raw_{column}")
    } else {
        column.to_string()
    }
}

fn set_if_empty(slot: &mut String, value: &str) {
    if slot.is_empty() {
        *slot = value.to_string();
    }
}

fn set_opt(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

fn split_list(value: &str, separators: &[char]) -> Vec<String> {
    value
        .split(separators)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts "$1,299.99", "1299", "EUR 12.50". European decimal commas are not
/// handled.
pub fn parse_price(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite())
}

pub(crate) fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
