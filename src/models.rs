use crate::llm::ModelDescriptor;
use crate::mapping::{FieldMapping, RawRow};
use crate::prompts::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, fmt};

/// One product listing. Known marketplace fields are typed; anything else a
/// source feed carries survives in `extra`.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bullet_points: Vec<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub asin: Option<String>,
    pub sku: Option<String>,
    pub upc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_terms: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProductRecord {
    #[cfg(test)]
    pub fn new(product_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancementResult {
    pub record: ProductRecord,
    pub enhanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<ModelDescriptor>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub edited: bool,
    /// Derived from `enhanced` and `error`. Clients read it, never set it.
    #[serde(skip_deserializing)]
    pub status: RecordStatus,
}

impl EnhancementResult {
    pub fn enhanced(record: ProductRecord, model: ModelDescriptor) -> Self {
        Self {
            record,
            enhanced: true,
            model_used: Some(model),
            timestamp: Utc::now(),
            error: None,
            edited: false,
            status: RecordStatus::Enhanced,
        }
    }

    pub fn failed(record: ProductRecord, error: impl Into<String>) -> Self {
        Self {
            record,
            enhanced: false,
            model_used: None,
            timestamp: Utc::now(),
            error: Some(error.into()),
            edited: false,
            status: RecordStatus::NeedsReview,
        }
    }

    /// Recomputes `status`, for results that arrived over the wire.
    pub fn refresh_status(&mut self) {
        self.status = match (self.enhanced, self.error.is_some()) {
            (true, _) => RecordStatus::Enhanced,
            (false, true) => RecordStatus::NeedsReview,
            (false, false) => RecordStatus::Unchanged,
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Enhanced,
    NeedsReview,
    #[default]
    Unchanged,
}

/// Target marketplace. Free-form input is canonicalized; names we have no
/// guidelines for are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Marketplace {
    #[default]
    Amazon,
    Ebay,
    Walmart,
    Etsy,
    Shopify,
    Other(String),
}

impl Marketplace {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed.to_lowercase().replace([' ', '-', '_', '.'], "").as_str() {
            "amazon" | "amazoncom" | "amz" => Marketplace::Amazon,
            "ebay" | "ebaycom" => Marketplace::Ebay,
            "walmart" | "walmartcom" => Marketplace::Walmart,
            "etsy" => Marketplace::Etsy,
            "shopify" => Marketplace::Shopify,
            "" => Marketplace::default(),
            _ => Marketplace::Other(trimmed.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Marketplace::Amazon => "Amazon",
            Marketplace::Ebay => "eBay",
            Marketplace::Walmart => "Walmart",
            Marketplace::Etsy => "Etsy",
            Marketplace::Shopify => "Shopify",
            Marketplace::Other(name) => name,
        }
    }

    pub fn title_limit(&self) -> usize {
        match self {
            Marketplace::Amazon => 200,
            _ => 100,
        }
    }

    pub fn bullet_count(&self) -> usize {
        match self {
            Marketplace::Amazon | Marketplace::Walmart => 5,
            Marketplace::Etsy | Marketplace::Shopify | Marketplace::Ebay => 4,
            Marketplace::Other(_) => 5,
        }
    }

    pub fn guidelines(&self) -> &'static str {
        match self {
            Marketplace::Amazon => AMAZON_GUIDELINES,
            Marketplace::Ebay => EBAY_GUIDELINES,
            Marketplace::Walmart => WALMART_GUIDELINES,
            Marketplace::Etsy => ETSY_GUIDELINES,
            Marketplace::Shopify => SHOPIFY_GUIDELINES,
            Marketplace::Other(_) => GENERIC_GUIDELINES,
        }
    }
}

impl From<String> for Marketplace {
    fn from(value: String) -> Self {
        Marketplace::parse(&value)
    }
}

impl From<Marketplace> for String {
    fn from(value: Marketplace) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const AMAZON_GUIDELINES: &str = "\
- Title: brand first, then product type, key feature, size/color/quantity. No promotional phrases, no ALL CAPS.
- Bullet points start with a short capitalised benefit phrase, then detail. No pricing or shipping claims.
- Search terms: lowercase, no brand names of competitors, no repetition of title words.";

const EBAY_GUIDELINES: &str = "\
- Title: lead with the most searched keywords; include brand, model, size and condition where known.
- Avoid symbols, emojis and words like \"wow\" or \"L@@K\".
- Description should state condition and what is included in the box.";

const WALMART_GUIDELINES: &str = "\
- Title: brand + defining qualities + item name + pack count. Plain language, no marketing superlatives.
- Key features read as concise, scannable bullets focused on specifications.";

const ETSY_GUIDELINES: &str = "\
- Title: describe what the item is first, then materials, style and occasion.
- Tone can be warm and personal; mention handmade or vintage details when present.
- Tags are short phrases buyers would type, up to 20 characters each.";

const SHOPIFY_GUIDELINES: &str = "\
- Title: clean and brand-consistent, suitable for a storefront product page.
- Description is SEO-friendly with a short intro paragraph followed by scannable details.";

const GENERIC_GUIDELINES: &str = "\
- Title: clear, specific and keyword-rich without stuffing.
- Description and bullet points must be factual and derived from the product data.";

// -------- HTTP payloads --------

#[derive(Debug, Clone, Deserialize)]
pub struct EnhanceRequest {
    pub records: Vec<ProductRecord>,
    #[serde(default)]
    pub marketplace: Marketplace,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub marketplace: Marketplace,
    pub model: ModelDescriptor,
    pub results: Vec<EnhancementResult>,
    pub enhanced_count: usize,
    pub failed_count: usize,
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub record: ProductRecord,
    pub task: Task,
    #[serde(default)]
    pub marketplace: Marketplace,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferMappingsRequest {
    pub headers: Vec<String>,
    #[serde(default)]
    pub sample_rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferMappingsResponse {
    pub mappings: Vec<FieldMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyMappingsRequest {
    pub mappings: Vec<FieldMapping>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyMappingsResponse {
    pub records: Vec<ProductRecord>,
}

/// A user's edits to one record, keyed by `product_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordOverride {
    pub product_id: String,
    pub fields: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverridesRequest {
    pub results: Vec<EnhancementResult>,
    pub overrides: Vec<RecordOverride>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverridesResponse {
    pub results: Vec<EnhancementResult>,
    pub unmatched: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
