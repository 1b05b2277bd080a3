//! Static prompt catalog and placeholder substitution.
//!
//! Templates are flat text with `{name}` placeholders. Rendering is literal
//! replacement; a placeholder without a supplied parameter is an error rather
//! than being left in the prompt.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

pub const TEMPLATE_VERSION: &str = "2024-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Title,
    Description,
    BulletPoints,
    Keywords,
    Category,
    Brand,
    FieldMapping,
    ListingEnhancement,
}

impl Task {
    pub const ALL: [Task; 8] = [
        Task::Title,
        Task::Description,
        Task::BulletPoints,
        Task::Keywords,
        Task::Category,
        Task::Brand,
        Task::FieldMapping,
        Task::ListingEnhancement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Title => "title",
            Task::Description => "description",
            Task::BulletPoints => "bullet_points",
            Task::Keywords => "keywords",
            Task::Category => "category",
            Task::Brand => "brand",
            Task::FieldMapping => "field_mapping",
            Task::ListingEnhancement => "listing_enhancement",
        }
    }

    /// Placeholder names used by this task's templates, in first-seen order.
    pub fn placeholders(&self) -> &'static [&'static str] {
        CATALOG
            .get(self)
            .map(|entry| entry.placeholders.as_slice())
            .unwrap_or(&[])
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{task}` needs parameter `{name}`")]
    MissingParameter { task: Task, name: String },
    #[error("template `{task}` has an unterminated placeholder `{{{name}`")]
    UnterminatedPlaceholder { task: Task, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Named parameters for a render call.
#[derive(Debug, Clone, Default)]
pub struct PromptParams {
    values: BTreeMap<&'static str, String>,
}

impl PromptParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

struct TemplateEntry {
    system: &'static str,
    user: &'static str,
    placeholders: Vec<&'static str>,
}

static CATALOG: Lazy<HashMap<Task, TemplateEntry>> = Lazy::new(|| {
    Task::ALL
        .into_iter()
        .map(|task| {
            let (system, user) = template_text(task);
            let mut placeholders = Vec::new();
            for name in scan_placeholders(system).chain(scan_placeholders(user)) {
                if !placeholders.contains(&name) {
                    placeholders.push(name);
                }
            }
            (
                task,
                TemplateEntry {
                    system,
                    user,
                    placeholders,
                },
            )
        })
        .collect()
});

pub fn render(task: Task, params: &PromptParams) -> Result<RenderedPrompt, TemplateError> {
    if let Some(name) = task.placeholders().iter().find(|name| params.get(name).is_none()) {
        return Err(TemplateError::MissingParameter {
            task,
            name: name.to_string(),
        });
    }
    let (system, user) = match CATALOG.get(&task) {
        Some(entry) => (entry.system, entry.user),
        None => template_text(task),
    };
    Ok(RenderedPrompt {
        system: substitute(task, system, params)?,
        user: substitute(task, user, params)?,
    })
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'
}

/// Yields placeholder names in `template`. `{` not followed by a name and a
/// closing `}` is plain text, so JSON examples inside templates pass through.
fn scan_placeholders(template: &'static str) -> impl Iterator<Item = &'static str> {
    let mut rest = template;
    std::iter::from_fn(move || {
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
            let name = &after[..name_len];
            if !name.is_empty() && after[name_len..].starts_with('}') {
                rest = &after[name_len + 1..];
                return Some(name);
            }
            rest = after;
        }
        None
    })
}

fn substitute(task: Task, template: &str, params: &PromptParams) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let name = &after[..name_len];
        if name.is_empty() {
            out.push('{');
            rest = after;
            continue;
        }
        if name_len == after.len() {
            return Err(TemplateError::UnterminatedPlaceholder {
                task,
                name: name.to_string(),
            });
        }
        if !after[name_len..].starts_with('}') {
            out.push('{');
            rest = after;
            continue;
        }
        let value = params
            .get(name)
            .ok_or_else(|| TemplateError::MissingParameter {
                task,
                name: name.to_string(),
            })?;
        out.push_str(value);
        rest = &after[name_len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn template_text(task: Task) -> (&'static str, &'static str) {
    match task {
        Task::Title => (TITLE_SYSTEM, TITLE_USER),
        Task::Description => (DESCRIPTION_SYSTEM, DESCRIPTION_USER),
        Task::BulletPoints => (BULLETS_SYSTEM, BULLETS_USER),
        Task::Keywords => (KEYWORDS_SYSTEM, KEYWORDS_USER),
        Task::Category => (CATEGORY_SYSTEM, CATEGORY_USER),
        Task::Brand => (BRAND_SYSTEM, BRAND_USER),
        Task::FieldMapping => (MAPPING_SYSTEM, MAPPING_USER),
        Task::ListingEnhancement => (LISTING_SYSTEM, LISTING_USER),
    }
}

const TITLE_SYSTEM: &str = "\
You are an e-commerce copywriter who writes product titles for {marketplace}. \
You follow the marketplace's style rules exactly and never invent product facts.";

const TITLE_USER: &str = "\
Write one optimized product title for {marketplace}.

Marketplace guidelines:
{marketplace_guidelines}

Product data:
{product_json}

Rules:
- At most {character_limit} characters.
- Return only the title text, with no quotes and no explanation.";

const DESCRIPTION_SYSTEM: &str = "\
You are an e-commerce copywriter who writes persuasive, accurate product descriptions \
for {marketplace}. You only use facts present in the product data.";

const DESCRIPTION_USER: &str = "\
Write a product description for {marketplace}.

Marketplace guidelines:
{marketplace_guidelines}

Product data:
{product_json}

Rules:
- At most {character_limit} characters.
- Plain text paragraphs, no HTML and no markdown headings.
- Return only the description text.";

const BULLETS_SYSTEM: &str = "\
You are an e-commerce copywriter who writes scannable feature bullet points for \
{marketplace}. Respond with JSON only.";

const BULLETS_USER: &str = "\
Write exactly {bullet_count} bullet points for this product on {marketplace}.

Marketplace guidelines:
{marketplace_guidelines}

Product data:
{product_json}

Return a JSON object of the form {\"bullet_points\": [\"...\"]}. \
Each bullet is at most {character_limit} characters.";

const KEYWORDS_SYSTEM: &str = "\
You are a marketplace search specialist for {marketplace}. Respond with JSON only.";

const KEYWORDS_USER: &str = "\
Suggest up to {keyword_count} search keywords shoppers would use to find this product on {marketplace}.

Product data:
{product_json}

Return a JSON object of the form {\"keywords\": [\"...\"]}. \
Use lowercase phrases, no duplicates, and do not repeat the brand name.";

const CATEGORY_SYSTEM: &str = "\
You are a product taxonomy expert for {marketplace}. Respond with JSON only.";

const CATEGORY_USER: &str = "\
Suggest the most specific {marketplace} category path for this product.

Product data:
{product_json}

Return a JSON object of the form {\"category\": \"Top > Sub > Leaf\", \"confidence\": 0.0}. \
Confidence is a number between 0 and 1.";

const BRAND_SYSTEM: &str = "\
You identify product brands from listing data. Respond with JSON only.";

const BRAND_USER: &str = "\
Identify the brand of this product. If the data does not name or strongly imply a brand, \
answer with an empty string.

Product data:
{product_json}

Return a JSON object of the form {\"brand\": \"...\", \"confidence\": 0.0}.";

const MAPPING_SYSTEM: &str = "\
You map spreadsheet columns from product catalog exports onto a fixed product schema. \
Respond with JSON only.";

const MAPPING_USER: &str = "\
Map each CSV column below to one standard product field.

Standard fields: {standard_fields}

Columns with sample values:
{column_samples}

Return a JSON object of the form
{\"column_mappings\": [{\"original_column\": \"...\", \"standard_field\": \"...\", \"confidence\": 0.0, \"notes\": \"...\"}]}
with one entry per column. Use \"unmapped\" when no standard field fits. \
Confidence is a number between 0 and 1.";

const LISTING_SYSTEM: &str = "\
You are an expert e-commerce listing optimizer for {marketplace}. You rewrite product \
content so it ranks well in marketplace search and converts shoppers, while staying \
faithful to the product data. Respond with JSON only.";

const LISTING_USER: &str = "\
Enhance the following product listing for {marketplace}.

Marketplace guidelines:
{marketplace_guidelines}

Product data:
{product_json}

Return a JSON object with these keys:
- \"title\": optimized title, at most {title_limit} characters
- \"description\": compelling description, at most {description_limit} characters
- \"bullet_points\": array of exactly {bullet_count} concise feature bullets
- \"search_terms\": array of relevant search keywords

Only use facts from the product data. Omit a key rather than inventing content.";
