//! Normalization of free-form VLM replies into (label, portion, confidence).
//!
//! Models wrap JSON in prose, use single quotes, return lists or drop fields.
//! Labels are recovered by trying [`LabelStrategy::ORDER`] in turn; numeric
//! fields fall back to fixed defaults. Nothing here fails.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

use crate::models::{coerce_f64, is_truthy, DEFAULT_CONFIDENCE, DEFAULT_PORTION_GRAMS};

static JSON_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());
static QUOTED_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"label"\s*:\s*"([^"]+)""#).unwrap());
static LOOSE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)label["']?\s*[:=]\s*["']?([A-Za-z0-9][^"',\n]+)"#).unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9 /()-]").unwrap());

const MAX_QUERY_TOKENS: usize = 6;
const UNKNOWN_LABEL: &str = "unknown";

/// Where a label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStrategy {
    /// `label` / `dish` / `class` of the first `{...}` span parsed as JSON.
    EmbeddedJson,
    /// `"label": "..."` anywhere in the text.
    QuotedKey,
    /// `label: ...`, `label = ...` or `'label': '...'`, quotes optional.
    LooseKeyValue,
}

impl LabelStrategy {
    pub const ORDER: [LabelStrategy; 3] = [
        LabelStrategy::EmbeddedJson,
        LabelStrategy::QuotedKey,
        LabelStrategy::LooseKeyValue,
    ];

    fn apply(&self, text: &str, embedded: Option<&Value>) -> Option<Value> {
        match self {
            LabelStrategy::EmbeddedJson => embedded.and_then(|obj| {
                ["label", "dish", "class"]
                    .iter()
                    .filter_map(|key| obj.get(*key))
                    .find(|v| is_truthy(v))
                    .cloned()
            }),
            LabelStrategy::QuotedKey => QUOTED_LABEL
                .captures(text)
                .map(|c| Value::String(c[1].to_string())),
            LabelStrategy::LooseKeyValue => LOOSE_LABEL
                .captures(text)
                .map(|c| c[1].trim().to_string())
                .filter(|s| !s.is_empty())
                .map(Value::String),
        }
    }
}

/// Normalized model output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlmExtraction {
    pub label: String,
    pub portion_grams: f64,
    pub confidence: f64,
    pub label_source: Option<LabelStrategy>,
}

/// Extract label, portion and confidence from raw model text.
pub fn extract(text: &str) -> VlmExtraction {
    let embedded = embedded_json(text);

    let mut label_source = None;
    let mut label = None;
    for strategy in LabelStrategy::ORDER {
        if let Some(value) = strategy.apply(text, embedded.as_ref()).and_then(first_if_list) {
            label_source = Some(strategy);
            label = Some(value);
            break;
        }
    }

    let label = label
        .map(|v| clean_query(&label_to_string(&v)))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            label_source = None;
            UNKNOWN_LABEL.to_string()
        });

    let numeric = |key: &str, default: f64| {
        embedded
            .as_ref()
            .and_then(|obj| obj.get(key))
            .and_then(coerce_f64)
            .unwrap_or(default)
    };

    VlmExtraction {
        label,
        portion_grams: numeric("portion_grams", DEFAULT_PORTION_GRAMS),
        confidence: numeric("confidence", DEFAULT_CONFIDENCE),
        label_source,
    }
}

/// Make a label safe to use as a food-search query.
pub fn clean_query(s: &str) -> String {
    let s = s.replace('&', " and ").replace('\n', " ");
    let s = WHITESPACE.replace_all(s.trim(), " ");
    let s = DISALLOWED.replace_all(&s, "");
    s.split_whitespace()
        .take(MAX_QUERY_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Greedy first-`{`-to-last-`}` span, kept only if it parses as an object.
fn embedded_json(text: &str) -> Option<Value> {
    let span = JSON_SPAN.find(text)?;
    match serde_json::from_str::<Value>(span.as_str()) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => None,
        Err(e) => {
            log::debug!("Embedded JSON did not parse: {}", e);
            None
        }
    }
}

fn first_if_list(value: Value) -> Option<Value> {
    match value {
        Value::Array(items) => items.into_iter().next().filter(|v| !v.is_null()),
        Value::Null => None,
        other => Some(other),
    }
}

fn label_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
