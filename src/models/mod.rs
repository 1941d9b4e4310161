use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default portion used when the model gives no usable estimate.
pub const DEFAULT_PORTION_GRAMS: f64 = 250.0;
/// Default confidence used when the model gives no usable value.
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Output of a single image classification, identical for every backend.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub label: String,
    pub portion_grams: f64,
    pub confidence: f64,
    pub backend_trace: Value,
}

/// Supported VLM backends. Unknown names resolve to the local backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAi,
}

impl BackendKind {
    pub fn from_string(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "openai" => BackendKind::OpenAi,
            _ => BackendKind::Ollama,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
        };
        write!(f, "{}", s)
    }
}

/// FDC record category, used for match ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoodKind {
    /// "Survey (FNDDS)" and "SR Legacy" records.
    Standard,
    Branded,
    Other(String),
}

impl FoodKind {
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.trim().to_lowercase().as_str() {
            "survey (fndds)" | "sr legacy" => FoodKind::Standard,
            "branded" => FoodKind::Branded,
            other => FoodKind::Other(other.to_string()),
        }
    }

    /// Lower ranks first.
    pub fn rank(&self) -> u8 {
        match self {
            FoodKind::Standard => 0,
            FoodKind::Branded => 1,
            FoodKind::Other(_) => 2,
        }
    }
}

/// One row of an FDC search response.
#[derive(Debug, Clone)]
pub struct FoodCandidate {
    pub id: Option<i64>,
    pub description: String,
    pub data_type: String,
    pub kind: FoodKind,
    pub score: f64,
    pub raw: Value,
}

impl FoodCandidate {
    pub fn from_value(raw: Value) -> Self {
        let data_type = raw
            .get("dataType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            id: raw.get("fdcId").and_then(coerce_i64),
            description: raw
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: FoodKind::from_data_type(&data_type),
            data_type,
            score: raw.get("score").and_then(coerce_f64).unwrap_or(0.0),
            raw,
        }
    }

    /// Extract the `foods` array of a search response.
    pub fn from_search(search: &Value) -> Vec<Self> {
        search
            .get("foods")
            .and_then(Value::as_array)
            .map(|foods| foods.iter().cloned().map(Self::from_value).collect())
            .unwrap_or_default()
    }
}

/// A full FDC details record. Standard and branded records encode serving
/// and nutrient data differently; both are read through the accessors in
/// `services::nutrients`, which tolerate either shape.
#[derive(Debug, Clone)]
pub struct FoodRecord {
    pub kind: FoodKind,
    pub raw: Value,
}

impl FoodRecord {
    pub fn from_value(raw: Value) -> Self {
        let kind = FoodKind::from_data_type(
            raw.get("dataType").and_then(Value::as_str).unwrap_or_default(),
        );
        Self { kind, raw }
    }

    pub fn fdc_id(&self) -> Option<i64> {
        self.raw.get("fdcId").and_then(coerce_i64)
    }

    pub fn description(&self) -> Option<&str> {
        self.raw.get("description").and_then(Value::as_str)
    }

    pub fn data_type(&self) -> Option<&str> {
        self.raw.get("dataType").and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.raw.get(key).filter(|v| !v.is_null())
    }
}

/// Reference quantity a nutrient profile is expressed per.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServingSpec {
    pub amount: f64,
    pub unit: String,
}

impl ServingSpec {
    pub fn grams(amount: f64) -> Self {
        Self {
            amount,
            unit: "g".to_string(),
        }
    }

    pub fn is_grams(&self) -> bool {
        self.unit.eq_ignore_ascii_case("g")
    }
}

/// Canonical seven-field nutrient profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NutrientProfile {
    pub calories_kcal: f64,
    pub protein_g: f64,
    pub fat_g: f64,
    pub carb_g: f64,
    pub fiber_g: f64,
    pub sodium_mg: f64,
    pub sugars_g: f64,
}

impl NutrientProfile {
    /// Apply `f` to every field.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            calories_kcal: f(self.calories_kcal),
            protein_g: f(self.protein_g),
            fat_g: f(self.fat_g),
            carb_g: f(self.carb_g),
            fiber_g: f(self.fiber_g),
            sodium_mg: f(self.sodium_mg),
            sugars_g: f(self.sugars_g),
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.calories_kcal,
            self.protein_g,
            self.fat_g,
            self.carb_g,
            self.fiber_g,
            self.sodium_mg,
            self.sugars_g,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// A profile scaled (or passed through) for the estimated portion.
#[derive(Debug, Clone, Serialize)]
pub struct ScaledProfile {
    pub profile: NutrientProfile,
    pub serving_used: String,
    pub scaled: bool,
}

/// Permissive numeric coercion: JSON numbers and numeric strings.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Truthiness as the FDC payloads use it: null, false, 0, "" and [] are absent.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
