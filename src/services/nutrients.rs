//! Serving extraction, nutrient aggregation and portion scaling for FDC records.
//!
//! Units are taken as FDC reports them: energy in kcal, macros in grams and
//! sodium in milligrams. Nothing here verifies the unit fields.

use serde_json::Value;
use std::collections::HashMap;

use crate::models::{
    coerce_f64, coerce_i64, is_truthy, FoodRecord, NutrientProfile, ScaledProfile, ServingSpec,
};

pub const ENERGY_KCAL_ID: i64 = 1008;
pub const ENERGY_ATWATER_ID: i64 = 2047;
pub const PROTEIN_ID: i64 = 1003;
pub const FAT_ID: i64 = 1004;
pub const CARB_ID: i64 = 1005;
pub const FIBER_ID: i64 = 1079;
pub const SODIUM_ID: i64 = 1093;
pub const SUGAR_ID: i64 = 2000;

const ENERGY_IDS: [i64; 2] = [ENERGY_KCAL_ID, ENERGY_ATWATER_ID];

/// Branded `labelNutrients` keys and the nutrient ids they stand for.
const LABEL_NUTRIENT_IDS: [(&str, i64); 7] = [
    ("calories", ENERGY_KCAL_ID),
    ("protein", PROTEIN_ID),
    ("fat", FAT_ID),
    ("carbohydrates", CARB_ID),
    ("fiber", FIBER_ID),
    ("sugars", SUGAR_ID),
    ("sodium", SODIUM_ID),
];

const PORTION_FIELDS: [&str; 2] = ["foodPortions", "portions"];

/// Reference serving of a record: explicit serving size, else the first
/// portion with a gram weight, else 100 g.
pub fn extract_serving(record: &FoodRecord) -> ServingSpec {
    if let Some(serving) = explicit_serving(record) {
        return serving;
    }

    for key in PORTION_FIELDS {
        let Some(portions) = record.field(key).and_then(Value::as_array) else {
            continue;
        };
        let gram_weight = portions
            .iter()
            .filter_map(|p| p.get("gramWeight").and_then(coerce_f64))
            .find(|g| *g > 0.0);
        if let Some(grams) = gram_weight {
            return ServingSpec::grams(grams);
        }
    }

    ServingSpec::grams(100.0)
}

fn explicit_serving(record: &FoodRecord) -> Option<ServingSpec> {
    let size = record.field("servingSize").filter(|v| is_truthy(v))?;
    let unit = record.field("servingSizeUnit").filter(|v| is_truthy(v))?;
    let amount = coerce_f64(size)?;
    let unit = match unit {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(ServingSpec { amount, unit })
}

/// Nutrient id -> amount, merged from `foodNutrients` and `labelNutrients`.
/// Generic entries are inserted first; label values only fill gaps.
pub fn nutrients_by_id(record: &FoodRecord) -> HashMap<i64, f64> {
    let mut out = HashMap::new();

    if let Some(entries) = record.field("foodNutrients").and_then(Value::as_array) {
        for entry in entries {
            let id = entry
                .get("nutrient")
                .and_then(|n| n.get("id"))
                .filter(|v| is_truthy(v))
                .or_else(|| entry.get("nutrientId"))
                .and_then(coerce_i64);
            let amount = entry.get("amount").and_then(coerce_f64);
            if let (Some(id), Some(amount)) = (id, amount) {
                out.insert(id, amount);
            }
        }
    }

    if let Some(label) = record.field("labelNutrients") {
        for (key, id) in LABEL_NUTRIENT_IDS {
            let value = label
                .get(key)
                .filter(|node| node.is_object())
                .and_then(|node| node.get("value"))
                .and_then(coerce_f64);
            if let Some(value) = value {
                out.entry(id).or_insert(value);
            }
        }
    }

    out
}

/// Project a record onto the canonical seven nutrients; missing ones are 0.0.
pub fn summarize_macros(record: &FoodRecord) -> NutrientProfile {
    let ns = nutrients_by_id(record);
    let get_any = |ids: &[i64]| {
        ids.iter()
            .find_map(|id| ns.get(id).copied())
            .map(|v| v.max(0.0))
            .unwrap_or(0.0)
    };

    NutrientProfile {
        calories_kcal: get_any(&ENERGY_IDS),
        protein_g: get_any(&[PROTEIN_ID]),
        fat_g: get_any(&[FAT_ID]),
        carb_g: get_any(&[CARB_ID]),
        fiber_g: get_any(&[FIBER_ID]),
        sodium_mg: get_any(&[SODIUM_ID]),
        sugars_g: get_any(&[SUGAR_ID]),
    }
}

/// Scale a per-serving profile to `target_grams`. Only gram servings scale;
/// anything else passes through and is reported as unscaled.
pub fn scale(profile: &NutrientProfile, serving: &ServingSpec, target_grams: f64) -> ScaledProfile {
    if serving.is_grams() && serving.amount != 0.0 {
        let factor = target_grams / serving.amount;
        let factor = if factor.is_finite() && factor >= 0.0 {
            factor
        } else {
            log::warn!(
                "⚠️ Unusable scale factor ({} g / {} g), leaving profile unscaled",
                target_grams,
                serving.amount
            );
            1.0
        };
        let mut scaled = profile.map(|v| round2(v * factor));
        if !scaled.is_finite() {
            log::warn!(
                "⚠️ Scaling to {} g overflowed, leaving profile unscaled",
                target_grams
            );
            scaled = profile.map(round2);
        }
        ScaledProfile {
            profile: scaled,
            serving_used: format!("{:.0} g (scaled from {:.0} g)", target_grams, serving.amount),
            scaled: true,
        }
    } else {
        ScaledProfile {
            profile: *profile,
            serving_used: format!("{} {} (unscaled)", serving.amount, serving.unit),
            scaled: false,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
