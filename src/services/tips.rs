use serde_json::json;

use crate::models::NutrientProfile;

const MAX_HEURISTIC_TIPS: usize = 3;
const BALANCED_TIP: &str = "Nice balance! Pair with water and extra veggies if you like.";

struct TipRule {
    applies: fn(&NutrientProfile) -> bool,
    text: &'static str,
}

const RULES: [TipRule; 4] = [
    TipRule {
        applies: |p: &NutrientProfile| p.sodium_mg > 700.0,
        text: "High sodium: try low-sodium dressing or sauce.",
    },
    TipRule {
        applies: |p: &NutrientProfile| p.fiber_g < 5.0,
        text: "Low fiber: add greens, beans, or whole grains.",
    },
    TipRule {
        applies: |p: &NutrientProfile| p.protein_g < 15.0,
        text: "Boost protein with chicken, tofu, eggs, or legumes.",
    },
    TipRule {
        applies: |p: &NutrientProfile| p.sugars_g > 20.0,
        text: "Sugary: keep dressing on the side or skip sweet drinks.",
    },
];

/// Rule-based tips for a (scaled) profile, at most three.
pub fn tips_from_profile(profile: &NutrientProfile) -> Vec<String> {
    let mut tips: Vec<String> = RULES
        .iter()
        .filter(|rule| (rule.applies)(profile))
        .take(MAX_HEURISTIC_TIPS)
        .map(|rule| rule.text.to_string())
        .collect();

    if tips.is_empty() {
        tips.push(BALANCED_TIP.to_string());
    }
    tips
}

/// Natural-language retrieval query steering the guidance search with the
/// dish name and its scaled macros.
pub fn build_guidance_query(label: &str, profile: &NutrientProfile) -> String {
    let info = json!({
        "dish": label,
        "calories": profile.calories_kcal,
        "protein": profile.protein_g,
        "fat": profile.fat_g,
        "carbs": profile.carb_g,
        "fiber": profile.fiber_g,
        "sodium": profile.sodium_mg,
    });

    format!(
        "Given the following meal nutrition, suggest 2-3 evidence-based, practical \
         tips on how to improve the meal (e.g., lower sodium, increase fiber, \
         balance macros) using the knowledge base.\nNutrition JSON: {}",
        info
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_rules_fire() {
        let profile = NutrientProfile {
            sodium_mg: 800.0,
            fiber_g: 2.0,
            protein_g: 10.0,
            sugars_g: 5.0,
            ..NutrientProfile::default()
        };
        let tips = tips_from_profile(&profile);
        assert_eq!(tips.len(), 3);
        assert!(tips[0].contains("sodium"));
        assert!(tips[1].contains("fiber"));
        assert!(tips[2].contains("protein"));
    }

    #[test]
    fn test_cap_at_three() {
        let profile = NutrientProfile {
            sodium_mg: 1200.0,
            sugars_g: 40.0,
            ..NutrientProfile::default()
        };
        let tips = tips_from_profile(&profile);
        assert_eq!(tips.len(), 3);
        assert!(!tips.iter().any(|t| t.starts_with("Sugary")));
    }

    #[test]
    fn test_sugar_rule() {
        let profile = NutrientProfile {
            fiber_g: 8.0,
            protein_g: 30.0,
            sugars_g: 25.0,
            ..NutrientProfile::default()
        };
        assert_eq!(
            tips_from_profile(&profile),
            vec!["Sugary: keep dressing on the side or skip sweet drinks.".to_string()]
        );
    }

    #[test]
    fn test_balanced_default() {
        let profile = NutrientProfile {
            fiber_g: 8.0,
            protein_g: 30.0,
            sodium_mg: 300.0,
            sugars_g: 4.0,
            ..NutrientProfile::default()
        };
        assert_eq!(tips_from_profile(&profile), vec![BALANCED_TIP.to_string()]);
    }

    #[test]
    fn test_guidance_query_mentions_dish_and_macros() {
        let profile = NutrientProfile { sodium_mg: 910.5, ..NutrientProfile::default() };
        let query = build_guidance_query("ramen", &profile);
        assert!(query.contains(r#""dish":"ramen""#));
        assert!(query.contains(r#""sodium":910.5"#));
    }
}
