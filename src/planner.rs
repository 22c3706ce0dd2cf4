//! Rule-based choice of the garment regions sent to part analysis.

use crate::facts::{GarmentFacts, RiskFlag, VisibilityLevel};
use crate::features::FeatureSet;

/// Canonical ordering; a plan is always emitted in this order.
const PART_ORDER: [&str; 16] = [
    "collar",
    "inner_collar",
    "neckline",
    "placket",
    "button",
    "sleeve",
    "cuff",
    "waistband",
    "body",
    "pocket",
    "seam",
    "leg",
    "hem",
    "label",
    "hood",
    "strap",
];

const STRUCTURAL_PARTS: [&str; 5] = ["collar", "neckline", "waistband", "hood", "body"];

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    pub high_complexity_threshold: f64,
    pub high_transparency_threshold: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            high_complexity_threshold: 0.7,
            high_transparency_threshold: 0.6,
        }
    }
}

pub fn base_parts_for_category(category: &str) -> &'static [&'static str] {
    match category {
        "shirt" | "dress_shirt" | "button_up" | "blouse" | "polo" | "t_shirt" | "tee" | "top"
        | "sweater" | "jacket" | "coat" | "blazer" => &["collar", "sleeve", "body", "hem"],
        "hoodie" | "sweatshirt" => &["hood", "sleeve", "body", "hem"],
        "dress" => &["neckline", "sleeve", "body", "hem"],
        "tank_top" | "camisole" => &["neckline", "strap", "body", "hem"],
        "pants" | "trousers" | "jeans" | "shorts" | "leggings" => {
            &["waistband", "body", "leg", "hem"]
        }
        "skirt" => &["waistband", "body", "hem"],
        _ => &["body", "hem"],
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartPlanner {
    config: PlannerConfig,
}

impl PartPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self, facts: &GarmentFacts, features: &FeatureSet) -> Vec<String> {
        let mut parts = base_parts_for_category(facts.normalized_category().as_str()).to_vec();

        if facts.interior_visibility == Some(VisibilityLevel::High) {
            if parts.contains(&"sleeve") {
                parts.push("cuff");
            }
            if parts.contains(&"collar") || parts.contains(&"neckline") {
                parts.push("inner_collar");
            }
        }
        if facts.has_risk_flag(RiskFlag::Closures) {
            parts.push("placket");
        }
        if facts.complexity_score > self.config.high_complexity_threshold {
            parts.extend(["seam", "pocket", "button"]);
        }
        if features.text_detected || facts.has_risk_flag(RiskFlag::Text) {
            parts.push("label");
        }

        if facts.transparency_level > self.config.high_transparency_threshold {
            let minimal = parts
                .iter()
                .copied()
                .filter(|p| STRUCTURAL_PARTS.contains(p))
                .collect::<Vec<_>>();
            parts = if minimal.is_empty() { vec!["body"] } else { minimal };
        }

        parts.sort_by_key(|p| PART_ORDER.iter().position(|o| o == p));
        parts.dedup();
        parts.into_iter().map(str::to_string).collect()
    }
}
