//! Semantic alignment: how well a reviewer's description of the render
//! matches the garment facts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::facts::part_response::strip_response_formatting;
use crate::facts::{is_valid_hex_color, normalize_token, GarmentFacts, Pattern};
use crate::features::{FeatureSet, PatternComplexity};
use crate::imaging::color::{delta_e, parse_hex_rgb};
use crate::imaging::luma_601;

const CATEGORY_WEIGHT: f64 = 0.4;
const COLOR_WEIGHT: f64 = 0.35;
const PATTERN_WEIGHT: f64 = 0.25;

/// ΔE at which the color term reaches zero.
const COLOR_DELTA_E_SPAN: f64 = 20.0;

pub const REVIEWER_UNAVAILABLE_NOTE: &str = "semantic reviewer unavailable";

const CATEGORY_GROUPS: &[&[&str]] = &[
    &["shirt", "button_up", "dress_shirt", "blouse", "oxford"],
    &["t_shirt", "tee", "tshirt", "top"],
    &["pants", "trousers", "slacks", "chinos"],
    &["jeans", "denim_pants"],
    &["hoodie", "sweatshirt", "pullover"],
    &["sweater", "jumper", "knitwear", "cardigan"],
    &["jacket", "blazer", "coat"],
    &["dress", "gown"],
    &["skirt"],
    &["shorts"],
];

/// What a reviewer reports seeing in a rendered image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticObservation {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub color_hex: Option<String>,
    #[serde(default)]
    pub pattern: Option<Pattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticAlignment {
    pub score: f64,
    pub category_match: Option<bool>,
    pub color_delta_e: Option<f64>,
    pub pattern_match: Option<bool>,
    pub degraded: bool,
    pub notes: Vec<String>,
}

pub fn categories_similar(a: &str, b: &str) -> bool {
    let a = normalize_token(a);
    let b = normalize_token(b);
    if a == b {
        return true;
    }
    CATEGORY_GROUPS
        .iter()
        .any(|group| group.contains(&a.as_str()) && group.contains(&b.as_str()))
}

/// Parses a reviewer reply; a fenced or chatty reply gets one recovery pass.
/// A reply with no usable category, color or pattern yields `None`.
pub fn parse_observation(raw: &str) -> Option<SemanticObservation> {
    parse_observation_object(raw.trim()).or_else(|| parse_observation_object(strip_response_formatting(raw)))
}

fn parse_observation_object(text: &str) -> Option<SemanticObservation> {
    let value = serde_json::from_str::<Value>(text).ok()?;
    let object = value.as_object()?;
    let text_field = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let observation = SemanticObservation {
        category: text_field("category"),
        color_hex: text_field("color_hex").filter(|hex| is_valid_hex_color(hex)),
        pattern: text_field("pattern").and_then(|p| Pattern::parse_loose(p.as_str())),
    };
    if observation == SemanticObservation::default() {
        return None;
    }
    Some(observation)
}

/// Observation derived from the render's own features, used when no
/// reviewer is reachable. Category cannot be inferred from pixels.
pub fn heuristic_observation(features: &FeatureSet) -> SemanticObservation {
    let color_hex = features
        .dominant_colors
        .iter()
        .find(|hex| parse_hex_rgb(hex).is_some_and(|rgb| luma_601(rgb) < 0.94))
        .cloned();
    let pattern = match features.pattern_complexity {
        PatternComplexity::High => Pattern::Printed,
        PatternComplexity::Medium => Pattern::Textured,
        PatternComplexity::Low => Pattern::Solid,
    };
    SemanticObservation {
        category: None,
        color_hex,
        pattern: Some(pattern),
    }
}

/// Weighted agreement between the observation and the facts. Missing terms
/// are dropped and the remaining weights renormalized; with `degraded` the
/// category term is always dropped.
pub fn align(
    observation: &SemanticObservation,
    facts: &GarmentFacts,
    degraded: bool,
) -> SemanticAlignment {
    let mut notes = Vec::new();
    let mut weighted = 0.0;
    let mut total_weight = 0.0;

    let category_match = if degraded {
        notes.push(String::from(REVIEWER_UNAVAILABLE_NOTE));
        None
    } else {
        observation
            .category
            .as_deref()
            .map(|category| categories_similar(category, facts.category.as_str()))
    };
    if let Some(matched) = category_match {
        total_weight += CATEGORY_WEIGHT;
        if matched {
            weighted += CATEGORY_WEIGHT;
        } else {
            notes.push(format!(
                "category mismatch: observed {}",
                observation.category.as_deref().unwrap_or_default()
            ));
        }
    }

    let color_delta_e = observation
        .color_hex
        .as_deref()
        .and_then(parse_hex_rgb)
        .zip(parse_hex_rgb(facts.color.hex.as_str()))
        .map(|(observed, expected)| f64::from(delta_e(observed, expected)));
    if let Some(distance) = color_delta_e {
        total_weight += COLOR_WEIGHT;
        weighted += COLOR_WEIGHT * (1.0 - distance / COLOR_DELTA_E_SPAN).clamp(0.0, 1.0);
    }

    let pattern_match = observation.pattern.map(|p| p == facts.pattern);
    if let Some(matched) = pattern_match {
        total_weight += PATTERN_WEIGHT;
        if matched {
            weighted += PATTERN_WEIGHT;
        } else {
            notes.push(format!("pattern mismatch: expected {}", facts.pattern));
        }
    }

    let score = if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 1.0)
    } else {
        notes.push(String::from("no comparable attributes observed"));
        0.0
    };

    SemanticAlignment {
        score,
        category_match,
        color_delta_e,
        pattern_match,
        degraded,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::sample_facts;

    fn observation(category: &str, hex: &str, pattern: Pattern) -> SemanticObservation {
        SemanticObservation {
            category: Some(category.to_string()),
            color_hex: Some(hex.to_string()),
            pattern: Some(pattern),
        }
    }

    #[test]
    fn category_synonyms() {
        assert!(categories_similar("shirt", "button_up"));
        assert!(categories_similar("T-Shirt", "tee"));
        assert!(categories_similar("DRESS_SHIRT", "dress_shirt"));
        assert!(!categories_similar("dress_shirt", "pants"));
        assert!(!categories_similar("shirt", "jacket"));
    }

    #[test]
    fn matching_observation_aligns_fully() {
        let facts = sample_facts(Pattern::Solid, 0.2, 0.2);
        let result = align(&observation("button_up", "#1F3A5F", Pattern::Solid), &facts, false);
        assert!((result.score - 1.0).abs() < 1e-9);
        assert_eq!(result.category_match, Some(true));
        assert!(result.notes.is_empty());
    }

    #[test]
    fn mismatched_observation_aligns_poorly() {
        let facts = sample_facts(Pattern::Solid, 0.2, 0.2);
        let result = align(&observation("pants", "#FF0000", Pattern::Striped), &facts, false);
        assert!(result.score < 0.5, "score {}", result.score);
        assert_eq!(result.pattern_match, Some(false));
    }

    #[test]
    fn degraded_mode_ignores_category() {
        let facts = sample_facts(Pattern::Solid, 0.2, 0.2);
        let result = align(&observation("pants", "#1F3A5F", Pattern::Solid), &facts, true);
        assert!((result.score - 1.0).abs() < 1e-9);
        assert_eq!(result.category_match, None);
        assert!(result.notes.iter().any(|n| n == REVIEWER_UNAVAILABLE_NOTE));
    }

    #[test]
    fn fenced_reply_is_recovered() {
        let raw = "Here you go:\n```json\n{\"category\": \"shirt\", \"color_hex\": \"#1f3a5f\", \"pattern\": \"stripes\"}\n```";
        let parsed = parse_observation(raw).expect("recovered");
        assert_eq!(parsed.category.as_deref(), Some("shirt"));
        assert_eq!(parsed.pattern, Some(Pattern::Striped));
        assert_eq!(parsed.color_hex.as_deref(), Some("#1f3a5f"));
        assert!(parse_observation("not json at all").is_none());
    }

    #[test]
    fn replies_without_observations_are_rejected() {
        assert_eq!(parse_observation("{}"), None);
        assert_eq!(parse_observation(r#"{"error": "image unclear"}"#), None);
        assert_eq!(
            parse_observation(r#"{"color_hex": "navy", "pattern": "zigzag"}"#),
            None
        );
        let partial = parse_observation(r#"{"pattern": "solid"}"#).expect("pattern only");
        assert_eq!(partial.pattern, Some(Pattern::Solid));
    }

    #[test]
    fn heuristic_skips_near_white_backdrop() {
        let features = FeatureSet {
            dominant_colors: vec![String::from("#FFFFFF"), String::from("#1F3A5F")],
            pattern_complexity: PatternComplexity::Low,
            text_detected: false,
            text_boxes: Vec::new(),
            exposure: 0.8,
            contrast: 0.2,
        };
        let observed = heuristic_observation(&features);
        assert_eq!(observed.color_hex.as_deref(), Some("#1F3A5F"));
        assert_eq!(observed.pattern, Some(Pattern::Solid));
        assert_eq!(observed.category, None);
    }
}
