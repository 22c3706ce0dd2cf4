//! Handling for the per-part analysis collaborator: prompt text going out,
//! untrusted JSON-ish text coming back, and the heuristic placeholders used
//! when a part could not be analyzed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{is_valid_hex_color, Pattern, PartFacts};
use crate::features::{FeatureSet, PatternComplexity};

pub const FALLBACK_ANALYSIS_METHOD: &str = "fallback";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseRecovery {
    Direct,
    StrippedFormatting,
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedPartResponse {
    pub facts: PartFacts,
    pub recovery: ResponseRecovery,
}

#[derive(Debug, Default, Deserialize)]
struct RawPartResponse {
    color_hex: Option<String>,
    texture: Option<String>,
    pattern: Option<String>,
    condition: Option<String>,
    seam_quality: Option<f64>,
    sharpness_needed: Option<f64>,
    transparency: Option<f64>,
    confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartSummary {
    pub dominant_color: String,
    pub pattern: Pattern,
    pub transparency: f64,
    pub complexity_score: f64,
    pub risk_score: f64,
    pub suggest_auxiliary_conditioning: bool,
    pub analyzed_parts: usize,
    pub fallback_parts: usize,
}

pub fn build_part_analysis_prompt(
    part_name: &str,
    garment_category: &str,
    features: Option<&FeatureSet>,
) -> String {
    let mut lines = vec![format!(
        "Analyze this {part_name} from a {}.",
        garment_category.replace('_', " ")
    )];
    if let Some(features) = features {
        lines.push(String::new());
        lines.push(String::from("Pre-analysis context:"));
        lines.push(format!(
            "- Dominant colors detected: {}",
            features.dominant_colors.join(", ")
        ));
        lines.push(format!(
            "- Pattern complexity: {}",
            features.pattern_complexity.as_str()
        ));
        lines.push(format!("- Text present: {}", features.text_detected));
        lines.push(format!("- Exposure level: {:.2}", features.exposure));
        lines.push(format!("- Contrast level: {:.2}", features.contrast));
    }
    lines.push(String::new());
    lines.push(String::from("Identify (JSON only):"));
    lines.push(String::from(
        r##"{"color_hex": "#RRGGBB", "texture": "smooth|ribbed|woven|knit", "pattern": "solid|striped|printed|textured", "condition": "clean|wrinkled|stained", "seam_quality": 0.0-1.0, "sharpness_needed": 0.0-1.0, "transparency": 0.0-1.0, "confidence": 0.0-1.0}"##,
    ));
    lines.join("\n")
}

/// Parses one analysis response. A first strict parse is attempted, then a
/// single retry with markdown fences and surrounding prose removed; anything
/// still unparseable, or an object carrying no usable part field, becomes a
/// heuristic placeholder with `analyzed=false`.
pub fn parse_part_response(
    part_name: &str,
    raw: &str,
    features: Option<&FeatureSet>,
) -> ParsedPartResponse {
    let mut without_fields = false;
    let candidates = [
        (raw.trim(), ResponseRecovery::Direct),
        (strip_response_formatting(raw), ResponseRecovery::StrippedFormatting),
    ];
    for (text, recovery) in candidates {
        let Some(parsed) = parse_raw_object(text) else {
            continue;
        };
        if !parsed.has_part_fields() {
            without_fields = true;
            continue;
        }
        return ParsedPartResponse {
            facts: part_facts_from_raw(part_name, parsed, features),
            recovery,
        };
    }
    let reason = if without_fields {
        "no part fields in response"
    } else {
        "unparseable analysis response"
    };
    ParsedPartResponse {
        facts: fallback_part_facts(part_name, features),
        recovery: ResponseRecovery::Fallback {
            reason: String::from(reason),
        },
    }
}

pub fn strip_response_formatting(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

impl RawPartResponse {
    /// True when at least one field would survive into `PartFacts`.
    fn has_part_fields(&self) -> bool {
        let text = |v: &Option<String>| v.as_deref().is_some_and(|v| !v.trim().is_empty());
        let unit = |v: Option<f64>| v.is_some_and(f64::is_finite);
        self.color_hex
            .as_deref()
            .map(normalize_hex)
            .is_some_and(|hex| is_valid_hex_color(&hex))
            || self.pattern.as_deref().and_then(Pattern::parse_loose).is_some()
            || text(&self.texture)
            || text(&self.condition)
            || unit(self.seam_quality)
            || unit(self.sharpness_needed)
            || unit(self.transparency)
    }
}

fn normalize_hex(raw: &str) -> String {
    let hex = raw.trim().to_ascii_uppercase();
    if hex.starts_with('#') {
        hex
    } else {
        format!("#{hex}")
    }
}

fn parse_raw_object(text: &str) -> Option<RawPartResponse> {
    let value = serde_json::from_str::<Value>(text).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value::<RawPartResponse>(value).ok()
}

fn part_facts_from_raw(
    part_name: &str,
    raw: RawPartResponse,
    features: Option<&FeatureSet>,
) -> PartFacts {
    let fallback = fallback_part_facts(part_name, features);
    let color_hex = raw
        .color_hex
        .as_deref()
        .map(normalize_hex)
        .filter(|v| is_valid_hex_color(v))
        .unwrap_or(fallback.color_hex);
    PartFacts {
        part_name: part_name.to_string(),
        color_hex,
        texture: raw
            .texture
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback.texture),
        pattern: raw
            .pattern
            .as_deref()
            .and_then(Pattern::parse_loose)
            .unwrap_or(fallback.pattern),
        condition: raw
            .condition
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback.condition),
        seam_quality: unit_or(raw.seam_quality, fallback.seam_quality),
        sharpness_needed: unit_or(raw.sharpness_needed, fallback.sharpness_needed),
        transparency: unit_or(raw.transparency, fallback.transparency),
        analyzed: true,
        confidence: raw.confidence.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 1.0)),
        analysis_method: Some(String::from("llm")),
    }
}

fn unit_or(value: Option<f64>, default: f64) -> f64 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(default)
}

pub fn fallback_part_facts(part_name: &str, features: Option<&FeatureSet>) -> PartFacts {
    let (seam_quality, sharpness_needed, texture) = match part_name {
        "collar" | "inner_collar" => (0.8, 0.9, "smooth"),
        "sleeve" | "cuff" => (0.7, 0.8, "woven"),
        "body" => (0.8, 0.7, "woven"),
        "pocket" => (0.9, 0.8, "woven"),
        _ => (0.8, 0.8, "woven"),
    };
    let mut facts = PartFacts {
        part_name: part_name.to_string(),
        color_hex: String::from("#FFFFFF"),
        texture: texture.to_string(),
        pattern: Pattern::Solid,
        condition: String::from("unknown"),
        seam_quality,
        sharpness_needed,
        transparency: 0.0,
        analyzed: false,
        confidence: None,
        analysis_method: Some(String::from(FALLBACK_ANALYSIS_METHOD)),
    };
    let Some(features) = features else {
        return facts;
    };

    if let Some(color) = features.dominant_colors.first() {
        facts.color_hex = color.clone();
    }
    facts.pattern = match features.pattern_complexity {
        PatternComplexity::High => Pattern::Printed,
        PatternComplexity::Medium | PatternComplexity::Low => Pattern::Solid,
    };
    if features.exposure < 0.3 {
        facts.condition = String::from("dark");
        facts.sharpness_needed = 0.9;
    } else if features.exposure > 0.7 {
        facts.condition = String::from("bright");
        facts.transparency = 0.2;
    }
    facts
}

fn pattern_factor(pattern: Pattern) -> f64 {
    match pattern {
        Pattern::Printed => 0.8,
        Pattern::Striped => 0.6,
        Pattern::Textured => 0.4,
        Pattern::Solid => 0.2,
    }
}

fn pattern_priority(pattern: Pattern) -> u8 {
    match pattern {
        Pattern::Printed => 3,
        Pattern::Striped => 2,
        Pattern::Textured => 1,
        Pattern::Solid => 0,
    }
}

/// Garment-level roll-up of analyzed parts. Placeholder parts are counted
/// but never contribute evidence.
pub fn summarize_parts(parts: &[PartFacts]) -> PartSummary {
    let analyzed = parts.iter().filter(|p| p.analyzed).collect::<Vec<_>>();
    let fallback_parts = parts.len() - analyzed.len();
    if analyzed.is_empty() {
        return PartSummary {
            dominant_color: String::from("#FFFFFF"),
            pattern: Pattern::Solid,
            transparency: 0.0,
            complexity_score: 0.0,
            risk_score: 0.5,
            suggest_auxiliary_conditioning: false,
            analyzed_parts: 0,
            fallback_parts,
        };
    }

    let mut color_counts = BTreeMap::<&str, usize>::new();
    for part in &analyzed {
        *color_counts.entry(part.color_hex.as_str()).or_default() += 1;
    }
    // Ties resolve to the lexicographically smallest hex for reproducibility.
    let dominant_color = color_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(hex, _)| hex.to_string())
        .unwrap_or_else(|| String::from("#FFFFFF"));

    let pattern = analyzed
        .iter()
        .map(|p| p.pattern)
        .max_by_key(|p| pattern_priority(*p))
        .unwrap_or(Pattern::Solid);
    let transparency = analyzed
        .iter()
        .map(|p| p.transparency)
        .fold(0.0_f64, f64::max);

    let complexity_factors = analyzed
        .iter()
        .flat_map(|p| [pattern_factor(p.pattern), 1.0 - p.seam_quality])
        .collect::<Vec<_>>();
    let risk_factors = analyzed
        .iter()
        .flat_map(|p| [pattern_factor(p.pattern), p.transparency, 1.0 - p.seam_quality])
        .collect::<Vec<_>>();

    PartSummary {
        dominant_color,
        pattern,
        transparency,
        complexity_score: mean(&complexity_factors).min(1.0),
        risk_score: mean(&risk_factors).min(1.0),
        suggest_auxiliary_conditioning: analyzed.iter().any(|p| !p.pattern.is_solid()),
        analyzed_parts: analyzed.len(),
        fallback_parts,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
