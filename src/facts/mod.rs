pub mod part_response;
pub mod validation;

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CURRENT_SCHEMA_VERSION: &str = "3.2";
pub const SUPPORTED_SCHEMA_VERSIONS: [&str; 2] = ["3.1", "3.2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Solid,
    #[serde(alias = "stripes", alias = "stripe")]
    Striped,
    #[serde(alias = "print", alias = "graphic")]
    Printed,
    #[serde(alias = "texture")]
    Textured,
}

impl Pattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Solid => "solid",
            Self::Striped => "striped",
            Self::Printed => "printed",
            Self::Textured => "textured",
        }
    }

    pub fn is_solid(self) -> bool {
        matches!(self, Self::Solid)
    }

    /// Lenient parse used for untrusted analysis text.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "solid" | "plain" => Some(Self::Solid),
            "striped" | "stripes" | "stripe" => Some(Self::Striped),
            "printed" | "print" | "graphic" | "floral" => Some(Self::Printed),
            "textured" | "texture" | "knit" | "woven" => Some(Self::Textured),
            _ => None,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    #[serde(alias = "buttons")]
    Closures,
    Hardware,
    Print,
    Text,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorSpec {
    pub hex: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartFacts {
    pub part_name: String,
    pub color_hex: String,
    #[serde(default = "default_texture")]
    pub texture: String,
    #[serde(default = "default_pattern")]
    pub pattern: Pattern,
    #[serde(default = "default_condition")]
    pub condition: String,
    pub seam_quality: f64,
    pub sharpness_needed: f64,
    #[serde(default)]
    pub transparency: f64,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_method: Option<String>,
}

fn default_texture() -> String {
    String::from("woven")
}

fn default_pattern() -> Pattern {
    Pattern::Solid
}

fn default_condition() -> String {
    String::from("good")
}

fn default_schema_version() -> String {
    String::from(CURRENT_SCHEMA_VERSION)
}

/// Per-image garment description. Produced once by the analysis step and
/// never mutated afterwards; later schema versions only add fields, so any
/// field this struct does not know about is ignored on ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentFacts {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub category: String,
    #[serde(default)]
    pub fabric: String,
    pub pattern: Pattern,
    pub color: ColorSpec,
    pub transparency_level: f64,
    pub complexity_score: f64,
    pub risk_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PartFacts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interior_visibility: Option<VisibilityLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_flags: Vec<RiskFlag>,
}

#[derive(Debug, Error, PartialEq)]
pub enum FactsError {
    #[error("failed to read facts '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse facts JSON: {0}")]
    ParseJson(String),
    #[error("facts field '{field}' out of range [0, 1]: {value}")]
    OutOfRange { field: String, value: f64 },
    #[error("facts field '{field}' has invalid hex color: {value}")]
    InvalidHexColor { field: String, value: String },
    #[error("facts field '{field}' must not be empty")]
    EmptyField { field: String },
    #[error("duplicate part name '{0}'")]
    DuplicatePart(String),
}

impl GarmentFacts {
    pub fn from_json_str(raw: &str) -> Result<Self, FactsError> {
        let facts = serde_json::from_str::<Self>(raw)
            .map_err(|error| FactsError::ParseJson(error.to_string()))?;
        facts.validate()?;
        Ok(facts)
    }

    pub fn load(path: &Path) -> Result<Self, FactsError> {
        let raw = fs::read_to_string(path).map_err(|error| FactsError::ReadFile {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Self::from_json_str(raw.as_str())
    }

    pub fn validate(&self) -> Result<(), FactsError> {
        if self.category.trim().is_empty() {
            return Err(FactsError::EmptyField {
                field: String::from("category"),
            });
        }
        ensure_hex("color.hex", self.color.hex.as_str())?;
        ensure_unit("transparency_level", self.transparency_level)?;
        ensure_unit("complexity_score", self.complexity_score)?;
        ensure_unit("risk_score", self.risk_score)?;

        let mut seen = Vec::<&str>::with_capacity(self.parts.len());
        for (i, part) in self.parts.iter().enumerate() {
            if seen.contains(&part.part_name.as_str()) {
                return Err(FactsError::DuplicatePart(part.part_name.clone()));
            }
            seen.push(part.part_name.as_str());
            part.validate_at(i)?;
        }
        Ok(())
    }

    pub fn normalized_category(&self) -> String {
        normalize_token(self.category.as_str())
    }

    pub fn has_risk_flag(&self, flag: RiskFlag) -> bool {
        self.risk_flags.contains(&flag)
    }

    /// True when the fabric reads as textured even if the print itself is solid.
    pub fn has_textured_fabric(&self) -> bool {
        let fabric = self.fabric.to_ascii_lowercase();
        ["textured", "knit", "woven", "denim"]
            .iter()
            .any(|marker| fabric.contains(marker))
    }

    /// Short natural-language description used in generation prompts.
    pub fn describe(&self) -> String {
        let mut parts = Vec::<String>::new();
        let color = if self.color.name.trim().is_empty() {
            self.color.hex.clone()
        } else {
            self.color.name.trim().to_string()
        };
        parts.push(format!("{color} {}", self.category.trim().replace('_', " ")));
        if !self.fabric.trim().is_empty() {
            parts.push(format!("{} material", self.fabric.trim()));
        }
        if !self.pattern.is_solid() {
            parts.push(format!("{} pattern", self.pattern));
        }
        if self.transparency_level > 0.5 {
            parts.push(String::from("semi-transparent"));
        }
        parts.join(", ")
    }
}

impl PartFacts {
    fn validate_at(&self, index: usize) -> Result<(), FactsError> {
        if self.part_name.trim().is_empty() {
            return Err(FactsError::EmptyField {
                field: format!("parts[{index}].part_name"),
            });
        }
        ensure_hex(
            format!("parts[{index}].color_hex").as_str(),
            self.color_hex.as_str(),
        )?;
        ensure_unit(
            format!("parts[{index}].seam_quality").as_str(),
            self.seam_quality,
        )?;
        ensure_unit(
            format!("parts[{index}].sharpness_needed").as_str(),
            self.sharpness_needed,
        )?;
        ensure_unit(
            format!("parts[{index}].transparency").as_str(),
            self.transparency,
        )?;
        if let Some(confidence) = self.confidence {
            ensure_unit(format!("parts[{index}].confidence").as_str(), confidence)?;
        }
        Ok(())
    }
}

pub fn is_valid_hex_color(value: &str) -> bool {
    let Some(digits) = value.strip_prefix('#') else {
        return false;
    };
    digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

fn ensure_unit(field: &str, value: f64) -> Result<(), FactsError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        return Ok(());
    }
    Err(FactsError::OutOfRange {
        field: field.to_string(),
        value,
    })
}

fn ensure_hex(field: &str, value: &str) -> Result<(), FactsError> {
    if is_valid_hex_color(value) {
        return Ok(());
    }
    Err(FactsError::InvalidHexColor {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) fn sample_facts(pattern: Pattern, complexity: f64, risk: f64) -> GarmentFacts {
    GarmentFacts {
        schema_version: String::from(CURRENT_SCHEMA_VERSION),
        category: String::from("shirt"),
        fabric: String::from("cotton"),
        pattern,
        color: ColorSpec {
            hex: String::from("#1F3A5F"),
            name: String::from("navy"),
        },
        transparency_level: 0.1,
        complexity_score: complexity,
        risk_score: risk,
        parts: Vec::new(),
        interior_visibility: None,
        risk_flags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTS_JSON: &str = r##"{
        "schema_version": "3.2",
        "category": "shirt",
        "fabric": "cotton poplin",
        "pattern": "striped",
        "color": {"hex": "#1F3A5F", "name": "navy"},
        "transparency_level": 0.1,
        "complexity_score": 0.55,
        "risk_score": 0.4,
        "interior_visibility": "high",
        "risk_flags": ["closures"]
    }"##;

    #[test]
    fn parses_facts_document() {
        let facts = GarmentFacts::from_json_str(FACTS_JSON).expect("facts should parse");
        assert_eq!(facts.pattern, Pattern::Striped);
        assert_eq!(facts.interior_visibility, Some(VisibilityLevel::High));
        assert!(facts.has_risk_flag(RiskFlag::Closures));
        assert!(facts.parts.is_empty());
    }

    #[test]
    fn ignores_unknown_additive_fields() {
        let mut value: serde_json::Value =
            serde_json::from_str(FACTS_JSON).expect("fixture is valid JSON");
        value["schema_version"] = serde_json::json!("3.9");
        value["lighting_rig"] = serde_json::json!({"key": "softbox"});
        value["color"]["pantone"] = serde_json::json!("19-4052");
        value["risk_flags"] = serde_json::json!(["closures", "sequins"]);

        let facts = GarmentFacts::from_json_str(value.to_string().as_str())
            .expect("unknown fields should be ignored");
        assert_eq!(facts.schema_version, "3.9");
        assert_eq!(facts.risk_flags, vec![RiskFlag::Closures, RiskFlag::Other]);
    }

    #[test]
    fn rejects_scores_outside_unit_interval() {
        let raw = FACTS_JSON.replace("\"risk_score\": 0.4", "\"risk_score\": 1.4");
        let err = GarmentFacts::from_json_str(raw.as_str()).expect_err("risk 1.4 must fail");
        assert_eq!(
            err,
            FactsError::OutOfRange {
                field: String::from("risk_score"),
                value: 1.4
            }
        );
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let raw = FACTS_JSON.replace("\"category\": \"shirt\",", "");
        let err = GarmentFacts::from_json_str(raw.as_str()).expect_err("category is required");
        assert!(matches!(err, FactsError::ParseJson(message) if message.contains("category")));
    }

    #[test]
    fn rejects_duplicate_part_names() {
        let mut facts = sample_facts(Pattern::Solid, 0.2, 0.2);
        let part = part_response::fallback_part_facts("collar", None);
        facts.parts = vec![part.clone(), part];
        assert_eq!(
            facts.validate(),
            Err(FactsError::DuplicatePart(String::from("collar")))
        );
    }

    #[test]
    fn hex_color_validation() {
        assert!(is_valid_hex_color("#a1B2c3"));
        assert!(!is_valid_hex_color("a1b2c3"));
        assert!(!is_valid_hex_color("#12345"));
        assert!(!is_valid_hex_color("#12345G"));
    }

    #[test]
    fn pattern_aliases_deserialize() {
        let pattern: Pattern = serde_json::from_str("\"stripes\"").expect("alias");
        assert_eq!(pattern, Pattern::Striped);
        assert_eq!(Pattern::parse_loose(" Print "), Some(Pattern::Printed));
        assert_eq!(Pattern::parse_loose("paisley"), None);
    }

    #[test]
    fn textured_fabric_detection_and_description() {
        let mut facts = sample_facts(Pattern::Striped, 0.5, 0.3);
        facts.fabric = String::from("Cotton Knit");
        assert!(facts.has_textured_fabric());
        assert_eq!(
            facts.describe(),
            "navy shirt, Cotton Knit material, striped pattern"
        );
    }
}
