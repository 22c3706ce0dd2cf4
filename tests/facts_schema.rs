use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use pretty_assertions::assert_eq;
use serde_json::json;

use ghost_studio_core::facts::validation::{validate_facts_document, validate_facts_files};
use ghost_studio_core::facts::{FactsError, GarmentFacts, Pattern, RiskFlag, CURRENT_SCHEMA_VERSION};

fn temp_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ghost_studio_facts_schema_{stamp}"));
    fs::create_dir_all(&dir).expect("temp dir should be created");
    dir
}

fn facts_document() -> serde_json::Value {
    json!({
        "schema_version": "3.2",
        "category": "t_shirt",
        "fabric": "jersey knit",
        "pattern": "stripes",
        "color": {"hex": "#C8102E", "name": "red"},
        "transparency_level": 0.2,
        "complexity_score": 0.6,
        "risk_score": 0.45,
        "risk_flags": ["print", "sequins"],
        "pre_analysis": {
            "dominant_colors": ["#C8102E", "#FFFFFF"],
            "pattern_complexity": "medium",
            "exposure": 0.55,
            "contrast": 0.4
        },
        "segmentation": {
            "mask_quality_score": 0.91,
            "mask_weights": {"rmbg": 0.6, "u2net": 0.4}
        },
        "parts": [
            {"part_name": "neckline", "color_hex": "#C8102E", "seam_quality": 0.8, "sharpness_needed": 0.7}
        ],
        "future_field": {"nested": true}
    })
}

#[test]
fn unknown_fields_and_flags_are_tolerated() {
    let facts = GarmentFacts::from_json_str(&facts_document().to_string())
        .expect("forward-compatible facts should parse");
    assert_eq!(facts.pattern, Pattern::Striped);
    assert_eq!(facts.risk_flags, vec![RiskFlag::Print, RiskFlag::Other]);
    assert!(facts.has_textured_fabric());
    assert_eq!(facts.parts.len(), 1);
    assert!(!facts.parts[0].analyzed);
}

#[test]
fn structural_errors_are_rejected() {
    let mut document = facts_document();
    document["complexity_score"] = json!(1.4);
    let err = GarmentFacts::from_json_str(&document.to_string()).expect_err("out of range");
    assert!(matches!(err, FactsError::OutOfRange { ref field, .. } if field == "complexity_score"));

    let mut document = facts_document();
    document["color"]["hex"] = json!("red");
    let err = GarmentFacts::from_json_str(&document.to_string()).expect_err("bad hex");
    assert!(matches!(err, FactsError::InvalidHexColor { .. }));
}

#[test]
fn document_validation_collects_every_issue() {
    let clean = validate_facts_document(&facts_document(), CURRENT_SCHEMA_VERSION);
    assert!(clean.passed, "{clean:?}");
    assert!(clean.issues.is_empty());

    let mut document = facts_document();
    document["pre_analysis"]["exposure"] = json!(1.3);
    document["pre_analysis"]["pattern_complexity"] = json!("extreme");
    document["segmentation"]["mask_weights"] = json!({"rmbg": 0.7, "u2net": 0.7});
    let summary = validate_facts_document(&document, CURRENT_SCHEMA_VERSION);
    assert!(!summary.passed);
    assert_eq!(summary.issues.len(), 2, "{summary:?}");
    assert_eq!(summary.warnings.len(), 1, "{summary:?}");
}

#[test]
fn batch_validation_reports_each_file() {
    let dir = temp_dir();
    let good = dir.join("good.json");
    let old = dir.join("old.json");
    let broken = dir.join("broken.json");
    fs::write(&good, facts_document().to_string()).expect("write good");
    let mut outdated = facts_document();
    outdated["schema_version"] = json!("3.1");
    fs::write(&old, outdated.to_string()).expect("write old");
    fs::write(&broken, "{ not json").expect("write broken");

    let batch = validate_facts_files(
        &[good, old, broken, dir.join("missing.json")],
        CURRENT_SCHEMA_VERSION,
    );
    assert_eq!(batch.total_files, 4);
    assert_eq!(batch.valid_files, 1);
    assert_eq!(batch.invalid_files, 3);
    assert!((batch.pass_rate - 25.0).abs() < 1e-9);
    assert!(batch.results[1]
        .summary
        .as_ref()
        .is_some_and(|s| s.issues.iter().any(|i| i.contains("mismatch"))));
    assert!(batch.results[2].error.as_deref().is_some_and(|e| e.contains("invalid JSON")));
    assert!(batch.results[3].error.as_deref().is_some_and(|e| e.contains("failed to read")));

    let _ = fs::remove_dir_all(dir);
}
