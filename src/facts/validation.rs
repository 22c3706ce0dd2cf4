//! Document-level checks over raw facts JSON. Unlike `GarmentFacts::validate`
//! these never stop at the first problem: every issue in the document is
//! reported, and soft inconsistencies are collected as warnings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use super::{is_valid_hex_color, SUPPORTED_SCHEMA_VERSIONS};

const WEIGHT_SUM_TOLERANCE: f64 = 0.01;
const PART_SCORE_FIELDS: [&str; 4] = ["seam_quality", "sharpness_needed", "transparency", "confidence"];
const PATTERN_COMPLEXITIES: [&str; 3] = ["low", "medium", "high"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileValidation {
    pub file_path: PathBuf,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ValidationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchValidation {
    pub schema_version: String,
    pub total_files: usize,
    pub valid_files: usize,
    pub invalid_files: usize,
    pub pass_rate: f64,
    pub results: Vec<FileValidation>,
}

pub fn validate_facts_document(document: &Value, schema_version: &str) -> ValidationSummary {
    let mut summary = ValidationSummary::default();
    let Some(root) = document.as_object() else {
        summary.issues.push(String::from("facts document must be a JSON object"));
        return summary;
    };

    if !SUPPORTED_SCHEMA_VERSIONS.contains(&schema_version) {
        summary
            .issues
            .push(format!("unsupported schema version {schema_version}"));
    }
    if let Some(declared) = root.get("schema_version") {
        if declared.as_str() != Some(schema_version) {
            summary.issues.push(format!(
                "schema version mismatch: expected {schema_version}, got {declared}"
            ));
        }
    }

    if let Some(color) = root.get("color").and_then(|c| c.get("hex")) {
        check_hex(&mut summary, "color.hex", color);
    }

    if let Some(pre) = root.get("pre_analysis").and_then(Value::as_object) {
        if let Some(colors) = pre.get("dominant_colors").and_then(Value::as_array) {
            for (index, color) in colors.iter().enumerate() {
                check_hex(
                    &mut summary,
                    format!("pre_analysis.dominant_colors[{index}]").as_str(),
                    color,
                );
            }
        }
        if let Some(complexity) = pre.get("pattern_complexity") {
            let known = complexity
                .as_str()
                .is_some_and(|c| PATTERN_COMPLEXITIES.contains(&c));
            if !known {
                summary
                    .issues
                    .push(format!("invalid pattern complexity: {complexity}"));
            }
        }
        check_unit(&mut summary, pre, "pre_analysis", "exposure");
        check_unit(&mut summary, pre, "pre_analysis", "contrast");
    }

    if let Some(segmentation) = root.get("segmentation").and_then(Value::as_object) {
        check_unit(&mut summary, segmentation, "segmentation", "mask_quality_score");
        check_weight_sum(&mut summary, segmentation, "segmentation.mask_weights", "mask_weights");
    }

    if let Some(qa) = root.get("qa_metrics").and_then(Value::as_object) {
        check_unit(&mut summary, qa, "qa_metrics", "qa_total");
        check_weight_sum(&mut summary, qa, "qa_metrics.weights", "weights");
    }

    let parts = root
        .get("parts")
        .or_else(|| root.get("garment").and_then(|g| g.get("parts")))
        .and_then(Value::as_array);
    for (index, part) in parts.into_iter().flatten().enumerate() {
        let Some(part) = part.as_object() else {
            summary.issues.push(format!("part {index} is not an object"));
            continue;
        };
        if let Some(color) = part.get("color_hex") {
            check_hex(&mut summary, format!("parts[{index}].color_hex").as_str(), color);
        }
        for field in PART_SCORE_FIELDS {
            check_unit(&mut summary, part, format!("parts[{index}]").as_str(), field);
        }
    }

    summary.passed = summary.issues.is_empty();
    summary
}

pub fn validate_facts_file(path: &Path, schema_version: &str) -> FileValidation {
    let parsed = fs::read_to_string(path)
        .map_err(|err| format!("failed to read file: {err}"))
        .and_then(|raw| {
            serde_json::from_str::<Value>(raw.as_str()).map_err(|err| format!("invalid JSON: {err}"))
        });
    match parsed {
        Ok(document) => {
            let summary = validate_facts_document(&document, schema_version);
            FileValidation {
                file_path: path.to_path_buf(),
                valid: summary.passed,
                error: None,
                summary: Some(summary),
            }
        }
        Err(error) => FileValidation {
            file_path: path.to_path_buf(),
            valid: false,
            error: Some(error),
            summary: None,
        },
    }
}

pub fn validate_facts_files(paths: &[PathBuf], schema_version: &str) -> BatchValidation {
    let results = paths
        .iter()
        .map(|path| validate_facts_file(path, schema_version))
        .collect::<Vec<_>>();
    let valid_files = results.iter().filter(|r| r.valid).count();
    let total_files = results.len();
    let pass_rate = if total_files == 0 {
        0.0
    } else {
        valid_files as f64 / total_files as f64 * 100.0
    };
    BatchValidation {
        schema_version: schema_version.to_string(),
        total_files,
        valid_files,
        invalid_files: total_files - valid_files,
        pass_rate,
        results,
    }
}

fn check_hex(summary: &mut ValidationSummary, field: &str, value: &Value) {
    if value.as_str().is_some_and(is_valid_hex_color) {
        return;
    }
    summary
        .issues
        .push(format!("{field} has invalid hex color: {value}"));
}

fn check_unit(summary: &mut ValidationSummary, object: &Map<String, Value>, scope: &str, key: &str) {
    let Some(value) = object.get(key) else {
        return;
    };
    match value.as_f64() {
        Some(number) if (0.0..=1.0).contains(&number) => {}
        _ => summary
            .issues
            .push(format!("{scope}.{key} out of range [0.0, 1.0]: {value}")),
    }
}

fn check_weight_sum(
    summary: &mut ValidationSummary,
    object: &Map<String, Value>,
    field: &str,
    key: &str,
) {
    let Some(weights) = object.get(key).and_then(Value::as_object) else {
        return;
    };
    let sum = weights.values().filter_map(Value::as_f64).sum::<f64>();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        summary
            .warnings
            .push(format!("{field} do not sum to 1.0: {sum}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn valid_document() -> Value {
        json!({
            "schema_version": "3.2",
            "category": "shirt",
            "color": {"hex": "#1F3A5F", "name": "navy"},
            "pre_analysis": {
                "dominant_colors": ["#1F3A5F", "#FFFFFF"],
                "pattern_complexity": "low",
                "exposure": 0.55,
                "contrast": 0.3
            },
            "segmentation": {
                "mask_quality_score": 0.91,
                "mask_weights": {"rmbg": 0.6, "u2net": 0.4}
            },
            "qa_metrics": {
                "qa_total": 0.88,
                "weights": {"edge": 0.4, "background": 0.3, "color": 0.2, "semantic": 0.1}
            },
            "parts": [
                {"part_name": "collar", "color_hex": "#1F3A5F", "seam_quality": 0.8, "confidence": 0.9}
            ]
        })
    }

    fn temp_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("ghost_studio_{label}_{stamp}"));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn clean_document_passes() {
        let summary = validate_facts_document(&valid_document(), "3.2");
        assert!(summary.passed, "{summary:?}");
        assert!(summary.warnings.is_empty());
    }

    #[test]
    fn every_problem_is_collected() {
        let mut doc = valid_document();
        doc["schema_version"] = json!("3.1");
        doc["pre_analysis"]["dominant_colors"] = json!(["#12345", "#ABCDEF"]);
        doc["pre_analysis"]["pattern_complexity"] = json!("extreme");
        doc["pre_analysis"]["exposure"] = json!(1.4);
        doc["parts"][0]["seam_quality"] = json!(-0.1);
        doc["parts"][0]["color_hex"] = json!("navy");
        let summary = validate_facts_document(&doc, "3.2");
        assert!(!summary.passed);
        assert_eq!(summary.issues.len(), 6, "{:?}", summary.issues);
    }

    #[test]
    fn weight_sums_are_warnings() {
        let mut doc = valid_document();
        doc["segmentation"]["mask_weights"] = json!({"rmbg": 0.7, "u2net": 0.4});
        doc["qa_metrics"]["weights"] = json!({"edge": 0.4, "background": 0.3, "color": 0.2, "semantic": 0.105});
        let summary = validate_facts_document(&doc, "3.2");
        assert!(summary.passed);
        assert_eq!(summary.warnings.len(), 1, "{:?}", summary.warnings);
    }

    #[test]
    fn unsupported_version_is_an_issue() {
        let summary = validate_facts_document(&json!({"schema_version": "2.0"}), "2.0");
        assert!(!summary.passed);
        assert!(summary.issues[0].contains("unsupported"));
    }

    #[test]
    fn batch_reports_unreadable_files_without_aborting() {
        let dir = temp_dir("facts_batch");
        let good = dir.join("good.json");
        let broken = dir.join("broken.json");
        let invalid = dir.join("invalid.json");
        fs::write(&good, valid_document().to_string()).expect("write good");
        fs::write(&broken, "{ not json").expect("write broken");
        let mut bad = valid_document();
        bad["qa_metrics"]["qa_total"] = json!(3.0);
        fs::write(&invalid, bad.to_string()).expect("write invalid");

        let batch = validate_facts_files(
            &[good, broken, invalid, dir.join("missing.json")],
            "3.2",
        );
        assert_eq!(batch.total_files, 4);
        assert_eq!(batch.valid_files, 1);
        assert_eq!(batch.invalid_files, 3);
        assert!((batch.pass_rate - 25.0).abs() < 1e-9);
        assert!(batch.results[1].error.as_deref().is_some_and(|e| e.starts_with("invalid JSON")));
        assert!(batch.results[3].error.as_deref().is_some_and(|e| e.starts_with("failed to read")));

        let _ = fs::remove_dir_all(&dir);
    }
}
