use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{Rgb, RgbImage};
use pretty_assertions::assert_eq;
use serde_json::Value;

use ghost_studio_core::collaborators::{
    CollaboratorError, Collaborators, DetectedPart, GenerationBackend, GenerationRequest,
    LocalMetrics, PartAnalysisCollaborator, PartAnalysisRequest, SegmentationCollaborator,
    SemanticReviewer,
};
use ghost_studio_core::facts::GarmentFacts;
use ghost_studio_core::fusion::SoftMask;
use ghost_studio_core::imaging::GrayField;
use ghost_studio_core::orchestrator::report::{AnalysisMethod, FailureMarker, FinalStatus};
use ghost_studio_core::orchestrator::{ImageJob, Orchestrator};
use ghost_studio_core::settings::{resolve_studio_settings, StudioSettingsOverlay};
use ghost_studio_core::worker::{run_batch, run_batch_and_persist, JobState};

const SIZE: u32 = 64;

const SHIRT_FACTS: &str = r##"{
    "schema_version": "3.2",
    "category": "dress_shirt",
    "fabric": "cotton poplin",
    "pattern": "solid",
    "color": {"hex": "#1F3A5F", "name": "navy"},
    "transparency_level": 0.05,
    "complexity_score": 0.25,
    "risk_score": 0.2,
    "interior_visibility": "high",
    "risk_flags": ["closures"],
    "photographer_notes": "ignored by the pipeline"
}"##;

fn temp_root(label: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    std::env::temp_dir().join(format!("ghost_studio_{label}_{stamp}"))
}

fn inside(x: u32, y: u32) -> bool {
    (16..48).contains(&x) && (16..48).contains(&y)
}

fn shirt_image() -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        if inside(x, y) {
            Rgb([0x1F, 0x3A, 0x5F])
        } else {
            Rgb([255, 255, 255])
        }
    })
}

struct BoxSegmentation {
    empty: bool,
}

impl SegmentationCollaborator for BoxSegmentation {
    fn garment_masks(&self, _image: &RgbImage) -> Result<Vec<SoftMask>, CollaboratorError> {
        let value = if self.empty { 0.0 } else { 0.9 };
        let field = GrayField::from_fn(SIZE, SIZE, |x, y| if inside(x, y) { value } else { 0.0 });
        Ok(vec![
            SoftMask::new("rmbg", field.clone()),
            SoftMask::new("u2net", field),
        ])
    }

    fn human_mask(&self, _image: &RgbImage) -> Result<SoftMask, CollaboratorError> {
        Ok(SoftMask::new("human-subtract", GrayField::filled(SIZE, SIZE, 0.0)))
    }

    fn detect_parts(
        &self,
        _image: &RgbImage,
        part_names: &[String],
    ) -> Result<Vec<DetectedPart>, CollaboratorError> {
        Ok(part_names
            .iter()
            .map(|name| DetectedPart {
                part_name: name.clone(),
                confidence: 0.8,
                bbox: Some([16, 16, 32, 32]),
            })
            .collect())
    }
}

struct CountingAnalysis {
    calls: AtomicUsize,
}

impl PartAnalysisCollaborator for CountingAnalysis {
    fn analyze_part(&self, request: &PartAnalysisRequest) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.crop.dimensions(), (32, 32));
        Ok(String::from(
            r##"{"color_hex": "#1F3A5F", "texture": "woven", "pattern": "solid", "condition": "clean", "seam_quality": 0.9, "sharpness_needed": 0.8, "transparency": 0.0, "confidence": 0.9}"##,
        ))
    }
}

struct EchoGeneration;

impl GenerationBackend for EchoGeneration {
    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage, CollaboratorError> {
        assert!(request.prompt.contains("=== GHOST MANNEQUIN SPECIFICATION ==="));
        Ok(request.source.as_ref().clone())
    }
}

struct AgreeingReviewer;

impl SemanticReviewer for AgreeingReviewer {
    fn review(&self, _rendered: &RgbImage) -> Result<String, CollaboratorError> {
        Ok(String::from(
            "Sure! ```json\n{\"category\": \"button_up\", \"color_hex\": \"#203A60\", \"pattern\": \"solid\"}\n```",
        ))
    }
}

fn orchestrator(root: &Path, analysis: Arc<CountingAnalysis>, empty_masks: bool) -> Orchestrator {
    let settings = resolve_studio_settings(&StudioSettingsOverlay {
        output_dir: Some(root.display().to_string()),
        concurrency: Some(2),
        ..StudioSettingsOverlay::default()
    })
    .expect("settings should resolve");
    Orchestrator::new(
        &settings,
        Collaborators {
            segmentation: Arc::new(BoxSegmentation { empty: empty_masks }),
            part_analysis: analysis,
            generation: Arc::new(EchoGeneration),
            semantic: Some(Arc::new(AgreeingReviewer)),
            metrics: Arc::new(LocalMetrics::default()),
        },
    )
}

fn job(id: &str) -> ImageJob {
    let facts = GarmentFacts::from_json_str(SHIRT_FACTS).expect("facts should parse");
    ImageJob::new(id, shirt_image(), facts)
}

#[tokio::test]
async fn single_image_run_is_fully_reported() {
    let root = temp_root("single");
    let analysis = Arc::new(CountingAnalysis {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(&root, Arc::clone(&analysis), false);

    let report = orchestrator.process_image(job("navy_shirt")).await;

    assert_eq!(report.final_status, FinalStatus::Accepted);
    assert_eq!(report.analysis_method, Some(AnalysisMethod::PerPart));
    assert_eq!(
        report.planned_parts,
        vec!["collar", "inner_collar", "placket", "sleeve", "cuff", "body", "hem"]
    );
    assert_eq!(analysis.calls.load(Ordering::SeqCst), report.planned_parts.len());
    assert!(report.part_facts.iter().all(|part| part.analyzed));
    assert_eq!(report.source_fingerprint.len(), 64);
    assert!(report.finished_at.is_some());

    let attempt = &report.attempts[0];
    assert_eq!(attempt.semantic.category_match, Some(true));
    assert!(attempt.qa.passed);

    let path = root.join("runs").join(format!("{}.json", report.run_id));
    let raw = std::fs::read_to_string(&path).expect("run report should be written");
    let value: Value = serde_json::from_str(&raw).expect("run report should be JSON");
    assert_eq!(value["final_status"], "accepted");
    assert_eq!(value["attempts"][0]["state"], "ACCEPTED");
    let rmbg_weight = value["mask_quality"]["mask_weights"]["rmbg"]
        .as_f64()
        .expect("rmbg weight should be recorded");
    assert!((rmbg_weight - 0.6).abs() < 1e-6);
    assert_eq!(value["collaborator_calls"][0]["outcome"]["status"], "success");

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn batch_keeps_input_order_and_counts_outcomes() {
    let root = temp_root("batch");
    let good = Arc::new(orchestrator(
        &root,
        Arc::new(CountingAnalysis {
            calls: AtomicUsize::new(0),
        }),
        false,
    ));

    let report = run_batch(
        Arc::clone(&good),
        vec![job("first"), job("second"), job("third")],
    )
    .await;

    let ids = report
        .images
        .iter()
        .map(|image| image.image_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["first", "second", "third"]);
    assert_eq!(report.total, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.accepted, 3);
    assert!((report.metrics.pass_rate - 100.0).abs() < 1e-9);
    let qa = report.metrics.qa_total.expect("qa statistics");
    assert_eq!(qa.count, 3);
    assert!(qa.min <= qa.median && qa.median <= qa.max);
    assert!(report
        .images
        .iter()
        .all(|image| image.state == JobState::Completed && image.attempts == 1));

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn failed_images_do_not_stop_the_batch() {
    let root = temp_root("batch_failed");
    let degenerate = Arc::new(orchestrator(
        &root,
        Arc::new(CountingAnalysis {
            calls: AtomicUsize::new(0),
        }),
        true,
    ));

    let (report, path) = run_batch_and_persist(degenerate, vec![job("blank_a"), job("blank_b")])
        .await
        .expect("batch report should be written");

    assert_eq!(report.failed, 2);
    assert_eq!(report.completed, 0);
    assert_eq!(report.metrics.pass_rate, 0.0);
    assert_eq!(report.metrics.qa_total, None);
    assert_eq!(report.metrics.mask_quality_score.map(|s| s.count), Some(2));
    assert!(report
        .images
        .iter()
        .all(|image| image.failure_marker == Some(FailureMarker::DegenerateInput)));
    assert!(path.is_file());

    let _ = std::fs::remove_dir_all(root);
}
