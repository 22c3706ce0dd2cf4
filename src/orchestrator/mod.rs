//! Per-image pipeline: features, mask fusion, part planning and analysis,
//! then the bounded render/score loop. Every run ends in a persisted
//! [`ImageRunReport`], including runs that fail.

pub mod report;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops;
use image::RgbImage;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::collaborators::{
    CallOutcome, CollaboratorError, Collaborators, GenerationRequest, PartAnalysisRequest,
    Priority,
};
use crate::facts::part_response::{
    build_part_analysis_prompt, fallback_part_facts, parse_part_response, summarize_parts,
    ResponseRecovery,
};
use crate::facts::{FactsError, GarmentFacts, PartFacts};
use crate::features::{FeatureError, FeatureExtractor, FeatureSet};
use crate::fusion::{FusedMask, FusionError, MaskFusionEngine};
use crate::imaging::GrayField;
use crate::planner::PartPlanner;
use crate::prompt::{build_generation_prompt, PromptInputs};
use crate::routing::{Backend, PriorAttempt, RoutingDecision, RoutingPolicy};
use crate::runlog::{
    artifact_path, image_fingerprint, mask_path, new_run_id, run_report_path, timestamp_now,
    write_mask_png, write_png, write_pretty_json_with_newline, RunLogError,
};
use crate::scoring::metrics::MetricReadings;
use crate::scoring::semantic::{align, heuristic_observation, parse_observation, SemanticAlignment};
use crate::scoring::{QaError, QaSignals, QaState, QualityScorer};
use crate::settings::StudioSettings;

use report::{AnalysisMethod, AttemptRecord, FailureMarker, FinalStatus, ImageRunReport};

const GARMENT_MASKS: &str = "segmentation.garment_masks";
const HUMAN_MASK: &str = "segmentation.human_mask";
const DETECT_PARTS: &str = "segmentation.detect_parts";
const PART_ANALYSIS: &str = "part_analysis";
const GENERATION: &str = "generation";
const METRICS: &str = "metrics";
const SEMANTIC_REVIEW: &str = "semantic_review";

/// Detections below this confidence do not count toward per-part analysis.
const MIN_PART_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    pub image_timeout_secs: u64,
    pub collaborator_timeout_secs: u64,
    pub min_parts_detected: usize,
    pub output_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            image_timeout_secs: 300,
            collaborator_timeout_secs: 60,
            min_parts_detected: 2,
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid garment facts: {0}")]
    Facts(#[from] FactsError),
    #[error("feature extraction failed: {0}")]
    Features(#[from] FeatureError),
    #[error("mask fusion failed: {0}")]
    Fusion(#[from] FusionError),
    #[error("quality scoring failed: {0}")]
    Qa(#[from] QaError),
    #[error(transparent)]
    RunLog(#[from] RunLogError),
    #[error("critical collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("image processing exceeded {seconds}s")]
    Timeout { seconds: u64 },
    #[error("render loop ended without a terminal QA state")]
    RetryLoopExhausted,
}

impl OrchestratorError {
    pub fn marker(&self) -> FailureMarker {
        match self {
            Self::Facts(_) => FailureMarker::InvalidFacts,
            Self::Features(FeatureError::EmptyImage) => FailureMarker::DegenerateInput,
            Self::Fusion(FusionError::DegenerateMask { .. } | FusionError::NoMasks) => {
                FailureMarker::DegenerateInput
            }
            // Masks that do not match the source came from a broken collaborator.
            Self::Fusion(FusionError::Imaging(_)) | Self::Collaborator(_) => {
                FailureMarker::CollaboratorFatal
            }
            Self::Timeout { .. } => FailureMarker::Timeout,
            Self::Features(_)
            | Self::Fusion(_)
            | Self::Qa(_)
            | Self::RunLog(_)
            | Self::RetryLoopExhausted => FailureMarker::Internal,
        }
    }
}

/// One source image and its pre-analyzed facts.
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub image_id: String,
    pub source: Arc<RgbImage>,
    pub facts: GarmentFacts,
    pub custom_additions: Option<String>,
}

impl ImageJob {
    pub fn new(image_id: impl Into<String>, source: RgbImage, facts: GarmentFacts) -> Self {
        Self {
            image_id: image_id.into(),
            source: Arc::new(source),
            facts,
            custom_additions: None,
        }
    }
}

struct Generated {
    image: RgbImage,
    backend: Backend,
    fallback_reason: Option<String>,
    auxiliary_conditioning_applied: bool,
}

pub struct Orchestrator {
    extractor: FeatureExtractor,
    fusion: MaskFusionEngine,
    mask_weights: BTreeMap<String, f32>,
    planner: PartPlanner,
    routing: RoutingPolicy,
    scorer: QualityScorer,
    config: OrchestratorConfig,
    collaborators: Collaborators,
}

impl Orchestrator {
    pub fn new(settings: &StudioSettings, collaborators: Collaborators) -> Self {
        Self {
            extractor: FeatureExtractor::new(settings.features.clone()),
            fusion: MaskFusionEngine::new(settings.fusion.clone()),
            mask_weights: settings.mask_weights.clone(),
            planner: PartPlanner::new(settings.planner.clone()),
            routing: RoutingPolicy::new(settings.routing.clone()),
            scorer: QualityScorer::new(settings.qa.clone()),
            config: settings.orchestrator.clone(),
            collaborators,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the whole pipeline for one image under `image_timeout_secs`.
    /// Never returns an error: failures are recorded on the report.
    pub async fn process_image(&self, job: ImageJob) -> ImageRunReport {
        let started = Instant::now();
        let mut report = ImageRunReport::new(
            new_run_id(),
            job.image_id.clone(),
            image_fingerprint(&job.source),
            timestamp_now(),
        );
        info!(image_id = %job.image_id, run_id = %report.run_id, "processing image");

        let seconds = self.config.image_timeout_secs;
        let result = match tokio::time::timeout(
            Duration::from_secs(seconds),
            self.run(&job, &mut report),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout { seconds }),
        };
        if let Err(error) = result {
            warn!(image_id = %job.image_id, error = %error, "image failed");
            report.fail(error.marker(), error.to_string());
        }

        report.finished_at = Some(timestamp_now());
        report.processing_seconds = started.elapsed().as_secs_f64();

        let path = run_report_path(&self.config.output_dir, &report.run_id);
        match write_pretty_json_with_newline(&path, &report) {
            Ok(()) => info!(
                image_id = %job.image_id,
                status = ?report.final_status,
                path = %path.display(),
                "run report written"
            ),
            Err(error) => warn!(image_id = %job.image_id, error = %error, "run report not written"),
        }
        report
    }

    async fn run(&self, job: &ImageJob, report: &mut ImageRunReport) -> Result<(), OrchestratorError> {
        job.facts.validate()?;
        let facts = Arc::new(job.facts.clone());

        let features = self.extractor.extract(&job.source)?;
        debug!(
            colors = ?features.dominant_colors,
            complexity = features.pattern_complexity.as_str(),
            "extracted features"
        );
        report.features = Some(features.clone());

        let fused = self.fuse_masks(job, report).await?;

        let planned = self.planner.plan(&facts, &features);
        info!(parts = ?planned, "planned part analysis");
        report.planned_parts = planned.clone();

        let parts = self
            .analyze_parts(job, &facts, &features, &fused, &planned, report)
            .await;
        report.part_summary = Some(summarize_parts(&parts));
        report.part_facts = parts.clone();

        let mask = Arc::new(fused.hard);
        self.render_until_accepted(job, &facts, &mask, &parts, report)
            .await
    }

    async fn fuse_masks(
        &self,
        job: &ImageJob,
        report: &mut ImageRunReport,
    ) -> Result<FusedMask, OrchestratorError> {
        let timeout = self.config.collaborator_timeout_secs;

        let segmentation = Arc::clone(&self.collaborators.segmentation);
        let source = Arc::clone(&job.source);
        let masks = call_blocking(GARMENT_MASKS, timeout, move || {
            segmentation.garment_masks(&source)
        })
        .await;
        record(report, GARMENT_MASKS, Priority::P0, None, &masks, |masks| {
            format!("{} masks", masks.len())
        });
        let masks = masks?;

        let segmentation = Arc::clone(&self.collaborators.segmentation);
        let source = Arc::clone(&job.source);
        let human = call_blocking(HUMAN_MASK, timeout, move || segmentation.human_mask(&source)).await;
        record(report, HUMAN_MASK, Priority::P1, None, &human, |mask| {
            mask.source.clone()
        });
        let subtract = match human {
            Ok(mask) => Some(mask),
            Err(error) => {
                report
                    .warnings
                    .push(format!("fused without human subtraction: {error}"));
                None
            }
        };

        let luma = GrayField::luminance_of(&job.source);
        let fused = match self
            .fusion
            .fuse(&luma, &masks, subtract.as_ref(), &self.mask_weights)
        {
            Ok(fused) => fused,
            Err(error) => {
                if let FusionError::DegenerateMask { quality, .. } = &error {
                    report.mask_quality = Some(quality.clone());
                }
                return Err(error.into());
            }
        };
        info!(
            mask_quality = fused.quality.overall_score,
            edge_alignment = fused.quality.edge_alignment,
            "fused garment mask"
        );
        report.mask_quality = Some(fused.quality.clone());

        let path = mask_path(&self.config.output_dir, &report.run_id, &job.image_id);
        match write_mask_png(&path, &fused.soft.to_luma8()) {
            Ok(()) => report.mask_path = Some(path.display().to_string()),
            Err(error) => {
                warn!(error = %error, "fused mask not saved");
                report.warnings.push(error.to_string());
            }
        }
        Ok(fused)
    }

    /// Part analyses run concurrently and each may fail on its own; a part
    /// without a usable answer keeps a heuristic placeholder.
    async fn analyze_parts(
        &self,
        job: &ImageJob,
        facts: &GarmentFacts,
        features: &FeatureSet,
        fused: &FusedMask,
        planned: &[String],
        report: &mut ImageRunReport,
    ) -> Vec<PartFacts> {
        if planned.is_empty() {
            return Vec::new();
        }
        let timeout = self.config.collaborator_timeout_secs;

        let segmentation = Arc::clone(&self.collaborators.segmentation);
        let source = Arc::clone(&job.source);
        let names = planned.to_vec();
        let detection = call_blocking(DETECT_PARTS, timeout, move || {
            segmentation.detect_parts(&source, &names)
        })
        .await;
        record(report, DETECT_PARTS, Priority::P1, None, &detection, |parts| {
            format!("{} parts detected", parts.len())
        });
        let detected = detection.unwrap_or_default();
        let usable = detected
            .iter()
            .filter(|part| part.confidence >= MIN_PART_CONFIDENCE && part.bbox.is_some())
            .count();
        let method = if usable >= self.config.min_parts_detected {
            AnalysisMethod::PerPart
        } else {
            info!(
                detected = usable,
                required = self.config.min_parts_detected,
                "analyzing parts on whole-garment crops"
            );
            AnalysisMethod::WholeGarment
        };
        report.analysis_method = Some(method);

        let garment_region = fused.hard.bounding_box(0.5);
        let mut tasks = JoinSet::new();
        for (index, part) in planned.iter().enumerate() {
            let region = match method {
                AnalysisMethod::PerPart => detected
                    .iter()
                    .filter(|d| d.part_name == *part && d.confidence >= MIN_PART_CONFIDENCE)
                    .find_map(|d| d.bbox)
                    .or(garment_region),
                AnalysisMethod::WholeGarment => garment_region,
            };
            let request = PartAnalysisRequest {
                part_name: part.clone(),
                context: build_part_analysis_prompt(part, &facts.category, Some(features)),
                crop: crop_region(&job.source, region),
            };
            let analysis = Arc::clone(&self.collaborators.part_analysis);
            tasks.spawn(async move {
                let result =
                    call_blocking(PART_ANALYSIS, timeout, move || analysis.analyze_part(&request))
                        .await;
                (index, result)
            });
        }
        report.detected_parts = detected;

        let mut slots: Vec<Option<PartFacts>> = vec![None; planned.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    warn!(error = %join_error, "part analysis task aborted");
                    report
                        .warnings
                        .push(format!("part analysis task aborted: {join_error}"));
                    continue;
                }
            };
            let Some(part) = planned.get(index) else {
                continue;
            };
            let collaborator = format!("{PART_ANALYSIS}:{part}");
            let part_facts = match result {
                Ok(raw) => {
                    let parsed = parse_part_response(part, &raw, Some(features));
                    let outcome = match parsed.recovery {
                        ResponseRecovery::Direct => CallOutcome::Success(String::from("parsed")),
                        ResponseRecovery::StrippedFormatting => {
                            CallOutcome::Success(String::from("parsed after stripping formatting"))
                        }
                        ResponseRecovery::Fallback { reason } => {
                            warn!(part = %part, reason = %reason, "part analysis unusable");
                            CallOutcome::Degraded { reason }
                        }
                    };
                    report.record_call(&collaborator, Priority::P1, None, outcome);
                    parsed.facts
                }
                Err(error) => {
                    record(report, &collaborator, Priority::P1, None, &Err::<(), _>(error), |_| {
                        String::new()
                    });
                    fallback_part_facts(part, Some(features))
                }
            };
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(part_facts);
            }
        }

        planned
            .iter()
            .zip(slots)
            .map(|(part, slot)| slot.unwrap_or_else(|| fallback_part_facts(part, Some(features))))
            .collect()
    }

    async fn render_until_accepted(
        &self,
        job: &ImageJob,
        facts: &Arc<GarmentFacts>,
        mask: &Arc<GrayField>,
        parts: &[PartFacts],
        report: &mut ImageRunReport,
    ) -> Result<(), OrchestratorError> {
        let max_attempts = self.scorer.config().max_retries.max(1);
        let mut state = QaState::Pending;
        let mut prior: Option<PriorAttempt> = None;

        for attempt in 1..=max_attempts {
            let decision = self.routing.route(facts, attempt, prior.as_ref());
            info!(
                attempt,
                backend = decision.backend.as_str(),
                auxiliary_conditioning = decision.use_auxiliary_conditioning,
                escalated = decision.escalated,
                "routed attempt"
            );
            let prompt = build_generation_prompt(
                facts,
                &decision,
                &PromptInputs {
                    parts,
                    custom_additions: job.custom_additions.as_deref(),
                },
            );

            let generated = self.generate(&decision, prompt, &job.source, report).await?;
            let rendered = Arc::new(generated.image);
            let artifact =
                artifact_path(&self.config.output_dir, &report.run_id, &job.image_id, attempt);
            write_png(&artifact, &rendered)?;

            let metrics = self
                .measure(&rendered, job, mask, facts, attempt, report)
                .await?;
            let semantic = self.review(&rendered, facts, attempt, report).await;
            let signals = QaSignals {
                edge_gate: metrics.edge_similarity,
                background_gate: metrics.background_purity,
                color_fidelity: self.scorer.color_fidelity(metrics.color_delta_e, facts)?,
                semantic_alignment: semantic.score,
            };

            state = state.transition(QaState::Scoring)?;
            let qa = self.scorer.score(&signals, attempt, facts)?;
            state = state.transition(QaState::from(qa.recommendation))?;
            info!(
                attempt,
                qa_total = qa.qa_total,
                failed = ?qa.failed_signals,
                state = ?state,
                "scored attempt"
            );

            report.warnings.extend(qa.warnings.iter().cloned());
            let failed_signals = qa.failed_signals.clone();
            let artifact = artifact.display().to_string();
            report.push_attempt(AttemptRecord {
                attempt_number: attempt,
                routing: decision.clone(),
                backend_used: generated.backend,
                fallback_reason: generated.fallback_reason,
                auxiliary_conditioning_applied: generated.auxiliary_conditioning_applied,
                artifact_path: Some(artifact.clone()),
                metrics,
                semantic,
                qa,
                state,
            });

            if state.is_terminal() {
                report.final_status = if state == QaState::Accepted {
                    FinalStatus::Accepted
                } else {
                    FinalStatus::AcceptedWithWarning
                };
                report.final_artifact = Some(artifact);
                return Ok(());
            }
            prior = Some(PriorAttempt {
                decision,
                failed_signals,
            });
        }
        Err(OrchestratorError::RetryLoopExhausted)
    }

    /// Secondary unavailable falls back to primary; a failure with auxiliary
    /// conditioning is retried once without it. Anything left is fatal.
    async fn generate(
        &self,
        decision: &RoutingDecision,
        prompt: String,
        source: &Arc<RgbImage>,
        report: &mut ImageRunReport,
    ) -> Result<Generated, OrchestratorError> {
        let attempt = decision.attempt_number;
        let mut request = GenerationRequest {
            prompt,
            backend: decision.backend,
            use_auxiliary_conditioning: decision.use_auxiliary_conditioning,
            conditioning_weight: decision.conditioning_weight,
            source: Arc::clone(source),
        };
        let mut fallback_reason = None;
        let mut result = self.call_generation(request.clone()).await;

        if let Err(error) = &result {
            if request.backend == Backend::Secondary && error.is_unavailable() {
                let reason = format!("secondary backend unavailable, rendered on primary: {error}");
                warn!(attempt, reason = %reason, "generation fallback");
                report.record_call(
                    GENERATION,
                    Priority::P1,
                    Some(attempt),
                    CallOutcome::Degraded {
                        reason: reason.clone(),
                    },
                );
                request.backend = Backend::Primary;
                fallback_reason = Some(reason);
                result = self.call_generation(request.clone()).await;
            }
        }
        if let Err(error) = &result {
            if request.use_auxiliary_conditioning && !error.is_unavailable() {
                let reason = format!("auxiliary conditioning failed, rendered without it: {error}");
                warn!(attempt, reason = %reason, "generation fallback");
                report.record_call(
                    GENERATION,
                    Priority::P1,
                    Some(attempt),
                    CallOutcome::Degraded { reason },
                );
                request.use_auxiliary_conditioning = false;
                request.conditioning_weight = 0.0;
                result = self.call_generation(request.clone()).await;
            }
        }

        let backend = request.backend;
        record(report, GENERATION, Priority::P0, Some(attempt), &result, |image| {
            format!(
                "{} rendered {}x{}",
                backend.as_str(),
                image.width(),
                image.height()
            )
        });
        Ok(Generated {
            image: result?,
            backend,
            fallback_reason,
            auxiliary_conditioning_applied: request.use_auxiliary_conditioning,
        })
    }

    async fn call_generation(&self, request: GenerationRequest) -> Result<RgbImage, CollaboratorError> {
        let generation = Arc::clone(&self.collaborators.generation);
        call_blocking(GENERATION, self.config.collaborator_timeout_secs, move || {
            generation.generate(&request)
        })
        .await
    }

    async fn measure(
        &self,
        rendered: &Arc<RgbImage>,
        job: &ImageJob,
        mask: &Arc<GrayField>,
        facts: &Arc<GarmentFacts>,
        attempt: u32,
        report: &mut ImageRunReport,
    ) -> Result<MetricReadings, OrchestratorError> {
        let metrics = Arc::clone(&self.collaborators.metrics);
        let rendered = Arc::clone(rendered);
        let source = Arc::clone(&job.source);
        let mask = Arc::clone(mask);
        let facts = Arc::clone(facts);
        let result = call_blocking(METRICS, self.config.collaborator_timeout_secs, move || {
            metrics.measure(&rendered, &source, &mask, &facts)
        })
        .await;
        record(report, METRICS, Priority::P0, Some(attempt), &result, |m| {
            format!(
                "edge {:.3}, background {:.3}, delta_e {:.2}",
                m.edge_similarity, m.background_purity, m.color_delta_e
            )
        });
        Ok(result?)
    }

    /// Without a usable reviewer answer the render's own features stand in
    /// and the alignment is marked degraded.
    async fn review(
        &self,
        rendered: &Arc<RgbImage>,
        facts: &GarmentFacts,
        attempt: u32,
        report: &mut ImageRunReport,
    ) -> SemanticAlignment {
        let reason = match &self.collaborators.semantic {
            None => String::from("no semantic reviewer configured"),
            Some(reviewer) => {
                let reviewer = Arc::clone(reviewer);
                let image = Arc::clone(rendered);
                let result = call_blocking(
                    SEMANTIC_REVIEW,
                    self.config.collaborator_timeout_secs,
                    move || reviewer.review(&image),
                )
                .await
                .and_then(|raw| {
                    parse_observation(&raw).ok_or_else(|| {
                        CollaboratorError::malformed(SEMANTIC_REVIEW, "review is not a JSON object")
                    })
                });
                match result {
                    Ok(observation) => {
                        report.record_call(
                            SEMANTIC_REVIEW,
                            Priority::P1,
                            Some(attempt),
                            CallOutcome::Success(String::from("parsed")),
                        );
                        return align(&observation, facts, false);
                    }
                    Err(error) => error.to_string(),
                }
            }
        };
        warn!(attempt, reason = %reason, "semantic review degraded");
        report.record_call(
            SEMANTIC_REVIEW,
            Priority::P1,
            Some(attempt),
            CallOutcome::Degraded { reason },
        );
        let observation = self
            .extractor
            .extract(rendered)
            .map(|features| heuristic_observation(&features))
            .unwrap_or_default();
        align(&observation, facts, true)
    }
}

/// Runs a blocking collaborator call on the blocking pool, bounded by
/// `timeout_secs`. The call itself is not cancelled on timeout.
pub async fn call_blocking<T, F>(
    collaborator: &str,
    timeout_secs: u64,
    call: F,
) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(call);
    match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(CollaboratorError::failed(
            collaborator,
            format!("worker task failed: {join_error}"),
        )),
        Err(_) => Err(CollaboratorError::Timeout {
            collaborator: collaborator.to_string(),
            seconds: timeout_secs,
        }),
    }
}

fn record<T>(
    report: &mut ImageRunReport,
    collaborator: &str,
    priority: Priority,
    attempt_number: Option<u32>,
    result: &Result<T, CollaboratorError>,
    describe: impl FnOnce(&T) -> String,
) {
    let outcome = CallOutcome::from_result(
        priority,
        result.as_ref().map(describe).map_err(|error| error.clone()),
    );
    if let Some(reason) = outcome.reason() {
        warn!(collaborator, priority = ?priority, reason, "collaborator call failed");
    }
    report.record_call(collaborator, priority, attempt_number, outcome);
}

fn crop_region(source: &RgbImage, region: Option<[u32; 4]>) -> RgbImage {
    let (width, height) = source.dimensions();
    match region {
        Some([x, y, w, h]) if x < width && y < height && w > 0 && h > 0 => {
            imageops::crop_imm(source, x, y, w.min(width - x), h.min(height - y)).to_image()
        }
        _ => source.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        DetectedPart, GenerationBackend, LocalMetrics, PartAnalysisCollaborator,
        SegmentationCollaborator, SemanticReviewer,
    };
    use crate::facts::{sample_facts, Pattern};
    use crate::scoring::QaSignal;
    use crate::fusion::{SoftMask, SOURCE_RMBG, SOURCE_U2NET};
    use crate::settings::{resolve_studio_settings, StudioSettingsOverlay};
    use image::Rgb;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SIZE: u32 = 48;
    const NAVY: Rgb<u8> = Rgb([0x1F, 0x3A, 0x5F]);
    const MATCHING_REVIEW: &str =
        r##"{"category": "shirt", "color_hex": "#1F3A5F", "pattern": "solid"}"##;

    fn inside(x: u32, y: u32) -> bool {
        (12..SIZE - 12).contains(&x) && (12..SIZE - 12).contains(&y)
    }

    fn garment_image() -> RgbImage {
        RgbImage::from_fn(SIZE, SIZE, |x, y| {
            if inside(x, y) {
                NAVY
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    fn garment_field(value: f32) -> GrayField {
        GrayField::from_fn(SIZE, SIZE, |x, y| if inside(x, y) { value } else { 0.0 })
    }

    struct FakeSegmentation {
        mask_value: f32,
        parts: Vec<DetectedPart>,
    }

    impl SegmentationCollaborator for FakeSegmentation {
        fn garment_masks(&self, _image: &RgbImage) -> Result<Vec<SoftMask>, CollaboratorError> {
            Ok(vec![
                SoftMask::new(SOURCE_RMBG, garment_field(self.mask_value)),
                SoftMask::new(SOURCE_U2NET, garment_field(self.mask_value)),
            ])
        }

        fn human_mask(&self, _image: &RgbImage) -> Result<SoftMask, CollaboratorError> {
            Err(CollaboratorError::unavailable("human", "no model loaded"))
        }

        fn detect_parts(
            &self,
            _image: &RgbImage,
            _part_names: &[String],
        ) -> Result<Vec<DetectedPart>, CollaboratorError> {
            Ok(self.parts.clone())
        }
    }

    struct FakeAnalysis;

    impl PartAnalysisCollaborator for FakeAnalysis {
        fn analyze_part(&self, request: &PartAnalysisRequest) -> Result<String, CollaboratorError> {
            match request.part_name.as_str() {
                "collar" => Ok(String::from(
                    "```json\n{\"color_hex\": \"#1F3A5F\", \"pattern\": \"solid\", \"seam_quality\": 0.9, \"sharpness_needed\": 0.8}\n```",
                )),
                "sleeve" => Err(CollaboratorError::Timeout {
                    collaborator: String::from(PART_ANALYSIS),
                    seconds: 1,
                }),
                _ => Ok(String::from("I could not see that part clearly.")),
            }
        }
    }

    struct FnGeneration<F>(F);

    impl<F> GenerationBackend for FnGeneration<F>
    where
        F: Fn(&GenerationRequest) -> Result<RgbImage, CollaboratorError> + Send + Sync + 'static,
    {
        fn generate(&self, request: &GenerationRequest) -> Result<RgbImage, CollaboratorError> {
            (self.0)(request)
        }
    }

    struct FixedReviewer(&'static str);

    impl SemanticReviewer for FixedReviewer {
        fn review(&self, _rendered: &RgbImage) -> Result<String, CollaboratorError> {
            Ok(self.0.to_string())
        }
    }

    fn temp_root() -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("ghost_studio_orchestrator_test_{stamp}"))
    }

    fn settings(root: &std::path::Path, image_timeout_secs: Option<u64>) -> StudioSettings {
        resolve_studio_settings(&StudioSettingsOverlay {
            output_dir: Some(root.display().to_string()),
            image_timeout_secs,
            ..StudioSettingsOverlay::default()
        })
        .expect("default settings should resolve")
    }

    fn collaborators<F>(generate: F, reviewer: Option<&'static str>) -> Collaborators
    where
        F: Fn(&GenerationRequest) -> Result<RgbImage, CollaboratorError> + Send + Sync + 'static,
    {
        Collaborators {
            segmentation: Arc::new(FakeSegmentation {
                mask_value: 0.95,
                parts: Vec::new(),
            }),
            part_analysis: Arc::new(FakeAnalysis),
            generation: Arc::new(FnGeneration(generate)),
            semantic: reviewer
                .map(|raw| Arc::new(FixedReviewer(raw)) as crate::collaborators::SharedSemanticReviewer),
            metrics: Arc::new(LocalMetrics::default()),
        }
    }

    fn echo_source(request: &GenerationRequest) -> Result<RgbImage, CollaboratorError> {
        Ok(request.source.as_ref().clone())
    }

    #[tokio::test]
    async fn faithful_render_is_accepted_on_first_attempt() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(echo_source, Some(MATCHING_REVIEW)),
        );
        let job = ImageJob::new("shirt_01", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(report.final_status, FinalStatus::Accepted, "{report:#?}");
        assert_eq!(report.attempts.len(), 1);
        let attempt = &report.attempts[0];
        assert_eq!(attempt.state, QaState::Accepted);
        assert_eq!(attempt.backend_used, Backend::Primary);
        assert!(attempt.qa.qa_total >= 0.85);
        assert!(!attempt.semantic.degraded);
        assert!(report.mask_quality.is_some());
        assert!(report.mask_path.is_some());
        assert_eq!(report.analysis_method, Some(AnalysisMethod::WholeGarment));
        assert!(report.warnings.iter().any(|w| w.contains("human subtraction")));
        assert!(run_report_path(&root, &report.run_id).is_file());
        assert!(report
            .final_artifact
            .as_deref()
            .is_some_and(|path| path.ends_with("shirt_01_attempt1.png")));

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn part_analysis_keeps_partial_results() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(echo_source, Some(MATCHING_REVIEW)),
        );
        let job = ImageJob::new("shirt_02", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(report.planned_parts, vec!["collar", "sleeve", "body", "hem"]);
        let names = report
            .part_facts
            .iter()
            .map(|p| (p.part_name.as_str(), p.analyzed))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![("collar", true), ("sleeve", false), ("body", false), ("hem", false)]
        );
        let summary = report.part_summary.as_ref().expect("summary");
        assert_eq!(summary.analyzed_parts, 1);
        assert_eq!(summary.fallback_parts, 3);

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn poor_renders_exhaust_retries_with_warning() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(
                |_: &GenerationRequest| Ok(RgbImage::from_pixel(SIZE, SIZE, Rgb([128, 128, 128]))),
                Some(MATCHING_REVIEW),
            ),
        );
        let job = ImageJob::new("shirt_03", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(report.final_status, FinalStatus::AcceptedWithWarning);
        let states = report.attempts.iter().map(|a| a.state).collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![QaState::ReRender, QaState::ReRender, QaState::AcceptedWithWarning]
        );
        let numbers = report.qa_history().map(|qa| qa.attempt_number).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3]);
        let backends = report
            .attempts
            .iter()
            .map(|a| a.routing.backend)
            .collect::<Vec<_>>();
        assert_eq!(
            backends,
            vec![Backend::Primary, Backend::Secondary, Backend::Secondary]
        );
        assert!(report.attempts[0]
            .qa
            .failed_signals
            .iter()
            .any(|s| matches!(s, QaSignal::ColorFidelity | QaSignal::SemanticAlignment)));
        assert!(report.attempts[1].routing.escalated);
        assert!(report.warnings.iter().any(|w| w.contains("retries exhausted")));
        assert!(report.final_artifact.is_some());

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn degenerate_masks_fail_with_marker() {
        let root = temp_root();
        let mut collaborators = collaborators(echo_source, Some(MATCHING_REVIEW));
        collaborators.segmentation = Arc::new(FakeSegmentation {
            mask_value: 0.0,
            parts: Vec::new(),
        });
        let orchestrator = Orchestrator::new(&settings(&root, None), collaborators);
        let job = ImageJob::new("blank", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(report.final_status, FinalStatus::Failed);
        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.marker, FailureMarker::DegenerateInput);
        assert_eq!(report.mask_quality.as_ref().map(|q| q.overall_score), Some(0.0));
        assert!(report.attempts.is_empty());
        assert!(run_report_path(&root, &report.run_id).is_file());

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn unavailable_secondary_falls_back_to_primary() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(
                |request: &GenerationRequest| match request.backend {
                    Backend::Secondary => {
                        Err(CollaboratorError::unavailable("secondary", "503"))
                    }
                    Backend::Primary => echo_source(request),
                },
                Some(MATCHING_REVIEW),
            ),
        );
        let job = ImageJob::new(
            "striped",
            garment_image(),
            sample_facts(Pattern::Striped, 0.2, 0.2),
        );
        let report = orchestrator.process_image(job).await;

        let attempt = &report.attempts[0];
        assert_eq!(attempt.routing.backend, Backend::Secondary);
        assert_eq!(attempt.backend_used, Backend::Primary);
        assert!(attempt
            .fallback_reason
            .as_deref()
            .is_some_and(|r| r.contains("secondary backend unavailable")));
        assert!(report.degraded_calls() >= 1);
        assert_ne!(report.final_status, FinalStatus::Failed);

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn failed_conditioning_renders_without_it() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(
                |request: &GenerationRequest| {
                    if request.use_auxiliary_conditioning {
                        Err(CollaboratorError::failed("secondary", "control model crashed"))
                    } else {
                        echo_source(request)
                    }
                },
                Some(MATCHING_REVIEW),
            ),
        );
        let job = ImageJob::new(
            "printed",
            garment_image(),
            sample_facts(Pattern::Striped, 0.8, 0.2),
        );
        let report = orchestrator.process_image(job).await;

        let attempt = &report.attempts[0];
        assert!(attempt.routing.use_auxiliary_conditioning);
        assert!(!attempt.auxiliary_conditioning_applied);
        assert_eq!(attempt.backend_used, Backend::Secondary);
        assert_ne!(report.final_status, FinalStatus::Failed);

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn primary_failure_is_fatal() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(
                |_: &GenerationRequest| Err(CollaboratorError::unavailable("primary", "down")),
                Some(MATCHING_REVIEW),
            ),
        );
        let job = ImageJob::new("solid", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(report.final_status, FinalStatus::Failed);
        assert_eq!(
            report.failure.as_ref().map(|f| f.marker),
            Some(FailureMarker::CollaboratorFatal)
        );
        assert!(report.collaborator_calls.iter().any(|c| c.collaborator == GENERATION
            && matches!(c.outcome, CallOutcome::Fatal { .. })));

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_reviewer_degrades_semantic_signal() {
        let root = temp_root();
        let orchestrator =
            Orchestrator::new(&settings(&root, None), collaborators(echo_source, None));
        let job = ImageJob::new("solo", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        let attempt = &report.attempts[0];
        assert!(attempt.semantic.degraded);
        assert_eq!(attempt.semantic.category_match, None);
        assert_eq!(report.final_status, FinalStatus::Accepted);

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn empty_review_falls_back_to_heuristic() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(echo_source, Some("{}")),
        );
        let job = ImageJob::new("quiet", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        let attempt = &report.attempts[0];
        assert!(attempt.semantic.degraded);
        assert!(attempt.semantic.score > 0.0);
        assert!(report.collaborator_calls.iter().any(|c| c.collaborator == SEMANTIC_REVIEW
            && matches!(c.outcome, CallOutcome::Degraded { .. })));

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn reruns_of_one_image_keep_their_own_artifacts() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(echo_source, Some(MATCHING_REVIEW)),
        );
        let marked = |value: u8| {
            let mut image = garment_image();
            image.put_pixel(0, 0, Rgb([value, value, value]));
            image
        };
        let facts = sample_facts(Pattern::Solid, 0.2, 0.2);
        let first = orchestrator
            .process_image(ImageJob::new("shirt", marked(250), facts.clone()))
            .await;
        let second = orchestrator
            .process_image(ImageJob::new("shirt", marked(245), facts))
            .await;

        assert_ne!(first.final_artifact, second.final_artifact);
        assert_ne!(first.mask_path, second.mask_path);
        for (report, value) in [(&first, 250), (&second, 245)] {
            let path = report.final_artifact.as_deref().expect("artifact");
            let saved = image::open(path).expect("artifact should load").to_rgb8();
            assert_eq!(*saved.get_pixel(0, 0), Rgb([value, value, value]));
        }

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn invalid_facts_are_rejected_before_any_call() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, None),
            collaborators(echo_source, Some(MATCHING_REVIEW)),
        );
        let job = ImageJob::new("bad", garment_image(), sample_facts(Pattern::Solid, 0.2, 1.5));
        let report = orchestrator.process_image(job).await;

        assert_eq!(
            report.failure.as_ref().map(|f| f.marker),
            Some(FailureMarker::InvalidFacts)
        );
        assert!(report.collaborator_calls.is_empty());

        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn slow_images_time_out() {
        let root = temp_root();
        let orchestrator = Orchestrator::new(
            &settings(&root, Some(1)),
            collaborators(
                |request: &GenerationRequest| {
                    std::thread::sleep(Duration::from_millis(1500));
                    echo_source(request)
                },
                Some(MATCHING_REVIEW),
            ),
        );
        let job = ImageJob::new("slow", garment_image(), sample_facts(Pattern::Solid, 0.2, 0.2));
        let report = orchestrator.process_image(job).await;

        assert_eq!(
            report.failure.as_ref().map(|f| f.marker),
            Some(FailureMarker::Timeout)
        );
        assert!(report.mask_quality.is_some());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn crops_clamp_to_image_bounds() {
        let image = garment_image();
        assert_eq!(crop_region(&image, Some([40, 40, 20, 20])).dimensions(), (8, 8));
        assert_eq!(crop_region(&image, Some([60, 0, 4, 4])).dimensions(), (SIZE, SIZE));
        assert_eq!(crop_region(&image, None).dimensions(), (SIZE, SIZE));
    }
}
