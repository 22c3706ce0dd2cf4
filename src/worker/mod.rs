//! Batch runner: images are processed concurrently up to the configured
//! limit, each under the orchestrator's per-image timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::orchestrator::report::{FailureMarker, FinalStatus, ImageRunReport};
use crate::orchestrator::{ImageJob, Orchestrator};
use crate::runlog::{new_run_id, timestamp_now, write_pretty_json_with_newline, RunLogError, RUNS_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::{Completed, Failed, Pending, Processing};

        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self, WorkerError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(WorkerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid job state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error(transparent)]
    RunLog(#[from] RunLogError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSummary {
    pub image_id: String,
    pub run_id: String,
    pub state: JobState,
    pub final_status: FinalStatus,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_qa_total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_marker: Option<FailureMarker>,
    pub processing_seconds: f64,
}

impl ImageSummary {
    fn of(report: &ImageRunReport, state: JobState) -> Self {
        Self {
            image_id: report.image_id.clone(),
            run_id: report.run_id.clone(),
            state,
            final_status: report.final_status,
            attempts: report.attempts.len(),
            final_qa_total: report.last_qa_total(),
            final_artifact: report.final_artifact.clone(),
            failure_marker: report.failure.as_ref().map(|f| f.marker),
            processing_seconds: report.processing_seconds,
        }
    }
}

/// count/mean/median/min/max over one metric across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStatistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricStatistics {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted = values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect::<Vec<_>>();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Some(Self {
            count,
            mean: sorted.iter().sum::<f64>() / count as f64,
            median,
            min: sorted[0],
            max: sorted[count - 1],
        })
    }
}

/// Final-attempt readings of one image; failed images may only carry a
/// mask quality score.
#[derive(Debug, Clone, Default, PartialEq)]
struct ImageMetrics {
    mask_quality_score: Option<f64>,
    qa_total: Option<f64>,
    edge_similarity: Option<f64>,
    background_purity: Option<f64>,
    color_delta_e: Option<f64>,
    semantic_alignment: Option<f64>,
    passed: bool,
}

impl ImageMetrics {
    fn of(report: &ImageRunReport) -> Self {
        let last = report.attempts.last();
        Self {
            mask_quality_score: report.mask_quality.as_ref().map(|q| q.overall_score),
            qa_total: last.map(|a| a.qa.qa_total),
            edge_similarity: last.map(|a| a.metrics.edge_similarity),
            background_purity: last.map(|a| a.metrics.background_purity),
            color_delta_e: last.map(|a| a.metrics.color_delta_e),
            semantic_alignment: last.map(|a| a.qa.semantic_alignment),
            passed: last.is_some_and(|a| a.qa.passed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    /// Percentage of images whose final attempt passed QA outright.
    pub pass_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_total: Option<MetricStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_similarity: Option<MetricStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_purity: Option<MetricStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_delta_e: Option<MetricStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_alignment: Option<MetricStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_quality_score: Option<MetricStatistics>,
}

impl BatchMetrics {
    fn from_images(total: usize, images: &[ImageMetrics]) -> Self {
        let stats = |pick: fn(&ImageMetrics) -> Option<f64>| {
            MetricStatistics::from_values(&images.iter().filter_map(pick).collect::<Vec<_>>())
        };
        let passed = images.iter().filter(|m| m.passed).count();
        Self {
            pass_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64 * 100.0
            },
            qa_total: stats(|m| m.qa_total),
            edge_similarity: stats(|m| m.edge_similarity),
            background_purity: stats(|m| m.background_purity),
            color_delta_e: stats(|m| m.color_delta_e),
            semantic_alignment: stats(|m| m.semantic_alignment),
            mask_quality_score: stats(|m| m.mask_quality_score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub accepted: usize,
    pub accepted_with_warning: usize,
    pub average_processing_seconds: f64,
    pub metrics: BatchMetrics,
    pub images: Vec<ImageSummary>,
}

impl BatchReport {
    fn from_summaries(
        batch_id: String,
        started_at: String,
        images: Vec<ImageSummary>,
        metrics: &[ImageMetrics],
    ) -> Self {
        let count = |status: FinalStatus| images.iter().filter(|s| s.final_status == status).count();
        let completed = images
            .iter()
            .filter(|s| s.state == JobState::Completed)
            .count();
        let average_processing_seconds = if images.is_empty() {
            0.0
        } else {
            images.iter().map(|s| s.processing_seconds).sum::<f64>() / images.len() as f64
        };
        Self {
            batch_id,
            started_at,
            finished_at: timestamp_now(),
            total: images.len(),
            completed,
            failed: images.len() - completed,
            accepted: count(FinalStatus::Accepted),
            accepted_with_warning: count(FinalStatus::AcceptedWithWarning),
            average_processing_seconds,
            metrics: BatchMetrics::from_images(images.len(), metrics),
            images,
        }
    }
}

pub fn batch_report_path(output_root: &Path, batch_id: &str) -> PathBuf {
    output_root.join(RUNS_DIR).join(format!("batch_{batch_id}.json"))
}

/// Processes `jobs` with at most `concurrency` images in flight. Summaries
/// keep the input order regardless of completion order.
pub async fn run_batch(orchestrator: Arc<Orchestrator>, jobs: Vec<ImageJob>) -> BatchReport {
    let batch_id = new_run_id();
    let started_at = timestamp_now();
    let concurrency = orchestrator.config().concurrency.max(1);
    info!(batch_id = %batch_id, images = jobs.len(), concurrency, "starting batch");

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let ids = jobs.iter().map(|job| job.image_id.clone()).collect::<Vec<_>>();
    let mut tasks = JoinSet::new();
    for (index, job) in jobs.into_iter().enumerate() {
        let orchestrator = Arc::clone(&orchestrator);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            (index, orchestrator.process_image(job).await)
        });
    }

    let mut summaries: Vec<Option<ImageSummary>> = vec![None; ids.len()];
    let mut metrics = Vec::with_capacity(ids.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, report)) => {
                let summary = match settle(&report) {
                    Ok(state) => ImageSummary::of(&report, state),
                    Err(error) => {
                        warn!(image_id = %report.image_id, error = %error, "job state rejected");
                        ImageSummary::of(&report, JobState::Failed)
                    }
                };
                metrics.push(ImageMetrics::of(&report));
                if let Some(slot) = summaries.get_mut(index) {
                    *slot = Some(summary);
                }
            }
            Err(join_error) => warn!(error = %join_error, "image task aborted"),
        }
    }

    let images = ids
        .into_iter()
        .zip(summaries)
        .map(|(image_id, summary)| summary.unwrap_or_else(|| aborted_summary(image_id)))
        .collect::<Vec<_>>();
    let report = BatchReport::from_summaries(batch_id, started_at, images, &metrics);
    info!(
        batch_id = %report.batch_id,
        completed = report.completed,
        failed = report.failed,
        accepted = report.accepted,
        pass_rate = report.metrics.pass_rate,
        "batch finished"
    );
    report
}

/// Runs the batch and writes its report next to the per-image run reports.
pub async fn run_batch_and_persist(
    orchestrator: Arc<Orchestrator>,
    jobs: Vec<ImageJob>,
) -> Result<(BatchReport, PathBuf), WorkerError> {
    let output_root = orchestrator.config().output_dir.clone();
    let report = run_batch(orchestrator, jobs).await;
    let path = batch_report_path(&output_root, &report.batch_id);
    write_pretty_json_with_newline(&path, &report)?;
    Ok((report, path))
}

fn settle(report: &ImageRunReport) -> Result<JobState, WorkerError> {
    let state = JobState::Pending.transition(JobState::Processing)?;
    let next = match report.final_status {
        FinalStatus::Accepted | FinalStatus::AcceptedWithWarning => JobState::Completed,
        FinalStatus::Failed | FinalStatus::Pending => JobState::Failed,
    };
    state.transition(next)
}

fn aborted_summary(image_id: String) -> ImageSummary {
    ImageSummary {
        image_id,
        run_id: String::new(),
        state: JobState::Failed,
        final_status: FinalStatus::Failed,
        attempts: 0,
        final_qa_total: None,
        final_artifact: None,
        failure_marker: Some(FailureMarker::Internal),
        processing_seconds: 0.0,
    }
}
