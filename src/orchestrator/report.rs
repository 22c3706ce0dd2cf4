//! Per-image run report. Attempt records are appended once and never
//! rewritten; the report is the audit trail for a single source image.

use serde::Serialize;

use crate::collaborators::{CallOutcome, DetectedPart, Priority};
use crate::facts::part_response::PartSummary;
use crate::facts::PartFacts;
use crate::features::FeatureSet;
use crate::fusion::MaskQuality;
use crate::routing::{Backend, RoutingDecision};
use crate::scoring::metrics::MetricReadings;
use crate::scoring::semantic::SemanticAlignment;
use crate::scoring::{QaReport, QaState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Pending,
    Accepted,
    AcceptedWithWarning,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMarker {
    DegenerateInput,
    CollaboratorFatal,
    InvalidFacts,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub marker: FailureMarker,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    PerPart,
    WholeGarment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub collaborator: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
    pub outcome: CallOutcome<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub routing: RoutingDecision,
    pub backend_used: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub auxiliary_conditioning_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub metrics: MetricReadings,
    pub semantic: SemanticAlignment,
    pub qa: QaReport,
    pub state: QaState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRunReport {
    pub run_id: String,
    pub image_id: String,
    pub source_fingerprint: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub processing_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_quality: Option<MaskQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_path: Option<String>,
    pub planned_parts: Vec<String>,
    pub detected_parts: Vec<DetectedPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_method: Option<AnalysisMethod>,
    pub part_facts: Vec<PartFacts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_summary: Option<PartSummary>,
    pub attempts: Vec<AttemptRecord>,
    pub collaborator_calls: Vec<CallRecord>,
    pub final_status: FinalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub warnings: Vec<String>,
}

impl ImageRunReport {
    pub fn new(
        run_id: String,
        image_id: String,
        source_fingerprint: String,
        started_at: String,
    ) -> Self {
        Self {
            run_id,
            image_id,
            source_fingerprint,
            started_at,
            finished_at: None,
            processing_seconds: 0.0,
            features: None,
            mask_quality: None,
            mask_path: None,
            planned_parts: Vec::new(),
            detected_parts: Vec::new(),
            analysis_method: None,
            part_facts: Vec::new(),
            part_summary: None,
            attempts: Vec::new(),
            collaborator_calls: Vec::new(),
            final_status: FinalStatus::Pending,
            final_artifact: None,
            failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn record_call(
        &mut self,
        collaborator: &str,
        priority: Priority,
        attempt_number: Option<u32>,
        outcome: CallOutcome<String>,
    ) {
        self.collaborator_calls.push(CallRecord {
            collaborator: collaborator.to_string(),
            priority,
            attempt_number,
            outcome,
        });
    }

    pub fn push_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    pub fn fail(&mut self, marker: FailureMarker, message: impl Into<String>) {
        self.final_status = FinalStatus::Failed;
        self.failure = Some(FailureRecord {
            marker,
            message: message.into(),
        });
    }

    pub fn qa_history(&self) -> impl Iterator<Item = &QaReport> {
        self.attempts.iter().map(|a| &a.qa)
    }

    pub fn last_qa_total(&self) -> Option<f64> {
        self.attempts.last().map(|a| a.qa.qa_total)
    }

    pub fn degraded_calls(&self) -> usize {
        self.collaborator_calls
            .iter()
            .filter(|c| matches!(c.outcome, CallOutcome::Degraded { .. }))
            .count()
    }
}
