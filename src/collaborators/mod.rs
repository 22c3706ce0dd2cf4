//! Call contracts for the external inference services the orchestrator
//! depends on. Implementations are blocking; the orchestrator moves them
//! onto the blocking pool and bounds them with a timeout.

pub mod http;
pub mod keys;

use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::facts::GarmentFacts;
use crate::fusion::SoftMask;
use crate::imaging::GrayField;
use crate::routing::Backend;
use crate::scoring::metrics::{self, MetricConfig, MetricReadings};

/// P0 failures are fatal for the image; P1 failures degrade to a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: String,
        message: String,
    },
    #[error("{collaborator} timed out after {seconds}s")]
    Timeout { collaborator: String, seconds: u64 },
    #[error("{collaborator} returned a malformed response: {message}")]
    MalformedResponse {
        collaborator: String,
        message: String,
    },
    #[error("{collaborator} failed: {message}")]
    Failed {
        collaborator: String,
        message: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(collaborator: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            collaborator: collaborator.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(collaborator: &str, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            collaborator: collaborator.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(collaborator: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            collaborator: collaborator.to_string(),
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Tagged result of one collaborator call as recorded in the image report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CallOutcome<T> {
    Success(T),
    Degraded { reason: String },
    Fatal { reason: String },
}

impl<T> CallOutcome<T> {
    /// Classifies a call result by collaborator priority.
    pub fn from_result(priority: Priority, result: Result<T, CollaboratorError>) -> Self {
        match (result, priority) {
            (Ok(value), _) => Self::Success(value),
            (Err(err), Priority::P1) => Self::Degraded {
                reason: err.to_string(),
            },
            (Err(err), Priority::P0) => Self::Fatal {
                reason: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Degraded { reason } | Self::Fatal { reason } => Some(reason.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPart {
    pub part_name: String,
    pub confidence: f64,
    /// `[x, y, width, height]` in source pixels.
    #[serde(default)]
    pub bbox: Option<[u32; 4]>,
}

#[derive(Debug, Clone)]
pub struct PartAnalysisRequest {
    pub part_name: String,
    pub context: String,
    pub crop: RgbImage,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub backend: Backend,
    pub use_auxiliary_conditioning: bool,
    pub conditioning_weight: f64,
    pub source: Arc<RgbImage>,
}

pub trait SegmentationCollaborator: Send + Sync + 'static {
    /// Independent garment soft masks at source resolution (P0).
    fn garment_masks(&self, image: &RgbImage) -> Result<Vec<SoftMask>, CollaboratorError>;

    /// Person/skin mask subtracted from the garment (P1).
    fn human_mask(&self, image: &RgbImage) -> Result<SoftMask, CollaboratorError>;

    /// Part detection for the planned part names (P1).
    fn detect_parts(
        &self,
        image: &RgbImage,
        part_names: &[String],
    ) -> Result<Vec<DetectedPart>, CollaboratorError>;
}

pub trait PartAnalysisCollaborator: Send + Sync + 'static {
    /// Raw, untrusted response text for one region.
    fn analyze_part(&self, request: &PartAnalysisRequest) -> Result<String, CollaboratorError>;
}

pub trait GenerationBackend: Send + Sync + 'static {
    fn generate(&self, request: &GenerationRequest) -> Result<RgbImage, CollaboratorError>;
}

pub trait SemanticReviewer: Send + Sync + 'static {
    /// Raw, untrusted description of the rendered garment.
    fn review(&self, rendered: &RgbImage) -> Result<String, CollaboratorError>;
}

pub trait MetricCollaborator: Send + Sync + 'static {
    fn measure(
        &self,
        rendered: &RgbImage,
        source: &RgbImage,
        garment_mask: &GrayField,
        facts: &GarmentFacts,
    ) -> Result<MetricReadings, CollaboratorError>;
}

pub type SharedSegmentation = Arc<dyn SegmentationCollaborator>;
pub type SharedPartAnalysis = Arc<dyn PartAnalysisCollaborator>;
pub type SharedGeneration = Arc<dyn GenerationBackend>;
pub type SharedSemanticReviewer = Arc<dyn SemanticReviewer>;
pub type SharedMetrics = Arc<dyn MetricCollaborator>;

/// Everything an image run needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub segmentation: SharedSegmentation,
    pub part_analysis: SharedPartAnalysis,
    pub generation: SharedGeneration,
    pub semantic: Option<SharedSemanticReviewer>,
    pub metrics: SharedMetrics,
}

/// Garment masks supplied up front (e.g. from files). Calls it cannot
/// answer go to `fallback` when one is configured.
pub struct PrecomputedMasks {
    masks: Vec<SoftMask>,
    fallback: Option<SharedSegmentation>,
}

impl PrecomputedMasks {
    pub fn new(masks: Vec<SoftMask>, fallback: Option<SharedSegmentation>) -> Self {
        Self { masks, fallback }
    }

    fn fallback(&self, call: &str) -> Result<&SharedSegmentation, CollaboratorError> {
        self.fallback
            .as_ref()
            .ok_or_else(|| CollaboratorError::unavailable("segmentation", format!("no source for {call}")))
    }
}

impl SegmentationCollaborator for PrecomputedMasks {
    fn garment_masks(&self, image: &RgbImage) -> Result<Vec<SoftMask>, CollaboratorError> {
        if self.masks.is_empty() {
            return self.fallback("garment masks")?.garment_masks(image);
        }
        Ok(self.masks.clone())
    }

    fn human_mask(&self, image: &RgbImage) -> Result<SoftMask, CollaboratorError> {
        self.fallback("human mask")?.human_mask(image)
    }

    fn detect_parts(
        &self,
        image: &RgbImage,
        part_names: &[String],
    ) -> Result<Vec<DetectedPart>, CollaboratorError> {
        self.fallback("part detection")?.detect_parts(image, part_names)
    }
}

/// Stand-in for a service with no endpoint configured; every call reports
/// the service as unavailable so P1 fallbacks take over.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn error(&self) -> CollaboratorError {
        CollaboratorError::unavailable(self.0, "no endpoint configured")
    }
}

impl PartAnalysisCollaborator for Unconfigured {
    fn analyze_part(&self, _request: &PartAnalysisRequest) -> Result<String, CollaboratorError> {
        Err(self.error())
    }
}

/// In-process metric measurement.
#[derive(Debug, Clone, Default)]
pub struct LocalMetrics {
    config: MetricConfig,
}

impl LocalMetrics {
    pub fn new(config: MetricConfig) -> Self {
        Self { config }
    }
}

impl MetricCollaborator for LocalMetrics {
    fn measure(
        &self,
        rendered: &RgbImage,
        source: &RgbImage,
        garment_mask: &GrayField,
        facts: &GarmentFacts,
    ) -> Result<MetricReadings, CollaboratorError> {
        metrics::measure(&self.config, rendered, source, garment_mask, facts)
            .map_err(|err| CollaboratorError::failed("local-metrics", err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_follows_priority() {
        let err = CollaboratorError::unavailable("segmentation", "weights missing");
        assert_eq!(
            CallOutcome::<()>::from_result(Priority::P1, Err(err.clone())),
            CallOutcome::Degraded {
                reason: String::from("segmentation unavailable: weights missing")
            }
        );
        assert!(matches!(
            CallOutcome::<()>::from_result(Priority::P0, Err(err)),
            CallOutcome::Fatal { .. }
        ));
        assert!(CallOutcome::from_result(Priority::P0, Ok(3)).is_success());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = CallOutcome::<()>::Degraded {
            reason: String::from("timeout"),
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["detail"]["reason"], "timeout");
    }

    #[test]
    fn precomputed_masks_without_fallback() {
        let field = GrayField::filled(4, 4, 0.5);
        let seg = PrecomputedMasks::new(vec![SoftMask::new("rmbg", field)], None);
        let image = RgbImage::new(4, 4);
        assert_eq!(seg.garment_masks(&image).map(|m| m.len()), Ok(1));
        assert!(seg.human_mask(&image).is_err_and(|e| e.is_unavailable()));
        assert!(seg.detect_parts(&image, &[]).is_err());

        let empty = PrecomputedMasks::new(Vec::new(), None);
        assert!(empty.garment_masks(&image).is_err());

        let request = PartAnalysisRequest {
            part_name: String::from("collar"),
            context: String::new(),
            crop: image,
        };
        assert!(Unconfigured("part_analysis")
            .analyze_part(&request)
            .is_err_and(|e| e.is_unavailable()));
    }

    #[test]
    fn timeouts_count_as_unavailable() {
        let err = CollaboratorError::Timeout {
            collaborator: String::from("generation"),
            seconds: 30,
        };
        assert!(err.is_unavailable());
        assert!(!CollaboratorError::failed("generation", "bad prompt").is_unavailable());
    }
}
