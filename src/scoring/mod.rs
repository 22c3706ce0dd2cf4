//! Hierarchical QA: four independently measured signals folded into one
//! accept / re-render verdict with a bounded retry budget.

pub mod metrics;
pub mod semantic;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::facts::GarmentFacts;

pub const EDGE_WEIGHT: f64 = 0.4;
pub const BACKGROUND_WEIGHT: f64 = 0.3;
pub const COLOR_WEIGHT: f64 = 0.2;
pub const SEMANTIC_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaSignal {
    EdgeGate,
    BackgroundGate,
    ColorFidelity,
    SemanticAlignment,
}

impl QaSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EdgeGate => "edge_gate",
            Self::BackgroundGate => "background_gate",
            Self::ColorFidelity => "color_fidelity",
            Self::SemanticAlignment => "semantic_alignment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "edge" | "edge_gate" => Some(Self::EdgeGate),
            "background" | "background_gate" => Some(Self::BackgroundGate),
            "color" | "color_fidelity" => Some(Self::ColorFidelity),
            "semantic" | "semantic_alignment" => Some(Self::SemanticAlignment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Accept,
    ReRender,
    AcceptWithWarning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricClass {
    Solid,
    Textured,
}

impl FabricClass {
    pub fn of(facts: &GarmentFacts) -> Self {
        if !facts.pattern.is_solid() || facts.has_textured_fabric() {
            Self::Textured
        } else {
            Self::Solid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QaWeights {
    pub edge: f64,
    pub background: f64,
    pub color: f64,
    pub semantic: f64,
}

pub const QA_WEIGHTS: QaWeights = QaWeights {
    edge: EDGE_WEIGHT,
    background: BACKGROUND_WEIGHT,
    color: COLOR_WEIGHT,
    semantic: SEMANTIC_WEIGHT,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QaSignals {
    pub edge_gate: f64,
    pub background_gate: f64,
    pub color_fidelity: f64,
    pub semantic_alignment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub attempt_number: u32,
    pub edge_gate: f64,
    pub background_gate: f64,
    pub color_fidelity: f64,
    pub semantic_alignment: f64,
    pub qa_total: f64,
    pub weights: QaWeights,
    pub pass_threshold: f64,
    pub passed: bool,
    pub recommendation: Recommendation,
    pub fabric_class: FabricClass,
    pub failed_signals: Vec<QaSignal>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalFloors {
    pub edge_gate: f64,
    pub background_gate: f64,
    pub color_fidelity: f64,
    pub semantic_alignment: f64,
}

impl Default for SignalFloors {
    fn default() -> Self {
        Self {
            edge_gate: 0.8,
            background_gate: 0.95,
            color_fidelity: 0.7,
            semantic_alignment: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QaConfig {
    pub pass_threshold: f64,
    pub max_retries: u32,
    pub solid_delta_e_ceiling: f64,
    pub textured_delta_e_ceiling: f64,
    pub floors: SignalFloors,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.85,
            max_retries: 3,
            solid_delta_e_ceiling: 6.0,
            textured_delta_e_ceiling: 10.0,
            floors: SignalFloors::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum QaError {
    #[error("QA signal '{signal}' out of range [0, 1]: {value}")]
    SignalOutOfRange { signal: String, value: f64 },
    #[error("attempt_number must be >= 1")]
    InvalidAttempt,
    #[error("raw color difference must be finite and >= 0, got {0}")]
    InvalidDeltaE(f64),
    #[error("invalid QA state transition {from:?} -> {to:?}")]
    InvalidTransition { from: QaState, to: QaState },
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    config: QaConfig,
}

impl QualityScorer {
    pub fn new(config: QaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    pub fn delta_e_ceiling(&self, class: FabricClass) -> f64 {
        match class {
            FabricClass::Solid => self.config.solid_delta_e_ceiling,
            FabricClass::Textured => self.config.textured_delta_e_ceiling,
        }
    }

    /// 0 difference maps to 1, the fabric ceiling or beyond maps to 0.
    pub fn color_fidelity(&self, delta_e: f64, facts: &GarmentFacts) -> Result<f64, QaError> {
        if !delta_e.is_finite() || delta_e < 0.0 {
            return Err(QaError::InvalidDeltaE(delta_e));
        }
        let ceiling = self.delta_e_ceiling(FabricClass::of(facts)).max(f64::EPSILON);
        Ok((1.0 - delta_e / ceiling).clamp(0.0, 1.0))
    }

    pub fn score(
        &self,
        signals: &QaSignals,
        attempt_number: u32,
        facts: &GarmentFacts,
    ) -> Result<QaReport, QaError> {
        if attempt_number == 0 {
            return Err(QaError::InvalidAttempt);
        }
        let named = [
            (QaSignal::EdgeGate, signals.edge_gate, self.config.floors.edge_gate),
            (
                QaSignal::BackgroundGate,
                signals.background_gate,
                self.config.floors.background_gate,
            ),
            (
                QaSignal::ColorFidelity,
                signals.color_fidelity,
                self.config.floors.color_fidelity,
            ),
            (
                QaSignal::SemanticAlignment,
                signals.semantic_alignment,
                self.config.floors.semantic_alignment,
            ),
        ];
        for (signal, value, _) in named {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(QaError::SignalOutOfRange {
                    signal: signal.as_str().to_string(),
                    value,
                });
            }
        }

        let qa_total = (EDGE_WEIGHT * signals.edge_gate
            + BACKGROUND_WEIGHT * signals.background_gate
            + COLOR_WEIGHT * signals.color_fidelity
            + SEMANTIC_WEIGHT * signals.semantic_alignment)
            .clamp(0.0, 1.0);
        let passed = qa_total >= self.config.pass_threshold;
        let failed_signals = named
            .iter()
            .filter(|(_, value, floor)| value < floor)
            .map(|(signal, _, _)| *signal)
            .collect::<Vec<_>>();

        let mut warnings = Vec::new();
        let recommendation = if passed {
            Recommendation::Accept
        } else if attempt_number >= self.config.max_retries {
            warnings.push(format!(
                "retries exhausted after attempt {attempt_number}: qa_total {qa_total:.4} below {:.2}",
                self.config.pass_threshold
            ));
            Recommendation::AcceptWithWarning
        } else {
            Recommendation::ReRender
        };

        Ok(QaReport {
            attempt_number,
            edge_gate: signals.edge_gate,
            background_gate: signals.background_gate,
            color_fidelity: signals.color_fidelity,
            semantic_alignment: signals.semantic_alignment,
            qa_total,
            weights: QA_WEIGHTS,
            pass_threshold: self.config.pass_threshold,
            passed,
            recommendation,
            fabric_class: FabricClass::of(facts),
            failed_signals,
            warnings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaState {
    Pending,
    Scoring,
    Accepted,
    ReRender,
    AcceptedWithWarning,
}

impl QaState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use QaState::{Accepted, AcceptedWithWarning, Pending, ReRender, Scoring};

        matches!(
            (self, next),
            (Pending, Scoring)
                | (Scoring, Accepted)
                | (Scoring, ReRender)
                | (Scoring, AcceptedWithWarning)
                | (ReRender, Scoring)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::AcceptedWithWarning)
    }

    pub fn transition(self, next: Self) -> Result<Self, QaError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(QaError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl From<Recommendation> for QaState {
    fn from(value: Recommendation) -> Self {
        match value {
            Recommendation::Accept => Self::Accepted,
            Recommendation::ReRender => Self::ReRender,
            Recommendation::AcceptWithWarning => Self::AcceptedWithWarning,
        }
    }
}
