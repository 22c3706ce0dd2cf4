//! Backend and auxiliary-conditioning selection for each generation attempt.
//!
//! `RoutingPolicy::route` is a pure function of the facts, the attempt
//! number and the previous attempt's outcome, so any decision can be
//! replayed offline from a recorded report.

use serde::{Deserialize, Serialize};

use crate::facts::GarmentFacts;
use crate::scoring::QaSignal;

/// Ordered by capacity: `Primary < Secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Primary,
    Secondary,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub attempt_number: u32,
    pub backend: Backend,
    pub use_auxiliary_conditioning: bool,
    pub conditioning_weight: f64,
    pub escalated: bool,
    pub reasons: Vec<String>,
}

/// What the policy needs to know about the previous attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorAttempt {
    pub decision: RoutingDecision,
    pub failed_signals: Vec<QaSignal>,
}

impl PriorAttempt {
    fn failed_on_semantic_or_color(&self) -> bool {
        self.failed_signals
            .iter()
            .any(|s| matches!(s, QaSignal::SemanticAlignment | QaSignal::ColorFidelity))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    pub risk_threshold: f64,
    pub conditioning_threshold: f64,
    pub conditioning_weight_min: f64,
    pub conditioning_weight_max: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 0.6,
            conditioning_threshold: 0.5,
            conditioning_weight_min: 0.5,
            conditioning_weight_max: 0.9,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    config: RoutingConfig,
}

impl RoutingPolicy {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn route(
        &self,
        facts: &GarmentFacts,
        attempt_number: u32,
        prior: Option<&PriorAttempt>,
    ) -> RoutingDecision {
        let cfg = &self.config;
        let patterned = !facts.pattern.is_solid();
        let mut reasons = Vec::<String>::new();

        let mut backend = if patterned {
            reasons.push(format!("pattern is {}", facts.pattern));
            Backend::Secondary
        } else if facts.risk_score > cfg.risk_threshold {
            reasons.push(format!(
                "risk_score {:.2} above {:.2}",
                facts.risk_score, cfg.risk_threshold
            ));
            Backend::Secondary
        } else {
            Backend::Primary
        };

        let mut use_auxiliary_conditioning =
            patterned && facts.complexity_score > cfg.conditioning_threshold;
        let mut conditioning_weight = if use_auxiliary_conditioning {
            reasons.push(format!(
                "complexity_score {:.2} above {:.2}",
                facts.complexity_score, cfg.conditioning_threshold
            ));
            self.conditioning_weight_for(facts.complexity_score)
        } else {
            0.0
        };

        let mut escalated = false;
        if let Some(prior) = prior.filter(|_| attempt_number > 1) {
            let previous = &prior.decision;
            if previous.backend > backend {
                backend = previous.backend;
            }
            if previous.use_auxiliary_conditioning {
                use_auxiliary_conditioning = true;
                conditioning_weight = conditioning_weight.max(previous.conditioning_weight);
            }
            if prior.failed_on_semantic_or_color() {
                escalated = true;
                match previous.backend {
                    Backend::Primary => {
                        backend = Backend::Secondary;
                        reasons.push(String::from(
                            "escalated to secondary after semantic/color failure",
                        ));
                    }
                    Backend::Secondary => {
                        let step = (cfg.conditioning_weight_max - cfg.conditioning_weight_min) / 2.0;
                        use_auxiliary_conditioning = true;
                        conditioning_weight = (conditioning_weight
                            .max(previous.conditioning_weight)
                            .max(cfg.conditioning_weight_min)
                            + step)
                            .min(cfg.conditioning_weight_max);
                        reasons.push(String::from(
                            "escalated auxiliary conditioning after semantic/color failure",
                        ));
                    }
                }
            }
        }

        RoutingDecision {
            attempt_number,
            backend,
            use_auxiliary_conditioning,
            conditioning_weight: conditioning_weight.clamp(0.0, 1.0),
            escalated,
            reasons,
        }
    }

    /// Linear over the active range: the threshold maps to the band minimum,
    /// complexity 1.0 to the band maximum.
    fn conditioning_weight_for(&self, complexity: f64) -> f64 {
        let cfg = &self.config;
        let span = (1.0 - cfg.conditioning_threshold).max(f64::EPSILON);
        let t = ((complexity - cfg.conditioning_threshold) / span).clamp(0.0, 1.0);
        cfg.conditioning_weight_min + (cfg.conditioning_weight_max - cfg.conditioning_weight_min) * t
    }
}
