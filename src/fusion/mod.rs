//! Mask fusion: several independent soft garment masks plus an optional
//! subtract mask become one scored garment mask.
//!
//! Stage order is fixed: weighted combine, subtract, threshold, blur,
//! dilate, feather. Scoring reads the pre-threshold combination (entropy,
//! stability) and the final binary mask (edge alignment).

pub mod quality;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::imaging::morphology::{dilate, feather, gaussian_blur};
use crate::imaging::{GrayField, ImagingError};

pub const SOURCE_RMBG: &str = "rmbg";
pub const SOURCE_U2NET: &str = "u2net";
pub const SOURCE_HUMAN_SUBTRACT: &str = "human-subtract";

const DEGENERATE_EPSILON: f32 = 1e-3;

pub fn default_source_weight(source: &str) -> f32 {
    match source {
        SOURCE_RMBG => 0.6,
        SOURCE_U2NET => 0.4,
        _ => 0.5,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftMask {
    pub source: String,
    pub weight: f32,
    pub field: GrayField,
}

impl SoftMask {
    pub fn new(source: impl Into<String>, field: GrayField) -> Self {
        let source = source.into();
        Self {
            weight: default_source_weight(source.as_str()),
            source,
            field,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// All-background or all-foreground within a small tolerance.
    pub fn is_degenerate(&self) -> bool {
        let data = self.field.data();
        data.iter().all(|v| *v <= DEGENERATE_EPSILON)
            || data.iter().all(|v| *v >= 1.0 - DEGENERATE_EPSILON)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskQuality {
    pub edge_alignment: f64,
    #[serde(rename = "mask_entropy")]
    pub entropy: f64,
    pub stability: f64,
    #[serde(rename = "mask_quality_score")]
    pub overall_score: f64,
    #[serde(rename = "mask_weights")]
    pub weights: BTreeMap<String, f64>,
}

impl MaskQuality {
    fn zeroed(weights: BTreeMap<String, f64>) -> Self {
        Self {
            edge_alignment: 0.0,
            entropy: 0.0,
            stability: 0.0,
            overall_score: 0.0,
            weights,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedMask {
    /// Feathered garment mask in [0, 1].
    pub soft: GrayField,
    /// `soft` binarized at 0.5.
    pub hard: GrayField,
    pub quality: MaskQuality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionParams {
    pub cutoff: f32,
    pub delta: f32,
    pub blur_sigma: f32,
    pub dilation_radius: u8,
    pub feather_sigma: f32,
    pub edge_threshold: f32,
    pub edge_tolerance_px: u8,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            cutoff: 0.5,
            delta: 0.05,
            blur_sigma: 1.0,
            dilation_radius: 1,
            feather_sigma: 1.0,
            edge_threshold: 0.2,
            edge_tolerance_px: 2,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FusionError {
    #[error("at least one soft mask is required")]
    NoMasks,
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error("mask weight for '{source_tag}' must be finite and >= 0, got {weight}")]
    InvalidWeight { source_tag: String, weight: f32 },
    #[error("mask weights sum to zero")]
    ZeroTotalWeight,
    #[error("invalid fusion parameter '{field}': {message}")]
    InvalidParams { field: String, message: String },
    #[error("degenerate mask input: {reason}")]
    DegenerateMask {
        reason: String,
        quality: MaskQuality,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MaskFusionEngine {
    params: FusionParams,
}

impl MaskFusionEngine {
    pub fn new(params: FusionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    /// `weights` overrides per-source weights; sources not listed keep the
    /// mask's own weight. Weights are normalized by their sum.
    pub fn fuse(
        &self,
        source_luma: &GrayField,
        masks: &[SoftMask],
        subtract: Option<&SoftMask>,
        weights: &BTreeMap<String, f32>,
    ) -> Result<FusedMask, FusionError> {
        self.validate_params()?;
        let Some(first) = masks.first() else {
            return Err(FusionError::NoMasks);
        };
        source_luma.ensure_same_size(&first.field)?;
        for mask in masks.iter().skip(1) {
            first.field.ensure_same_size(&mask.field)?;
        }
        if let Some(subtract) = subtract {
            first.field.ensure_same_size(&subtract.field)?;
        }

        let resolved = masks
            .iter()
            .map(|mask| {
                let weight = weights
                    .get(mask.source.as_str())
                    .copied()
                    .unwrap_or(mask.weight);
                if !weight.is_finite() || weight < 0.0 {
                    return Err(FusionError::InvalidWeight {
                        source_tag: mask.source.clone(),
                        weight,
                    });
                }
                Ok((mask, weight))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total_weight = resolved.iter().map(|(_, w)| f64::from(*w)).sum::<f64>();
        if total_weight <= f64::EPSILON {
            return Err(FusionError::ZeroTotalWeight);
        }
        let mut used_weights = BTreeMap::<String, f64>::new();
        for (mask, weight) in &resolved {
            *used_weights.entry(mask.source.clone()).or_default() +=
                f64::from(*weight) / total_weight;
        }

        if masks.iter().all(SoftMask::is_degenerate) {
            return Err(FusionError::DegenerateMask {
                reason: String::from("all input masks are all-zero or all-one"),
                quality: MaskQuality::zeroed(used_weights),
            });
        }

        let (width, height) = first.field.dimensions();
        let mut combined = vec![0.0_f32; first.field.len()];
        for (mask, weight) in &resolved {
            let w = (f64::from(*weight) / total_weight) as f32;
            for (acc, v) in combined.iter_mut().zip(mask.field.data()) {
                *acc += w * v.clamp(0.0, 1.0);
            }
        }
        let mut combined = GrayField::new(width, height, combined)?;
        if let Some(subtract) = subtract {
            combined = combined.zip_map(&subtract.field, |c, s| c * (1.0 - s.clamp(0.0, 1.0)))?;
        }

        let hard = combined.threshold(self.params.cutoff);
        let coverage = hard.coverage(0.5);
        if coverage <= 0.0 || coverage >= 1.0 {
            return Err(FusionError::DegenerateMask {
                reason: format!("thresholded mask coverage is {coverage:.3}"),
                quality: MaskQuality::zeroed(used_weights),
            });
        }

        let smoothed = gaussian_blur(&hard, self.params.blur_sigma);
        let dilated = dilate(&smoothed, self.params.dilation_radius);
        let soft = feather(&dilated, self.params.feather_sigma);
        let binary = soft.threshold(0.5);

        let edge_alignment = quality::edge_alignment(
            source_luma,
            &binary,
            self.params.edge_threshold,
            self.params.edge_tolerance_px,
        );
        let entropy = quality::entropy_score(&combined);
        let stability = quality::stability(&combined, self.params.cutoff, self.params.delta);
        let overall_score = quality::overall_score(edge_alignment, entropy, stability);
        debug!(
            edge_alignment,
            entropy, stability, overall_score, coverage, "fused garment mask"
        );

        Ok(FusedMask {
            soft,
            hard: binary,
            quality: MaskQuality {
                edge_alignment,
                entropy,
                stability,
                overall_score,
                weights: used_weights,
            },
        })
    }

    fn validate_params(&self) -> Result<(), FusionError> {
        let p = &self.params;
        let checks = [
            ("cutoff", p.cutoff > 0.0 && p.cutoff < 1.0),
            ("delta", p.delta >= 0.0 && p.delta < p.cutoff.min(1.0 - p.cutoff)),
            ("blur_sigma", p.blur_sigma >= 0.0 && p.blur_sigma.is_finite()),
            ("feather_sigma", p.feather_sigma >= 0.0 && p.feather_sigma.is_finite()),
            ("edge_threshold", p.edge_threshold > 0.0 && p.edge_threshold <= 1.0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(FusionError::InvalidParams {
                    field: field.to_string(),
                    message: String::from("value out of range"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u32 = 48;

    fn garment_field(inset: u32, value: f32) -> GrayField {
        GrayField::from_fn(SIZE, SIZE, |x, y| {
            if x >= inset && x < SIZE - inset && y >= inset && y < SIZE - inset {
                value
            } else {
                0.0
            }
        })
    }

    fn source() -> GrayField {
        // Dark garment on a white backdrop.
        garment_field(12, 1.0).map(|v| 1.0 - 0.8 * v)
    }

    #[test]
    fn fuses_agreeing_masks_with_high_quality() {
        let masks = vec![
            SoftMask::new(SOURCE_RMBG, garment_field(12, 0.95)),
            SoftMask::new(SOURCE_U2NET, garment_field(12, 0.9)),
        ];
        let fused = MaskFusionEngine::default()
            .fuse(&source(), &masks, None, &BTreeMap::new())
            .expect("fusion should succeed");

        let q = &fused.quality;
        assert!(q.overall_score > 0.8, "quality {q:?}");
        assert!((0.0..=1.0).contains(&q.overall_score));
        assert!((q.weights[SOURCE_RMBG] - 0.6).abs() < 1e-6);
        assert!((q.weights[SOURCE_U2NET] - 0.4).abs() < 1e-6);
        assert_eq!(fused.hard.get(24, 24), 1.0);
        assert_eq!(fused.hard.get(1, 1), 0.0);
    }

    #[test]
    fn weight_overrides_are_normalized() {
        let masks = vec![
            SoftMask::new(SOURCE_RMBG, garment_field(12, 1.0)),
            SoftMask::new(SOURCE_U2NET, garment_field(12, 1.0)),
        ];
        let weights = BTreeMap::from([
            (String::from(SOURCE_RMBG), 3.0_f32),
            (String::from(SOURCE_U2NET), 1.0_f32),
        ]);
        let fused = MaskFusionEngine::default()
            .fuse(&source(), &masks, None, &weights)
            .expect("fusion");
        assert!((fused.quality.weights[SOURCE_RMBG] - 0.75).abs() < 1e-9);
        assert!((fused.quality.weights.values().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn subtract_mask_removes_region() {
        let masks = vec![SoftMask::new(SOURCE_RMBG, garment_field(8, 1.0))];
        let human = SoftMask::new(
            SOURCE_HUMAN_SUBTRACT,
            GrayField::from_fn(SIZE, SIZE, |_, y| if y < 20 { 1.0 } else { 0.0 }),
        );
        let fused = MaskFusionEngine::default()
            .fuse(&source(), &masks, Some(&human), &BTreeMap::new())
            .expect("fusion");
        assert_eq!(fused.hard.get(24, 10), 0.0);
        assert_eq!(fused.hard.get(24, 30), 1.0);
    }

    #[test]
    fn all_zero_and_all_one_masks_are_degenerate() {
        for value in [0.0_f32, 1.0] {
            let masks = vec![
                SoftMask::new(SOURCE_RMBG, GrayField::filled(SIZE, SIZE, value)),
                SoftMask::new(SOURCE_U2NET, GrayField::filled(SIZE, SIZE, value)),
            ];
            let err = MaskFusionEngine::default()
                .fuse(&source(), &masks, None, &BTreeMap::new())
                .expect_err("degenerate input");
            match err {
                FusionError::DegenerateMask { quality, .. } => {
                    assert_eq!(quality.overall_score, 0.0)
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn mismatched_resolution_is_rejected() {
        let masks = vec![
            SoftMask::new(SOURCE_RMBG, garment_field(12, 1.0)),
            SoftMask::new(SOURCE_U2NET, GrayField::filled(SIZE + 1, SIZE, 0.5)),
        ];
        let err = MaskFusionEngine::default()
            .fuse(&source(), &masks, None, &BTreeMap::new())
            .expect_err("resolution mismatch");
        assert!(matches!(err, FusionError::Imaging(ImagingError::ResolutionMismatch { .. })));
    }

    #[test]
    fn zero_weights_and_empty_input_are_errors() {
        let engine = MaskFusionEngine::default();
        assert_eq!(
            engine.fuse(&source(), &[], None, &BTreeMap::new()),
            Err(FusionError::NoMasks)
        );
        let masks = vec![SoftMask::new(SOURCE_RMBG, garment_field(12, 1.0)).with_weight(0.0)];
        assert_eq!(
            engine.fuse(&source(), &masks, None, &BTreeMap::new()),
            Err(FusionError::ZeroTotalWeight)
        );
    }

    #[test]
    fn quality_serializes_with_report_keys() {
        let quality = MaskQuality::zeroed(BTreeMap::from([(String::from(SOURCE_RMBG), 1.0)]));
        let value = serde_json::to_value(&quality).expect("serialize");
        assert_eq!(value["mask_quality_score"], serde_json::json!(0.0));
        assert_eq!(value["mask_weights"]["rmbg"], serde_json::json!(1.0));
        assert!(value.get("mask_entropy").is_some());
    }
}
