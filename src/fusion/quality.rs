use crate::imaging::gradient::{edge_pixels, sobel_magnitude};
use crate::imaging::morphology::dilate;
use crate::imaging::{iou, GrayField};

pub const EDGE_WEIGHT: f64 = 0.4;
pub const ENTROPY_WEIGHT: f64 = 0.3;
pub const STABILITY_WEIGHT: f64 = 0.3;

const ENTROPY_BINS: usize = 64;

/// Share of the mask boundary that lands on (or within `tolerance_px` of)
/// an intensity edge of the source. A mask without boundary scores 0.
pub fn edge_alignment(
    source_luma: &GrayField,
    hard_mask: &GrayField,
    edge_threshold: f32,
    tolerance_px: u8,
) -> f64 {
    let boundary = sobel_magnitude(hard_mask);
    let boundary_pixels = boundary
        .data()
        .iter()
        .map(|v| *v > f32::EPSILON)
        .collect::<Vec<_>>();
    let boundary_count = boundary_pixels.iter().filter(|b| **b).count();
    if boundary_count == 0 {
        return 0.0;
    }

    let edges = edge_pixels(source_luma, edge_threshold);
    let edge_field = GrayField::from_fn(source_luma.width(), source_luma.height(), |x, y| {
        if edges[(y as usize) * (source_luma.width() as usize) + x as usize] {
            1.0
        } else {
            0.0
        }
    });
    let near_edge = dilate(&edge_field, tolerance_px).above(0.5);
    let hits = boundary_pixels
        .iter()
        .zip(near_edge.iter())
        .filter(|(b, e)| **b && **e)
        .count();
    (hits as f64 / boundary_count as f64).clamp(0.0, 1.0)
}

/// Histogram entropy of the pre-threshold mask, mapped so a clean two-level
/// mask (at most 1 bit) scores 1 and a uniform spread scores 0.
pub fn entropy_score(combined: &GrayField) -> f64 {
    if combined.is_empty() {
        return 0.0;
    }
    let mut histogram = [0_usize; ENTROPY_BINS];
    for v in combined.data() {
        let bin = ((v.clamp(0.0, 1.0) * ENTROPY_BINS as f32) as usize).min(ENTROPY_BINS - 1);
        histogram[bin] += 1;
    }
    let total = combined.len() as f64;
    let entropy = histogram
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum::<f64>();
    let max_entropy = (ENTROPY_BINS as f64).log2();
    (1.0 - (entropy - 1.0).max(0.0) / (max_entropy - 1.0)).clamp(0.0, 1.0)
}

/// IoU between the masks obtained at `cutoff - delta` and `cutoff + delta`.
pub fn stability(combined: &GrayField, cutoff: f32, delta: f32) -> f64 {
    let low = combined.above(cutoff - delta);
    let high = combined.above(cutoff + delta);
    f64::from(iou(&low, &high))
}

pub fn overall_score(edge_alignment: f64, entropy: f64, stability: f64) -> f64 {
    (EDGE_WEIGHT * edge_alignment + ENTROPY_WEIGHT * entropy + STABILITY_WEIGHT * stability)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(width: u32, height: u32, inset: u32) -> GrayField {
        GrayField::from_fn(width, height, |x, y| {
            if x >= inset && x < width - inset && y >= inset && y < height - inset {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn aligned_mask_scores_high_edge_alignment() {
        let source = rect(40, 40, 10);
        let score = edge_alignment(&source, &rect(40, 40, 10), 0.2, 1);
        assert!(score > 0.95, "score {score}");
    }

    #[test]
    fn misplaced_mask_scores_low_edge_alignment() {
        let source = rect(60, 60, 5);
        let score = edge_alignment(&source, &rect(60, 60, 20), 0.2, 1);
        assert!(score < 0.1, "score {score}");
    }

    #[test]
    fn empty_mask_has_zero_edge_alignment() {
        let source = rect(20, 20, 5);
        assert_eq!(edge_alignment(&source, &GrayField::filled(20, 20, 0.0), 0.2, 1), 0.0);
    }

    #[test]
    fn entropy_is_one_for_binary_and_zero_for_uniform() {
        assert_eq!(entropy_score(&rect(16, 16, 4)), 1.0);
        let uniform = GrayField::from_fn(64, 1, |x, _| (x as f32 + 0.5) / 64.0);
        assert!(entropy_score(&uniform) < 1e-9);
    }

    #[test]
    fn stability_without_perturbation_is_one() {
        let combined = GrayField::from_fn(10, 10, |x, y| ((x + y) as f32) / 18.0);
        assert_eq!(stability(&combined, 0.5, 0.0), 1.0);
        let perturbed = stability(&combined, 0.5, 0.2);
        assert!(perturbed < 1.0 && perturbed > 0.0);
    }

    #[test]
    fn overall_score_is_the_documented_blend() {
        assert!((overall_score(1.0, 0.5, 0.0) - 0.55).abs() < 1e-12);
        assert_eq!(overall_score(1.0, 1.0, 1.0), 1.0);
        assert_eq!(overall_score(0.0, 0.0, 0.0), 0.0);
    }
}
