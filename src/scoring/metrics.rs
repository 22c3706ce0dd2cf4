//! In-process metric measurement for a rendered candidate: edge similarity
//! against the source, background purity outside the garment mask and the
//! perceptual color difference at the garment center.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::facts::GarmentFacts;
use crate::imaging::color::{mean_center_delta_e, parse_hex_rgb};
use crate::imaging::gradient::sobel_magnitude;
use crate::imaging::GrayField;

const SSIM_BLOCK: u32 = 8;
const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricReadings {
    pub edge_similarity: f64,
    pub background_purity: f64,
    pub color_delta_e: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricConfig {
    pub background_brightness: f32,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            background_brightness: 240.0 / 255.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("rendered image has no pixels")]
    EmptyRender,
    #[error("garment color '{0}' is not a hex color")]
    InvalidColor(String),
}

pub fn measure(
    config: &MetricConfig,
    rendered: &RgbImage,
    source: &RgbImage,
    garment_mask: &GrayField,
    facts: &GarmentFacts,
) -> Result<MetricReadings, MetricError> {
    let (width, height) = rendered.dimensions();
    if width == 0 || height == 0 {
        return Err(MetricError::EmptyRender);
    }
    let reference_color = parse_hex_rgb(facts.color.hex.as_str())
        .ok_or_else(|| MetricError::InvalidColor(facts.color.hex.clone()))?;

    let reference = if source.dimensions() == (width, height) {
        source.clone()
    } else {
        imageops::resize(source, width, height, FilterType::Triangle)
    };
    let mask = if garment_mask.dimensions() == (width, height) {
        garment_mask.clone()
    } else {
        GrayField::from_luma8(&imageops::resize(
            &garment_mask.to_luma8(),
            width,
            height,
            FilterType::Triangle,
        ))
    };

    let color_delta_e = mean_center_delta_e(rendered, reference_color)
        .map(f64::from)
        .ok_or(MetricError::EmptyRender)?;

    Ok(MetricReadings {
        edge_similarity: edge_similarity(rendered, &reference),
        background_purity: background_purity(rendered, &mask, config.background_brightness),
        color_delta_e,
    })
}

/// Mean block SSIM between normalized Sobel magnitude maps.
pub fn edge_similarity(rendered: &RgbImage, reference: &RgbImage) -> f64 {
    let a = normalized_edges(&GrayField::luminance_of(rendered));
    let b = normalized_edges(&GrayField::luminance_of(reference));
    if a.dimensions() != b.dimensions() || a.is_empty() {
        return 0.0;
    }
    block_ssim(&a, &b).clamp(0.0, 1.0)
}

fn normalized_edges(luma: &GrayField) -> GrayField {
    let magnitude = sobel_magnitude(luma);
    let peak = magnitude.data().iter().copied().fold(0.0_f32, f32::max);
    if peak <= f32::EPSILON {
        return magnitude;
    }
    magnitude.map(|v| v / peak)
}

fn block_ssim(a: &GrayField, b: &GrayField) -> f64 {
    let (width, height) = a.dimensions();
    let mut total = 0.0_f64;
    let mut blocks = 0_u32;
    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            let x1 = (x + SSIM_BLOCK).min(width);
            let y1 = (y + SSIM_BLOCK).min(height);
            total += window_ssim(a, b, x, y, x1, y1);
            blocks += 1;
            x += SSIM_BLOCK;
        }
        y += SSIM_BLOCK;
    }
    if blocks == 0 {
        return 0.0;
    }
    total / f64::from(blocks)
}

fn window_ssim(a: &GrayField, b: &GrayField, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
    let n = f64::from((x1 - x0) * (y1 - y0));
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for y in y0..y1 {
        for x in x0..x1 {
            sum_a += f64::from(a.get(x, y));
            sum_b += f64::from(b.get(x, y));
        }
    }
    let mean_a = sum_a / n;
    let mean_b = sum_b / n;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for y in y0..y1 {
        for x in x0..x1 {
            let da = f64::from(a.get(x, y)) - mean_a;
            let db = f64::from(b.get(x, y)) - mean_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;
    ((2.0 * mean_a * mean_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mean_a * mean_a + mean_b * mean_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
}

/// Fraction of background pixels (mask below 0.5) at or above the brightness
/// threshold. With no background pixels there is nothing to contaminate.
pub fn background_purity(rendered: &RgbImage, mask: &GrayField, brightness: f32) -> f64 {
    let luma = GrayField::luminance_of(rendered);
    let mut background = 0_u64;
    let mut clean = 0_u64;
    for (l, m) in luma.data().iter().zip(mask.data()) {
        if *m < 0.5 {
            background += 1;
            if *l >= brightness {
                clean += 1;
            }
        }
    }
    if background == 0 {
        return 1.0;
    }
    clean as f64 / background as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{sample_facts, Pattern};
    use image::Rgb;

    fn ghost_render(size: u32, garment: Rgb<u8>, background: Rgb<u8>) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                garment
            } else {
                background
            }
        })
    }

    fn garment_mask(size: u32) -> GrayField {
        GrayField::from_fn(size, size, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn clean_render_scores_well() {
        let navy = Rgb([0x1F, 0x3A, 0x5F]);
        let render = ghost_render(64, navy, Rgb([255, 255, 255]));
        let readings = measure(
            &MetricConfig::default(),
            &render,
            &render,
            &garment_mask(64),
            &sample_facts(Pattern::Solid, 0.2, 0.2),
        )
        .expect("metrics");
        assert!(readings.edge_similarity > 0.99);
        assert_eq!(readings.background_purity, 1.0);
        assert!(readings.color_delta_e < 0.01);
    }

    #[test]
    fn gray_backdrop_lowers_purity() {
        let render = ghost_render(64, Rgb([0x1F, 0x3A, 0x5F]), Rgb([200, 200, 200]));
        assert_eq!(
            background_purity(&render, &garment_mask(64), 240.0 / 255.0),
            0.0
        );
    }

    #[test]
    fn shifted_edges_reduce_similarity() {
        let reference = ghost_render(64, Rgb([0, 0, 0]), Rgb([255, 255, 255]));
        let shifted = RgbImage::from_fn(64, 64, |x, y| {
            if (4..20).contains(&x) && (40..60).contains(&y) {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        assert!(edge_similarity(&shifted, &reference) < edge_similarity(&reference, &reference));
    }

    #[test]
    fn render_size_may_differ_from_source() {
        let navy = Rgb([0x1F, 0x3A, 0x5F]);
        let render = ghost_render(64, navy, Rgb([255, 255, 255]));
        let source = imageops::resize(&render, 32, 32, FilterType::Nearest);
        let mask = GrayField::from_fn(32, 32, |x, y| {
            if (8..24).contains(&x) && (8..24).contains(&y) {
                1.0
            } else {
                0.0
            }
        });
        let readings = measure(
            &MetricConfig::default(),
            &render,
            &source,
            &mask,
            &sample_facts(Pattern::Solid, 0.2, 0.2),
        )
        .expect("metrics");
        assert!(readings.background_purity > 0.9);
        assert!((0.0..=1.0).contains(&readings.edge_similarity));
    }
}
