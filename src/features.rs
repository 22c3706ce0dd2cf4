//! Lightweight scene context taken from the source photograph: dominant
//! colors, pattern complexity, text regions and exposure/contrast.
//!
//! Everything here is deterministic. Color clustering is seeded and runs a
//! fixed number of Lloyd iterations, so the same image always yields the
//! same ordered palette.

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imaging::color::rgb_to_hex;
use crate::imaging::gradient::edge_pixels;
use crate::imaging::GrayField;

const SPECTRUM_SIZE: u32 = 64;
const TEXT_WORKING_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternComplexity {
    Low,
    Medium,
    High,
}

impl PatternComplexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub dominant_colors: Vec<String>,
    pub pattern_complexity: PatternComplexity,
    pub text_detected: bool,
    pub text_boxes: Vec<[u32; 4]>,
    pub exposure: f64,
    pub contrast: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub max_colors: usize,
    pub clustering_seed: u64,
    pub kmeans_iterations: usize,
    pub sample_limit: usize,
    pub frequency_cutoff: f32,
    pub pattern_threshold: f32,
    pub detect_text: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_colors: 5,
            clustering_seed: 42,
            kmeans_iterations: 10,
            sample_limit: 4096,
            frequency_cutoff: 0.25,
            pattern_threshold: 0.3,
            detect_text: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("source image has no pixels")]
    EmptyImage,
    #[error("max_colors must be >= 1")]
    InvalidColorCount,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn extract(&self, image: &RgbImage) -> Result<FeatureSet, FeatureError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(FeatureError::EmptyImage);
        }
        if self.config.max_colors == 0 {
            return Err(FeatureError::InvalidColorCount);
        }

        let luminance = GrayField::luminance_of(image);
        let (exposure, contrast) = exposure_and_contrast(&luminance);
        let ratio = high_frequency_ratio(image, self.config.frequency_cutoff);
        let text_boxes = if self.config.detect_text {
            detect_text_boxes(image)
        } else {
            Vec::new()
        };

        Ok(FeatureSet {
            dominant_colors: dominant_colors(image, &self.config),
            pattern_complexity: classify_complexity(ratio, self.config.pattern_threshold),
            text_detected: !text_boxes.is_empty(),
            text_boxes,
            exposure,
            contrast,
        })
    }
}

fn exposure_and_contrast(luminance: &GrayField) -> (f64, f64) {
    let n = luminance.len() as f64;
    let mean = luminance.data().iter().map(|v| f64::from(*v)).sum::<f64>() / n;
    let variance = luminance
        .data()
        .iter()
        .map(|v| (f64::from(*v) - mean).powi(2))
        .sum::<f64>()
        / n;
    // Luma std peaks at 0.5 for a half-black, half-white frame.
    (mean.clamp(0.0, 1.0), (variance.sqrt() * 2.0).clamp(0.0, 1.0))
}

pub fn classify_complexity(ratio: f32, threshold: f32) -> PatternComplexity {
    if ratio >= threshold {
        PatternComplexity::High
    } else if ratio >= threshold / 2.0 {
        PatternComplexity::Medium
    } else {
        PatternComplexity::Low
    }
}

fn dominant_colors(image: &RgbImage, config: &FeatureConfig) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(config.clustering_seed);
    let total = (image.width() as usize) * (image.height() as usize);
    let samples: Vec<[f32; 3]> = if total <= config.sample_limit {
        image.pixels().map(|p| rgb_f32(p.0)).collect()
    } else {
        let mut indices = rand::seq::index::sample(&mut rng, total, config.sample_limit).into_vec();
        indices.sort_unstable();
        let raw = image.as_raw();
        indices
            .into_iter()
            .map(|i| rgb_f32([raw[i * 3], raw[i * 3 + 1], raw[i * 3 + 2]]))
            .collect()
    };

    let mut centers = kmeans_plus_plus_init(&samples, config.max_colors, &mut rng);
    let mut assignment = vec![0_usize; samples.len()];
    for _ in 0..config.kmeans_iterations {
        assign(&samples, &centers, &mut assignment);
        let mut sums = vec![[0.0_f64; 3]; centers.len()];
        let mut counts = vec![0_usize; centers.len()];
        for (sample, cluster) in samples.iter().zip(assignment.iter()) {
            for c in 0..3 {
                sums[*cluster][c] += f64::from(sample[c]);
            }
            counts[*cluster] += 1;
        }
        for (i, center) in centers.iter_mut().enumerate() {
            if counts[i] == 0 {
                continue;
            }
            for c in 0..3 {
                center[c] = (sums[i][c] / counts[i] as f64) as f32;
            }
        }
    }
    assign(&samples, &centers, &mut assignment);

    let mut by_hex = BTreeMap::<String, usize>::new();
    for cluster in &assignment {
        let center = centers[*cluster];
        let hex = rgb_to_hex([
            center[0].round().clamp(0.0, 255.0) as u8,
            center[1].round().clamp(0.0, 255.0) as u8,
            center[2].round().clamp(0.0, 255.0) as u8,
        ]);
        *by_hex.entry(hex).or_default() += 1;
    }
    let mut ranked = by_hex.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(config.max_colors)
        .map(|(hex, _)| hex)
        .collect()
}

fn rgb_f32(rgb: [u8; 3]) -> [f32; 3] {
    [f32::from(rgb[0]), f32::from(rgb[1]), f32::from(rgb[2])]
}

fn distance_sq(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

fn kmeans_plus_plus_init(samples: &[[f32; 3]], k: usize, rng: &mut StdRng) -> Vec<[f32; 3]> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut centers = vec![samples[rng.gen_range(0..samples.len())]];
    let mut nearest = samples
        .iter()
        .map(|s| distance_sq(s, &centers[0]))
        .collect::<Vec<_>>();
    while centers.len() < k {
        let total = nearest.iter().map(|d| f64::from(*d)).sum::<f64>();
        if total <= f64::EPSILON {
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut chosen = samples.len() - 1;
        for (i, d) in nearest.iter().enumerate() {
            target -= f64::from(*d);
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        let center = samples[chosen];
        for (d, s) in nearest.iter_mut().zip(samples.iter()) {
            *d = d.min(distance_sq(s, &center));
        }
        centers.push(center);
    }
    centers
}

fn assign(samples: &[[f32; 3]], centers: &[[f32; 3]], assignment: &mut [usize]) {
    for (sample, slot) in samples.iter().zip(assignment.iter_mut()) {
        let mut best = 0_usize;
        let mut best_d = f32::MAX;
        for (i, center) in centers.iter().enumerate() {
            let d = distance_sq(sample, center);
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        *slot = best;
    }
}

/// Share of spectral energy (DC excluded) whose normalized radial frequency
/// lies above `cutoff`, measured on a fixed-size luminance thumbnail.
pub fn high_frequency_ratio(image: &RgbImage, cutoff: f32) -> f32 {
    let gray = imageops::grayscale(image);
    let thumb = imageops::resize(&gray, SPECTRUM_SIZE, SPECTRUM_SIZE, FilterType::Triangle);
    let n = SPECTRUM_SIZE as usize;
    let mut values = thumb
        .pixels()
        .map(|p| f64::from(p.0[0]) / 255.0)
        .collect::<Vec<_>>();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    for v in values.iter_mut() {
        *v -= mean;
    }

    let (cos_table, sin_table): (Vec<f64>, Vec<f64>) = (0..n)
        .map(|k| {
            let angle = -2.0 * std::f64::consts::PI * k as f64 / n as f64;
            (angle.cos(), angle.sin())
        })
        .unzip();

    // Row transform of the real input, then column transform of the complex rows.
    let mut rows = vec![(0.0_f64, 0.0_f64); n * n];
    for y in 0..n {
        for u in 0..n {
            let mut re = 0.0;
            let mut im = 0.0;
            for x in 0..n {
                let t = (u * x) % n;
                let v = values[y * n + x];
                re += v * cos_table[t];
                im += v * sin_table[t];
            }
            rows[y * n + u] = (re, im);
        }
    }

    let half = n as f64 / 2.0;
    let mut total = 0.0_f64;
    let mut high = 0.0_f64;
    for u in 0..n {
        for v in 0..n {
            let mut re = 0.0;
            let mut im = 0.0;
            for y in 0..n {
                let t = (v * y) % n;
                let (a, b) = rows[y * n + u];
                re += a * cos_table[t] - b * sin_table[t];
                im += a * sin_table[t] + b * cos_table[t];
            }
            if u == 0 && v == 0 {
                continue;
            }
            let energy = re * re + im * im;
            let fu = u.min(n - u) as f64 / half;
            let fv = v.min(n - v) as f64 / half;
            total += energy;
            if (fu * fu + fv * fv).sqrt() > f64::from(cutoff) {
                high += energy;
            }
        }
    }
    if total <= 1e-12 {
        return 0.0;
    }
    (high / total) as f32
}

#[derive(Debug, Clone, Copy)]
struct PixelBox {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl PixelBox {
    fn width(&self) -> u32 {
        self.x1 - self.x0 + 1
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0 + 1
    }

    fn include(&mut self, x: u32, y: u32) {
        self.x0 = self.x0.min(x);
        self.y0 = self.y0.min(y);
        self.x1 = self.x1.max(x);
        self.y1 = self.y1.max(y);
    }

    fn merge(&mut self, other: &Self) {
        self.include(other.x0, other.y0);
        self.include(other.x1, other.y1);
    }
}

/// Heuristic text finder: small edge blobs of similar height lined up
/// horizontally are grouped into lines; a line of three or more glyph-sized
/// blobs is reported as a text box `[x, y, w, h]` in source coordinates.
pub fn detect_text_boxes(image: &RgbImage) -> Vec<[u32; 4]> {
    let (width, height) = image.dimensions();
    let scale = (TEXT_WORKING_SIZE as f32 / width.max(height) as f32).min(1.0);
    let working = if scale < 1.0 {
        imageops::resize(
            image,
            ((width as f32 * scale).round() as u32).max(1),
            ((height as f32 * scale).round() as u32).max(1),
            FilterType::Triangle,
        )
    } else {
        image.clone()
    };
    let (w, h) = working.dimensions();
    let edges = edge_pixels(&GrayField::luminance_of(&working), 0.3);
    let edge_image = GrayImage::from_fn(w, h, |x, y| {
        Luma([if edges[(y as usize) * (w as usize) + x as usize] {
            255
        } else {
            0
        }])
    });
    let labels = connected_components(&edge_image, Connectivity::Eight, Luma([0_u8]));

    let mut components = BTreeMap::<u32, PixelBox>::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0];
        if id == 0 {
            continue;
        }
        components
            .entry(id)
            .and_modify(|b| b.include(x, y))
            .or_insert(PixelBox {
                x0: x,
                y0: y,
                x1: x,
                y1: y,
            });
    }

    let min_glyph = 4_u32;
    let max_glyph = ((h as f32) * 0.15).max(min_glyph as f32) as u32;
    let mut glyphs = components
        .into_values()
        .filter(|b| {
            let gh = b.height();
            let gw = b.width();
            (min_glyph..=max_glyph).contains(&gh) && gw <= gh * 3 && gw >= 2
        })
        .collect::<Vec<_>>();
    glyphs.sort_by_key(|b| (b.y0, b.x0));

    let mut lines = Vec::<(PixelBox, usize)>::new();
    for glyph in glyphs {
        let joined = lines.iter_mut().find(|(line, _)| {
            let overlap = glyph.y1.min(line.y1) as i64 - glyph.y0.max(line.y0) as i64;
            let similar = glyph.height().abs_diff(line.height()) * 2 <= line.height();
            let gap = glyph.x0 as i64 - line.x1 as i64;
            overlap > 0 && similar && gap <= i64::from(line.height()) && gap >= -(line.width() as i64)
        });
        match joined {
            Some((line, count)) => {
                line.merge(&glyph);
                *count += 1;
            }
            None => lines.push((glyph, 1)),
        }
    }

    let inverse = 1.0 / scale;
    let mut boxes = lines
        .into_iter()
        .filter(|(line, count)| *count >= 3 && line.width() >= line.height() * 2)
        .map(|(line, _)| {
            [
                (line.x0 as f32 * inverse) as u32,
                (line.y0 as f32 * inverse) as u32,
                ((line.width() as f32 * inverse).round() as u32).min(width),
                ((line.height() as f32 * inverse).round() as u32).min(height),
            ]
        })
        .collect::<Vec<_>>();
    boxes.sort_by_key(|b| (b[1], b[0]));
    boxes
}
