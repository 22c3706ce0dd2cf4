pub mod color;
pub mod gradient;
pub mod morphology;

use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use thiserror::Error;

pub type LumaF32Image = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImagingError {
    #[error("field buffer length {actual} does not match {width}x{height}")]
    BufferSize {
        width: u32,
        height: u32,
        actual: usize,
    },
    #[error("resolution mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    ResolutionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
    #[error("image has no pixels")]
    EmptyImage,
}

/// Row-major per-pixel scalar field, used for soft masks and luminance.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayField {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl GrayField {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, ImagingError> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(ImagingError::BufferSize {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; (width as usize) * (height as usize)],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_luma8(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect(),
        }
    }

    /// Rec. 601 luma in [0, 1].
    pub fn luminance_of(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.pixels().map(|p| luma_601(p.0)).collect(),
        }
    }

    pub fn from_luma_f32(image: LumaF32Image) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn to_luma_f32(&self) -> LumaF32Image {
        ImageBuffer::from_fn(self.width, self.height, |x, y| Luma([self.get(x, y)]))
    }

    pub fn to_luma8(&self) -> GrayImage {
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y as usize) * (self.width as usize) + (x as usize)]
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    pub fn zip_map(
        &self,
        other: &Self,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Self, ImagingError> {
        self.ensure_same_size(other)?;
        Ok(Self {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }

    pub fn ensure_same_size(&self, other: &Self) -> Result<(), ImagingError> {
        if self.dimensions() == other.dimensions() {
            return Ok(());
        }
        Err(ImagingError::ResolutionMismatch {
            expected_width: self.width,
            expected_height: self.height,
            width: other.width,
            height: other.height,
        })
    }

    /// Pixels at or above `cutoff` become 1, everything else 0.
    pub fn threshold(&self, cutoff: f32) -> Self {
        self.map(|v| if v >= cutoff { 1.0 } else { 0.0 })
    }

    pub fn above(&self, cutoff: f32) -> Vec<bool> {
        self.data.iter().map(|v| *v >= cutoff).collect()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Fraction of pixels at or above `cutoff`.
    pub fn coverage(&self, cutoff: f32) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().filter(|v| **v >= cutoff).count() as f32 / self.data.len() as f32
    }

    /// Axis-aligned bounds `[x, y, w, h]` of pixels at or above `cutoff`.
    pub fn bounding_box(&self, cutoff: f32) -> Option<[u32; 4]> {
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0_u32;
        let mut max_y = 0_u32;
        let mut any = false;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) >= cutoff {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        any.then(|| [min_x, min_y, max_x - min_x + 1, max_y - min_y + 1])
    }
}

pub fn luma_601(rgb: [u8; 3]) -> f32 {
    let [r, g, b] = rgb;
    (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)) / 255.0
}

/// Intersection-over-union of two boolean masks. Two empty masks are
/// identical, so they score 1.
pub fn iou(a: &[bool], b: &[bool]) -> f32 {
    let mut intersection = 0_usize;
    let mut union = 0_usize;
    for (pa, pb) in a.iter().zip(b.iter()) {
        if *pa && *pb {
            intersection += 1;
        }
        if *pa || *pb {
            union += 1;
        }
    }
    if union == 0 {
        return 1.0;
    }
    intersection as f32 / union as f32
}
