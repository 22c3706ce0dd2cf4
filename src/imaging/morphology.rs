use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;

use super::GrayField;

pub fn gaussian_blur(field: &GrayField, sigma: f32) -> GrayField {
    if sigma <= 0.0 || field.is_empty() {
        return field.clone();
    }
    GrayField::from_luma_f32(gaussian_blur_f32(&field.to_luma_f32(), sigma))
}

/// Grey-level dilation with a square structuring element of the given radius.
/// Values are quantized to 8 bits for the max filter.
pub fn dilate(field: &GrayField, radius: u8) -> GrayField {
    if radius == 0 || field.is_empty() {
        return field.clone();
    }
    let dilated = imageproc::morphology::dilate(&field.to_luma8(), Norm::LInf, radius);
    GrayField::from_luma8(&dilated)
}

/// Soft ramp across the mask boundary; interior and exterior far from the
/// edge keep their values.
pub fn feather(field: &GrayField, sigma: f32) -> GrayField {
    gaussian_blur(field, sigma).map(|v| v.clamp(0.0, 1.0))
}
