use image::RgbImage;
use palette::color_difference::Ciede2000;
use palette::white_point::D65;
use palette::{FromColor, Lab, Srgb};

pub fn parse_hex_rgb(value: &str) -> Option<[u8; 3]> {
    let trimmed = value.trim().trim_start_matches('#');
    if trimmed.len() != 6 || !trimmed.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&trimmed[0..2], 16).ok()?;
    let g = u8::from_str_radix(&trimmed[2..4], 16).ok()?;
    let b = u8::from_str_radix(&trimmed[4..6], 16).ok()?;
    Some([r, g, b])
}

pub fn rgb_to_hex(rgb: [u8; 3]) -> String {
    format!("#{:02X}{:02X}{:02X}", rgb[0], rgb[1], rgb[2])
}

pub fn rgb_to_lab(rgb: [u8; 3]) -> Lab<D65, f32> {
    let srgb = Srgb::new(
        f32::from(rgb[0]) / 255.0,
        f32::from(rgb[1]) / 255.0,
        f32::from(rgb[2]) / 255.0,
    );
    Lab::from_color(srgb)
}

pub fn delta_e(a: [u8; 3], b: [u8; 3]) -> f32 {
    rgb_to_lab(a).difference(rgb_to_lab(b))
}

/// Square sample window centered on the image, sized half of the shorter
/// side, clipped to the frame.
pub fn center_region(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let half = (width.min(height) / 4).max(1);
    let cx = width / 2;
    let cy = height / 2;
    let x0 = cx.saturating_sub(half);
    let y0 = cy.saturating_sub(half);
    let x1 = (cx + half).min(width);
    let y1 = (cy + half).min(height);
    (x0, y0, x1, y1)
}

/// Mean CIEDE2000 difference between `reference` and the pixels of the
/// central sample window. `None` for an empty image.
pub fn mean_center_delta_e(image: &RgbImage, reference: [u8; 3]) -> Option<f32> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let reference_lab = rgb_to_lab(reference);
    let (x0, y0, x1, y1) = center_region(width, height);
    let mut total = 0.0_f32;
    let mut count = 0_u32;
    for y in y0..y1 {
        for x in x0..x1 {
            total += rgb_to_lab(image.get_pixel(x, y).0).difference(reference_lab);
            count += 1;
        }
    }
    (count > 0).then(|| total / count as f32)
}
