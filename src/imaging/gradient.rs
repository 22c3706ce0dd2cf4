//! Sobel gradients over a [`GrayField`], border pixels clamped.

use super::GrayField;

type Kernel3 = [[f32; 3]; 3];

const SOBEL_X: Kernel3 = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_Y: Kernel3 = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

pub fn sobel_magnitude(field: &GrayField) -> GrayField {
    let (w, h) = field.dimensions();
    if w == 0 || h == 0 {
        return field.clone();
    }
    GrayField::from_fn(w, h, |x, y| {
        let xs = [x.saturating_sub(1), x, (x + 1).min(w - 1)];
        let ys = [y.saturating_sub(1), y, (y + 1).min(h - 1)];
        let mut gx = 0.0_f32;
        let mut gy = 0.0_f32;
        for (ky, yy) in ys.iter().enumerate() {
            for (kx, xx) in xs.iter().enumerate() {
                let v = field.get(*xx, *yy);
                gx += v * SOBEL_X[ky][kx];
                gy += v * SOBEL_Y[ky][kx];
            }
        }
        (gx * gx + gy * gy).sqrt()
    })
}

/// Edge map: gradient magnitude at or above `relative_threshold` times the
/// strongest gradient in the field. A flat field has no edges.
pub fn edge_pixels(field: &GrayField, relative_threshold: f32) -> Vec<bool> {
    let magnitude = sobel_magnitude(field);
    let peak = magnitude.data().iter().copied().fold(0.0_f32, f32::max);
    if peak <= f32::EPSILON {
        return vec![false; magnitude.len()];
    }
    let cutoff = peak * relative_threshold;
    magnitude.data().iter().map(|v| *v >= cutoff).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_field_has_no_gradient() {
        let field = GrayField::filled(5, 5, 0.4);
        assert!(sobel_magnitude(&field).data().iter().all(|v| *v == 0.0));
        assert!(edge_pixels(&field, 0.2).iter().all(|e| !e));
    }

    #[test]
    fn vertical_step_produces_edge_band() {
        let field = GrayField::from_fn(8, 4, |x, _| if x >= 4 { 1.0 } else { 0.0 });
        let edges = edge_pixels(&field, 0.5);
        for y in 0..4_usize {
            let row = &edges[y * 8..(y + 1) * 8];
            assert_eq!(row, &[false, false, false, true, true, false, false, false]);
        }
    }
}
