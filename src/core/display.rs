use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;

use super::mosaic::Plane;

/// Linear contrast window for mapping u16 data to display range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContrastWindow {
    pub lo: u16,
    pub hi: u16,
}

/// Histogram percentiles used by [`auto_window`]. Microscopy frames carry a
/// dark background and a small bright tail, so the window ignores the extremes.
const LO_PERCENTILE: f64 = 0.01;
const HI_PERCENTILE: f64 = 0.995;

/// Cap on the number of samples taken when estimating the window.
const MAX_SAMPLES: usize = 1 << 16;

/// Estimate a contrast window from a subsampled percentile sweep of the plane.
pub fn auto_window(plane: &Plane) -> ContrastWindow {
    if plane.data.is_empty() {
        return ContrastWindow { lo: 0, hi: 0 };
    }
    let stride = (plane.data.len() / MAX_SAMPLES).max(1);
    let mut samples: Vec<u16> = plane.data.iter().step_by(stride).copied().collect();
    samples.sort_unstable();
    let n = samples.len();
    let lo = samples[((n as f64) * LO_PERCENTILE) as usize];
    let hi = samples[(((n - 1) as f64) * HI_PERCENTILE) as usize];
    ContrastWindow { lo, hi }
}

/// Map a u16 plane to u8 through a contrast window: values at or below `lo`
/// go to 0, at or above `hi` go to 255, linear in between. A degenerate
/// window (hi <= lo) maps everything to 0.
pub fn to_u8(plane: &Plane, win: ContrastWindow) -> Vec<u8> {
    if win.hi <= win.lo {
        return vec![0; plane.data.len()];
    }
    let lo = win.lo as f32;
    let span = (win.hi - win.lo) as f32;
    plane
        .data
        .iter()
        .map(|&v| {
            let t = ((v as f32 - lo) / span).clamp(0.0, 1.0);
            (t * 255.0).round() as u8
        })
        .collect()
}

/// Encode an 8-bit grayscale buffer as JPEG.
pub fn encode_jpeg_gray(pixels: &[u8], w: u32, h: u32, quality: u8) -> Result<Vec<u8>> {
    if pixels.len() != (w as usize) * (h as usize) {
        return Err(anyhow!(
            "pixel buffer length {} does not match {}x{}",
            pixels.len(),
            w,
            h
        ));
    }
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), quality);
    encoder
        .encode(pixels, w, h, image::ExtendedColorType::L8)
        .context("jpeg encode")?;
    Ok(out)
}
