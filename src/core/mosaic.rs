use anyhow::{anyhow, Result};

/// Single-channel 16-bit image plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane {
    pub w: u32,
    pub h: u32,
    pub data: Vec<u16>,
}

impl Plane {
    /// Zero-filled plane.
    pub fn new(w: u32, h: u32) -> Self {
        Self {
            w,
            h,
            data: vec![0; (w as usize) * (h as usize)],
        }
    }

    pub fn from_vec(w: u32, h: u32, data: Vec<u16>) -> Result<Self> {
        if data.len() != (w as usize) * (h as usize) {
            return Err(anyhow!(
                "plane data length {} does not match {}x{}",
                data.len(),
                w,
                h
            ));
        }
        Ok(Self { w, h, data })
    }

    pub fn nbytes(&self) -> usize {
        self.data.len() * 2
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.data[(y as usize) * (self.w as usize) + (x as usize)]
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

/// Paste `src` into `dst` with its top-left corner at signed offset (ox, oy).
/// The parts falling outside `dst` are clipped.
pub fn paste_at(dst: &mut Plane, src: &Plane, ox: i64, oy: i64) {
    let dst_w = dst.w as i64;
    let dst_h = dst.h as i64;
    let y_start = oy.max(0);
    let y_end = (oy + src.h as i64).min(dst_h);
    let x_start = ox.max(0);
    let x_end = (ox + src.w as i64).min(dst_w);
    if y_start >= y_end || x_start >= x_end {
        return;
    }
    let row_len = (x_end - x_start) as usize;
    for y in y_start..y_end {
        let sy = (y - oy) as usize;
        let sx = (x_start - ox) as usize;
        let src_off = sy * src.w as usize + sx;
        let dst_off = y as usize * dst.w as usize + x_start as usize;
        dst.data[dst_off..dst_off + row_len]
            .copy_from_slice(&src.data[src_off..src_off + row_len]);
    }
}

/// Extract `rect` from `src`. Pixels outside `src` stay 0.
pub fn extract(src: &Plane, rect: Rect) -> Plane {
    let mut out = Plane::new(rect.w, rect.h);
    for y in 0..rect.h {
        let sy = rect.y + y;
        if sy >= src.h {
            continue;
        }
        let copy_w = rect.w.min(src.w.saturating_sub(rect.x));
        if copy_w == 0 {
            continue;
        }
        let src_off = sy as usize * src.w as usize + rect.x as usize;
        let dst_off = y as usize * rect.w as usize;
        out.data[dst_off..dst_off + copy_w as usize]
            .copy_from_slice(&src.data[src_off..src_off + copy_w as usize]);
    }
    out
}

/// Bring a plane to (w, h): center-crop if larger, zero-pad if smaller.
/// Mixed cases crop the oversized axis and pad the other.
pub fn fit_to(src: &Plane, w: u32, h: u32) -> Plane {
    if src.w == w && src.h == h {
        return src.clone();
    }
    let mut out = Plane::new(w, h);
    // Signed offset of src's top-left in out coordinates: centered.
    let ox = (w as i64 - src.w as i64) / 2;
    let oy = (h as i64 - src.h as i64) / 2;
    paste_at(&mut out, src, ox, oy);
    out
}
