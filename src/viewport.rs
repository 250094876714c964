use serde::Serialize;

use crate::core::mosaic::Rect;
use crate::datasource::MosaicLayout;

/// A view onto the base mosaic: center in base pixels, zoom in screen
/// pixels per data pixel, and the screen size being rendered to.
#[derive(Clone, Copy, Debug)]
pub struct Viewport {
    pub cx: f64,
    pub cy: f64,
    pub zoom: f64,
    pub screen_w: u32,
    pub screen_h: u32,
}

/// Zoom and display-planning policy.
///
/// Demagnification (1/zoom) is capped at the coarsest pyramid factor: past
/// that there is no coarser pixel source, so the viewport never leaves
/// renderable range. Zoom-in is capped at `max_zoom_in` times native.
#[derive(Clone, Copy, Debug)]
pub struct ZoomPolicy {
    pub max_zoom_in: f64,
    pub live_stitch_demag: f64,
    pub coarsest_factor: u32,
}

impl ZoomPolicy {
    pub fn new(coarsest_factor: u32) -> Self {
        Self {
            max_zoom_in: 8.0,
            live_stitch_demag: 2.0,
            coarsest_factor,
        }
    }

    pub fn clamp_zoom(&self, zoom: f64) -> f64 {
        let min_zoom = 1.0 / self.coarsest_factor as f64;
        if !zoom.is_finite() || zoom <= 0.0 {
            return min_zoom;
        }
        zoom.clamp(min_zoom, self.max_zoom_in)
    }
}

/// What to render for a viewport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayPlan {
    /// Stitch these FOVs live; `region` is in base-mosaic pixels.
    LiveStitch { fovs: Vec<u32>, region: Rect },
    /// Crop the pyramid level at `factor`; `region` is in base-mosaic pixels.
    Pyramid { factor: u32, region: Rect },
}

/// Map-view descriptor: the overview inset plus the viewport rectangle in
/// thumbnail coordinates.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MapView {
    pub factor: u32,
    pub thumb_w: u32,
    pub thumb_h: u32,
    pub rect: Rect,
}

/// Data window covered by the viewport, (xmin, ymin, xmax, ymax) in base
/// pixels, not yet clamped to the mosaic.
pub fn data_window(vp: &Viewport) -> (f64, f64, f64, f64) {
    let half_w = vp.screen_w as f64 / vp.zoom / 2.0;
    let half_h = vp.screen_h as f64 / vp.zoom / 2.0;
    (
        vp.cx - half_w,
        vp.cy - half_h,
        vp.cx + half_w,
        vp.cy + half_h,
    )
}

/// FOVs whose centers fall inside the viewport's data window, ascending.
pub fn visible_fovs(vp: &Viewport, layout: &MosaicLayout) -> Vec<u32> {
    let (xmin, ymin, xmax, ymax) = data_window(vp);
    let mut fovs: Vec<u32> = layout
        .centers()
        .into_iter()
        .filter(|&(_, cx, cy)| xmin <= cx && cx <= xmax && ymin <= cy && cy <= ymax)
        .map(|(fov, _, _)| fov)
        .collect();
    fovs.sort_unstable();
    fovs
}

/// Clamp the viewport's data window to the mosaic, returning an integer rect.
/// Degenerate windows collapse to a 1x1 rect at the nearest corner.
pub fn clamped_region(vp: &Viewport, layout: &MosaicLayout) -> Rect {
    let (xmin, ymin, xmax, ymax) = data_window(vp);
    let x0 = xmin.max(0.0).min((layout.width - 1) as f64) as u32;
    let y0 = ymin.max(0.0).min((layout.height - 1) as f64) as u32;
    let x1 = (xmax.ceil().max(0.0) as u32).min(layout.width).max(x0 + 1);
    let y1 = (ymax.ceil().max(0.0) as u32).min(layout.height).max(y0 + 1);
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// Decide how to render a viewport: live stitch when zoomed in far enough
/// with a small enough visible set, pyramid crop otherwise.
pub fn plan(
    vp: &Viewport,
    layout: &MosaicLayout,
    policy: &ZoomPolicy,
    pyramid_factors: &[u32],
    batch_limit: usize,
) -> DisplayPlan {
    let mut vp = *vp;
    vp.zoom = policy.clamp_zoom(vp.zoom);
    let demag = 1.0 / vp.zoom;
    let region = clamped_region(&vp, layout);
    if demag <= policy.live_stitch_demag {
        let fovs = visible_fovs(&vp, layout);
        if !fovs.is_empty() && fovs.len() <= batch_limit {
            return DisplayPlan::LiveStitch { fovs, region };
        }
    }
    let factor = pyramid_factors
        .iter()
        .copied()
        .find(|&f| demag <= f as f64)
        .unwrap_or_else(|| pyramid_factors.last().copied().unwrap_or(1));
    DisplayPlan::Pyramid { factor, region }
}

/// Map-view descriptor at the given thumbnail factor (normally the coarsest
/// pyramid level). The viewport rect is clamped to the thumbnail bounds.
pub fn map_view(vp: &Viewport, layout: &MosaicLayout, factor: u32) -> MapView {
    let thumb_w = (layout.width / factor).max(1);
    let thumb_h = (layout.height / factor).max(1);
    let region = clamped_region(vp, layout);
    let x = (region.x / factor).min(thumb_w - 1);
    let y = (region.y / factor).min(thumb_h - 1);
    let w = (region.w.div_ceil(factor)).clamp(1, thumb_w - x);
    let h = (region.h.div_ceil(factor)).clamp(1, thumb_h - y);
    MapView {
        factor,
        thumb_w,
        thumb_h,
        rect: Rect::new(x, y, w, h),
    }
}
