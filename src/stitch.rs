use anyhow::{anyhow, Result};
use tracing::debug;

use crate::cache::TileCache;
use crate::core::mosaic::{paste_at, Plane, Rect};
use crate::datasource::MosaicLayout;

/// Default cap on the number of FOVs composited in one batch.
pub const DEFAULT_BATCH_LIMIT: usize = 16;

/// On-the-fly compositor for small batches of adjacent FOVs.
///
/// Placement comes from the mosaic layout (stage-derived offsets); blending
/// is overlay, ascending FOV order, matching what the offline exporter
/// produces. Batches above the limit are rejected so callers fall back to
/// the pyramid instead of stalling on a huge composite.
pub struct Stitcher {
    batch_limit: usize,
}

impl Stitcher {
    pub fn new(batch_limit: usize) -> Self {
        Self { batch_limit }
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Composite `fovs` into a canvas covering `region` (base-mosaic pixels).
    /// FOVs partially outside the region are clipped; uncovered pixels stay 0.
    pub fn composite_region(
        &self,
        tiles: &TileCache,
        layout: &MosaicLayout,
        z: u32,
        channel: usize,
        region: Rect,
        fovs: &[u32],
    ) -> Result<Plane> {
        if fovs.len() > self.batch_limit {
            return Err(anyhow!(
                "stitch batch of {} FOVs exceeds the limit of {}",
                fovs.len(),
                self.batch_limit
            ));
        }
        if region.w == 0 || region.h == 0 {
            return Err(anyhow!("empty stitch region"));
        }
        let mut ordered: Vec<u32> = fovs.to_vec();
        ordered.sort_unstable();

        let started = std::time::Instant::now();
        let mut canvas = Plane::new(region.w, region.h);
        for fov in ordered {
            let (x0, y0) = layout
                .origin(fov)
                .ok_or_else(|| anyhow!("fov {} has no layout origin", fov))?;
            let tile = tiles.get(fov, z)?;
            let plane = tile.channel(channel)?;
            paste_at(
                &mut canvas,
                plane,
                x0 as i64 - region.x as i64,
                y0 as i64 - region.y as i64,
            );
        }
        debug!(
            "stitched z={} channel={} fovs={} region={}x{}+{}+{} ms={}",
            z,
            channel,
            fovs.len(),
            region.w,
            region.h,
            region.x,
            region.y,
            started.elapsed().as_millis()
        );
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSource;
    use std::sync::Arc;

    fn synthetic(dir: &std::path::Path) -> (Arc<TileCache>, MosaicLayout) {
        std::fs::write(
            dir.join("acquisition parameters.json"),
            r#"{"sensor_pixel_size_um": 0.752}"#,
        )
        .unwrap();
        for fov in 0..4u32 {
            let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(
                4,
                4,
                image::Luma([(fov + 1) as u16]),
            );
            img.save(dir.join(format!("manual_{}_0_A.tiff", fov)))
                .unwrap();
        }
        let source = Arc::new(DataSource::open(dir).unwrap());
        let layout = source.layout(0).unwrap();
        (Arc::new(TileCache::new(source, 1 << 20)), layout)
    }

    #[test]
    fn test_composite_full_region() {
        let dir = tempfile::tempdir().unwrap();
        let (tiles, layout) = synthetic(dir.path());
        let stitcher = Stitcher::new(DEFAULT_BATCH_LIMIT);
        let region = Rect::new(0, 0, layout.width, layout.height);
        let out = stitcher
            .composite_region(&tiles, &layout, 0, 0, region, &[0, 1, 2, 3])
            .unwrap();
        // 2x2 grid of 4x4 tiles, values 1..4
        assert_eq!(out.get(0, 0), 1);
        assert_eq!(out.get(4, 0), 2);
        assert_eq!(out.get(0, 4), 3);
        assert_eq!(out.get(4, 4), 4);
    }

    #[test]
    fn test_composite_clips_to_region() {
        let dir = tempfile::tempdir().unwrap();
        let (tiles, layout) = synthetic(dir.path());
        let stitcher = Stitcher::new(DEFAULT_BATCH_LIMIT);
        // Window straddling the boundary between fov 0 and fov 1
        let region = Rect::new(2, 0, 4, 4);
        let out = stitcher
            .composite_region(&tiles, &layout, 0, 0, region, &[0, 1])
            .unwrap();
        assert_eq!(out.get(0, 0), 1); // from fov 0
        assert_eq!(out.get(2, 0), 2); // from fov 1
    }

    #[test]
    fn test_uncovered_pixels_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (tiles, layout) = synthetic(dir.path());
        let stitcher = Stitcher::new(DEFAULT_BATCH_LIMIT);
        let region = Rect::new(0, 0, 8, 8);
        let out = stitcher
            .composite_region(&tiles, &layout, 0, 0, region, &[0])
            .unwrap();
        assert_eq!(out.get(0, 0), 1);
        assert_eq!(out.get(7, 7), 0); // fov 3's area was not requested
    }

    #[test]
    fn test_batch_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (tiles, layout) = synthetic(dir.path());
        let stitcher = Stitcher::new(2);
        let region = Rect::new(0, 0, 8, 8);
        let err = stitcher
            .composite_region(&tiles, &layout, 0, 0, region, &[0, 1, 2])
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"));
    }

    #[test]
    fn test_unknown_fov_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (tiles, layout) = synthetic(dir.path());
        let stitcher = Stitcher::new(DEFAULT_BATCH_LIMIT);
        let region = Rect::new(0, 0, 4, 4);
        assert!(stitcher
            .composite_region(&tiles, &layout, 0, 0, region, &[99])
            .is_err());
    }
}
