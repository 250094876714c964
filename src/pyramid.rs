use std::sync::Arc;

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use tracing::info;

use crate::cache::TileCache;
use crate::core::mosaic::{paste_at, Plane};

/// Default pyramid downsample factors: three layers over the base mosaic.
pub const DEFAULT_FACTORS: [u32; 3] = [4, 8, 16];

/// Block-mean downsample with excess trimmed: output is `dim / factor`,
/// trailing remainder rows/columns are discarded. Rounds to nearest.
pub fn downsample_block_mean(src: &Plane, factor: u32) -> Result<Plane> {
    if factor == 0 {
        return Err(anyhow!("downsample factor must be positive"));
    }
    if factor == 1 {
        return Ok(src.clone());
    }
    let out_w = src.w / factor;
    let out_h = src.h / factor;
    if out_w == 0 || out_h == 0 {
        return Err(anyhow!(
            "factor {} leaves no pixels from a {}x{} plane",
            factor,
            src.w,
            src.h
        ));
    }
    let block = (factor * factor) as u32;
    let src_w = src.w as usize;
    let f = factor as usize;
    let mut out = Plane::new(out_w, out_h);
    out.data
        .par_chunks_mut(out_w as usize)
        .enumerate()
        .for_each(|(oy, row)| {
            let sy0 = oy * f;
            for (ox, cell) in row.iter_mut().enumerate() {
                let sx0 = ox * f;
                let mut sum: u32 = 0;
                for dy in 0..f {
                    let base = (sy0 + dy) * src_w + sx0;
                    for dx in 0..f {
                        sum += src.data[base + dx] as u32;
                    }
                }
                *cell = ((sum + block / 2) / block) as u16;
            }
        });
    Ok(out)
}

#[derive(Clone, Hash, Eq, PartialEq, Debug)]
struct LevelKey {
    z: u32,
    channel: usize,
    factor: u32,
}

/// Generates and caches multi-resolution overview mosaics on demand.
///
/// Factor 1 is the full-resolution mosaic (every FOV pasted at its layout
/// origin, overlay blending in ascending FOV order); the configured factors
/// are block-mean reductions of it. Levels build lazily and stay cached.
pub struct PyramidProvider {
    tiles: Arc<TileCache>,
    factors: Vec<u32>,
    levels: moka::sync::Cache<LevelKey, Arc<Plane>>,
}

impl PyramidProvider {
    pub fn new(tiles: Arc<TileCache>, factors: &[u32], max_cached_bytes: u64) -> Result<Self> {
        let mut factors: Vec<u32> = factors.to_vec();
        factors.sort_unstable();
        factors.dedup();
        if factors.is_empty() {
            return Err(anyhow!("at least one pyramid factor is required"));
        }
        if factors.iter().any(|&f| f < 2) {
            return Err(anyhow!("pyramid factors must be >= 2"));
        }
        let levels = moka::sync::Cache::builder()
            .max_capacity(max_cached_bytes)
            .weigher(|_k: &LevelKey, plane: &Arc<Plane>| plane.nbytes().min(u32::MAX as usize) as u32)
            .build();
        Ok(Self {
            tiles,
            factors,
            levels,
        })
    }

    pub fn factors(&self) -> &[u32] {
        &self.factors
    }

    pub fn coarsest(&self) -> u32 {
        *self.factors.last().unwrap_or(&1)
    }

    /// Smallest configured factor covering a demagnification, capped at the
    /// coarsest level.
    pub fn factor_for(&self, demag: f64) -> u32 {
        for &f in &self.factors {
            if demag <= f as f64 {
                return f;
            }
        }
        self.coarsest()
    }

    /// The overview mosaic at a factor. Factor 1 is the base; other factors
    /// must be configured levels.
    pub fn level(&self, z: u32, channel: usize, factor: u32) -> Result<Arc<Plane>> {
        if factor != 1 && !self.factors.contains(&factor) {
            return Err(anyhow!(
                "factor {} is not a pyramid level (configured: {:?})",
                factor,
                self.factors
            ));
        }
        let key = LevelKey { z, channel, factor };
        if factor == 1 {
            return self
                .levels
                .try_get_with(key, || self.build_base(z, channel).map(Arc::new))
                .map_err(|e| anyhow!("building base mosaic z={} channel={}: {}", z, channel, e));
        }
        // Resolve the base outside the init closure so the cache is never
        // entered re-entrantly while holding a key slot.
        let base = self.level(z, channel, 1)?;
        self.levels
            .try_get_with(key, move || -> Result<Arc<Plane>> {
                let started = std::time::Instant::now();
                let level = downsample_block_mean(&base, factor)?;
                info!(
                    "pyramid level built z={} channel={} factor={} {}x{} ms={}",
                    z,
                    channel,
                    factor,
                    level.w,
                    level.h,
                    started.elapsed().as_millis()
                );
                Ok(Arc::new(level))
            })
            .map_err(|e| anyhow!("building level z={} channel={} factor={}: {}", z, channel, factor, e))
    }

    fn build_base(&self, z: u32, channel: usize) -> Result<Plane> {
        let source = self.tiles.source();
        let layout = source.layout(z)?;
        let started = std::time::Instant::now();
        let mut mosaic = Plane::new(layout.width, layout.height);
        for &(fov, x0, y0) in &layout.origins {
            let tile = self.tiles.get(fov, z)?;
            let plane = tile.channel(channel)?;
            paste_at(&mut mosaic, plane, x0 as i64, y0 as i64);
        }
        info!(
            "base mosaic built z={} channel={} {}x{} fovs={} ms={}",
            z,
            channel,
            mosaic.w,
            mosaic.h,
            layout.origins.len(),
            started.elapsed().as_millis()
        );
        Ok(mosaic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSource;

    #[test]
    fn test_block_mean_exact() {
        let src = Plane::from_vec(4, 2, vec![0, 2, 10, 12, 4, 6, 14, 16]).unwrap();
        let out = downsample_block_mean(&src, 2).unwrap();
        assert_eq!((out.w, out.h), (2, 1));
        assert_eq!(out.data, vec![3, 13]);
    }

    #[test]
    fn test_block_mean_trims_excess() {
        // 5x5 at factor 2 → 2x2, the fifth row/column is discarded
        let src = Plane::from_vec(5, 5, vec![100; 25]).unwrap();
        let out = downsample_block_mean(&src, 2).unwrap();
        assert_eq!((out.w, out.h), (2, 2));
        assert!(out.data.iter().all(|&v| v == 100));
    }

    #[test]
    fn test_block_mean_rounds_to_nearest() {
        let src = Plane::from_vec(2, 2, vec![0, 1, 1, 1]).unwrap();
        // mean 0.75 → rounds to 1
        let out = downsample_block_mean(&src, 2).unwrap();
        assert_eq!(out.data, vec![1]);
    }

    #[test]
    fn test_block_mean_factor_too_large() {
        let src = Plane::new(4, 4);
        assert!(downsample_block_mean(&src, 8).is_err());
    }

    #[test]
    fn test_block_mean_identity() {
        let src = Plane::from_vec(2, 1, vec![7, 9]).unwrap();
        assert_eq!(downsample_block_mean(&src, 1).unwrap(), src);
    }

    fn synthetic_provider(dir: &std::path::Path, factors: &[u32]) -> PyramidProvider {
        std::fs::write(
            dir.join("acquisition parameters.json"),
            r#"{"sensor_pixel_size_um": 0.752}"#,
        )
        .unwrap();
        for fov in 0..4u32 {
            let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(
                8,
                8,
                image::Luma([(fov + 1) as u16 * 100]),
            );
            img.save(dir.join(format!("manual_{}_0_A.tiff", fov)))
                .unwrap();
        }
        let source = Arc::new(DataSource::open(dir).unwrap());
        let tiles = Arc::new(TileCache::new(source, 1 << 20));
        PyramidProvider::new(tiles, factors, 1 << 20).unwrap()
    }

    #[test]
    fn test_base_mosaic_grid_placement() {
        let dir = tempfile::tempdir().unwrap();
        let provider = synthetic_provider(dir.path(), &[2]);
        let base = provider.level(0, 0, 1).unwrap();
        // 4 FOVs on a 2x2 grid of 8x8 tiles
        assert_eq!((base.w, base.h), (16, 16));
        assert_eq!(base.get(0, 0), 100);
        assert_eq!(base.get(8, 0), 200);
        assert_eq!(base.get(0, 8), 300);
        assert_eq!(base.get(8, 8), 400);
    }

    #[test]
    fn test_level_cached() {
        let dir = tempfile::tempdir().unwrap();
        let provider = synthetic_provider(dir.path(), &[2, 4]);
        let a = provider.level(0, 0, 4).unwrap();
        let b = provider.level(0, 0, 4).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((a.w, a.h), (4, 4));
    }

    #[test]
    fn test_unknown_factor_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = synthetic_provider(dir.path(), &[2, 4]);
        assert!(provider.level(0, 0, 3).is_err());
    }

    #[test]
    fn test_factor_for() {
        let dir = tempfile::tempdir().unwrap();
        let provider = synthetic_provider(dir.path(), &[4, 8, 16]);
        assert_eq!(provider.factor_for(1.5), 4);
        assert_eq!(provider.factor_for(4.0), 4);
        assert_eq!(provider.factor_for(5.0), 8);
        assert_eq!(provider.factor_for(12.0), 16);
        assert_eq!(provider.factor_for(40.0), 16);
    }

    #[test]
    fn test_invalid_factor_sets() {
        let dir = tempfile::tempdir().unwrap();
        let provider = synthetic_provider(dir.path(), &[2]);
        let tiles = provider.tiles.clone();
        assert!(PyramidProvider::new(tiles.clone(), &[], 1024).is_err());
        assert!(PyramidProvider::new(tiles, &[1, 4], 1024).is_err());
    }
}
