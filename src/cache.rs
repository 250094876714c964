use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::datasource::{DataSource, FovTile};

/// Byte-bounded LRU over decoded FOV tiles, keyed by (fov, z).
///
/// Loads through the data source on miss; concurrent requests for the same
/// key share one load. A tile bigger than the whole budget is rejected
/// instead of churning the cache.
pub struct TileCache {
    source: Arc<DataSource>,
    inner: moka::sync::Cache<(u32, u32), Arc<FovTile>>,
    max_bytes: u64,
}

impl TileCache {
    pub fn new(source: Arc<DataSource>, max_bytes: u64) -> Self {
        let inner = moka::sync::Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &(u32, u32), tile: &Arc<FovTile>| {
                tile.nbytes().min(u32::MAX as usize) as u32
            })
            .build();
        Self {
            source,
            inner,
            max_bytes,
        }
    }

    pub fn source(&self) -> &Arc<DataSource> {
        &self.source
    }

    pub fn get(&self, fov: u32, z: u32) -> Result<Arc<FovTile>> {
        let source = self.source.clone();
        let max_bytes = self.max_bytes;
        self.inner
            .try_get_with((fov, z), move || -> Result<Arc<FovTile>> {
                let tile = source.load_tile(fov, z)?;
                let size = tile.nbytes() as u64;
                if size > max_bytes {
                    return Err(anyhow!(
                        "tile fov={} z={} is {} bytes, exceeding the {} byte cache budget",
                        fov,
                        z,
                        size,
                        max_bytes
                    ));
                }
                Ok(Arc::new(tile))
            })
            .map_err(|e| anyhow!("loading tile fov={} z={}: {}", fov, z, e))
    }

    /// Pre-populate an entry, e.g. from a prewarm pass.
    pub fn insert(&self, tile: FovTile) -> Result<()> {
        let size = tile.nbytes() as u64;
        if size > self.max_bytes {
            return Err(anyhow!(
                "tile fov={} z={} is {} bytes, exceeding the {} byte cache budget",
                tile.fov,
                tile.z,
                size,
                self.max_bytes
            ));
        }
        self.inner.insert((tile.fov, tile.z), Arc::new(tile));
        Ok(())
    }

    pub fn weighted_bytes(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}
