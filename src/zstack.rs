use anyhow::{anyhow, Result};

use crate::datasource::DataSource;

/// The set of z planes present in an acquisition, with plane switching.
#[derive(Clone, Debug)]
pub struct ZStack {
    zs: Vec<u32>,
}

impl ZStack {
    pub fn new(mut zs: Vec<u32>) -> Result<Self> {
        zs.sort_unstable();
        zs.dedup();
        if zs.is_empty() {
            return Err(anyhow!("z-stack has no planes"));
        }
        Ok(Self { zs })
    }

    pub fn from_source(source: &DataSource) -> Result<Self> {
        Self::new(source.z_planes().to_vec())
    }

    pub fn planes(&self) -> &[u32] {
        &self.zs
    }

    pub fn len(&self) -> usize {
        self.zs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zs.is_empty()
    }

    /// Validate that a plane exists.
    pub fn select(&self, z: u32) -> Result<u32> {
        if self.zs.binary_search(&z).is_ok() {
            Ok(z)
        } else {
            Err(anyhow!("z={} is not an acquired plane (have {:?})", z, self.zs))
        }
    }

    /// Snap to the closest acquired plane; ties go to the lower plane.
    pub fn nearest(&self, z: u32) -> u32 {
        match self.zs.binary_search(&z) {
            Ok(idx) => self.zs[idx],
            Err(idx) => {
                if idx == 0 {
                    self.zs[0]
                } else if idx == self.zs.len() {
                    self.zs[self.zs.len() - 1]
                } else {
                    let below = self.zs[idx - 1];
                    let above = self.zs[idx];
                    if z - below <= above - z {
                        below
                    } else {
                        above
                    }
                }
            }
        }
    }

    /// Step from a plane by `delta` positions, clamping at the stack ends.
    /// The starting plane is snapped first if it is not acquired.
    pub fn step(&self, z: u32, delta: i32) -> u32 {
        let start = self.nearest(z);
        let idx = self.zs.binary_search(&start).unwrap_or(0) as i64;
        let target = (idx + delta as i64).clamp(0, self.zs.len() as i64 - 1);
        self.zs[target as usize]
    }
}
