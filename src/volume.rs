use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::cache::TileCache;
use crate::core::mosaic::{fit_to, Plane};
use crate::datasource::DataSource;
use crate::pyramid::{downsample_block_mean, PyramidProvider, DEFAULT_FACTORS};

/// Largest downsample factor the planner will consider.
pub const MAX_VOLUME_FACTOR: u32 = 64;

/// Geometry of a downsampled volume that fits a byte budget.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct VolumePlan {
    pub factor: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bytes: u64,
}

/// Pick the smallest power-of-two factor (1, 2, 4, ... up to the cap) whose
/// downsampled u16 stack fits `budget_bytes`.
pub fn plan_volume(width: u32, height: u32, depth: u32, budget_bytes: u64) -> Result<VolumePlan> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(anyhow!("degenerate volume {}x{}x{}", width, height, depth));
    }
    let mut factor = 1u32;
    while factor <= MAX_VOLUME_FACTOR {
        let w = width / factor;
        let h = height / factor;
        if w == 0 || h == 0 {
            break;
        }
        let bytes = (w as u64) * (h as u64) * (depth as u64) * 2;
        if bytes <= budget_bytes {
            return Ok(VolumePlan {
                factor,
                width: w,
                height: h,
                depth,
                bytes,
            });
        }
        factor *= 2;
    }
    Err(anyhow!(
        "volume {}x{}x{} does not fit {} bytes even at factor {}",
        width,
        height,
        depth,
        budget_bytes,
        MAX_VOLUME_FACTOR
    ))
}

/// A z-stack downsampled to its plan, planes in ascending z order.
pub struct Volume {
    pub plan: VolumePlan,
    pub zs: Vec<u32>,
    pub planes: Vec<Plane>,
}

/// Assemble every z plane of one channel at full resolution, downsample each
/// by the planned factor, and return the stack. Planes whose mosaics differ
/// in size (partial scans) are fitted to the plan dimensions.
pub fn load_volume(
    provider: &PyramidProvider,
    source: &DataSource,
    channel: usize,
    budget_bytes: u64,
) -> Result<Volume> {
    let zs: Vec<u32> = source.z_planes().to_vec();
    let layout = source.layout(zs[0])?;
    let plan = plan_volume(layout.width, layout.height, zs.len() as u32, budget_bytes)?;
    info!(
        "volume plan channel={} factor={} dims={}x{}x{} bytes={}",
        channel, plan.factor, plan.width, plan.height, plan.depth, plan.bytes
    );

    let planes: Vec<Plane> = zs
        .par_iter()
        .map(|&z| -> Result<Plane> {
            let base = provider.level(z, channel, 1)?;
            let small = downsample_block_mean(&base, plan.factor)?;
            if small.w != plan.width || small.h != plan.height {
                Ok(fit_to(&small, plan.width, plan.height))
            } else {
                Ok(small)
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Volume { plan, zs, planes })
}

#[derive(Args, Debug)]
pub struct VolumeArgs {
    /// Acquisition root directory
    #[arg(long)]
    dir: PathBuf,

    /// Output directory for the dumped volume
    #[arg(long)]
    out: PathBuf,

    /// Channel name (defaults to the first channel)
    #[arg(long)]
    channel: Option<String>,

    /// Memory budget for the downsampled stack, in MiB
    #[arg(long, default_value_t = 512)]
    budget_mb: u64,

    /// Decoded-tile cache size in MiB
    #[arg(long, default_value_t = 1024)]
    cache_mb: u64,
}

/// Dump a budget-fitted volume as one 16-bit PNG per plane plus volume.json.
pub fn run(args: VolumeArgs) -> Result<()> {
    let source = Arc::new(DataSource::open(&args.dir)?);
    let channel_name = match &args.channel {
        Some(name) => name.clone(),
        None => source
            .channels()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("acquisition has no channels"))?,
    };
    let channel = source
        .channel_index(&channel_name)
        .ok_or_else(|| anyhow!("unknown channel '{}'", channel_name))?;

    let tiles = Arc::new(TileCache::new(source.clone(), args.cache_mb * 1024 * 1024));
    let provider = PyramidProvider::new(tiles, &DEFAULT_FACTORS, args.cache_mb * 1024 * 1024)?;
    let volume = load_volume(&provider, &source, channel, args.budget_mb * 1024 * 1024)?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    for (z, plane) in volume.zs.iter().zip(&volume.planes) {
        let path = args.out.join(format!("z{:04}.png", z));
        let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(
            plane.w,
            plane.h,
            plane.data.clone(),
        )
        .ok_or_else(|| anyhow!("plane buffer mismatch at z={}", z))?;
        img.save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    let meta_path = args.out.join("volume.json");
    fs::write(&meta_path, serde_json::to_string_pretty(&volume.plan)?)
        .with_context(|| format!("writing {}", meta_path.display()))?;
    info!(
        "volume dumped channel={} planes={} out={}",
        channel_name,
        volume.planes.len(),
        args.out.display()
    );
    Ok(())
}
