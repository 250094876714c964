use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tracing::info;

use crate::cache::TileCache;
use crate::core::display::{auto_window, encode_jpeg_gray, to_u8};
use crate::datasource::DataSource;
use crate::pyramid::PyramidProvider;

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Acquisition root directory
    #[arg(long)]
    dir: PathBuf,

    /// Output directory for overview images
    #[arg(long)]
    out: PathBuf,

    /// Z plane (defaults to the first acquired plane)
    #[arg(long)]
    z: Option<u32>,

    /// Channel name (defaults to the first channel)
    #[arg(long)]
    channel: Option<String>,

    /// Pyramid downsample factors
    #[arg(long, value_delimiter = ',', default_values_t = [4u32, 8, 16])]
    levels: Vec<u32>,

    /// Output format: png or jpg
    #[arg(long, default_value = "png")]
    format: String,

    /// JPEG quality (jpg format only)
    #[arg(long, default_value_t = 90)]
    quality: u8,

    /// Also write the full-resolution base mosaic
    #[arg(long)]
    base: bool,

    /// Decoded-tile cache size in MiB
    #[arg(long, default_value_t = 1024)]
    cache_mb: u64,
}

/// Build the overview pyramid for one z/channel and write one image per level.
pub fn run(args: ExportArgs) -> Result<()> {
    if args.format != "png" && args.format != "jpg" {
        return Err(anyhow!("unknown format '{}', expected png or jpg", args.format));
    }
    let source = Arc::new(DataSource::open(&args.dir)?);
    let z = match args.z {
        Some(z) => {
            if !source.z_planes().contains(&z) {
                return Err(anyhow!("z={} is not an acquired plane", z));
            }
            z
        }
        None => source.z_planes()[0],
    };
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

    let cache_bytes = args.cache_mb * 1024 * 1024;
    let tiles = Arc::new(TileCache::new(source.clone(), cache_bytes));
    let provider = PyramidProvider::new(tiles, &args.levels, cache_bytes)?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;

    let mut factors: Vec<u32> = Vec::new();
    if args.base {
        factors.push(1);
    }
    factors.extend(provider.factors());

    for factor in factors {
        let plane = provider.level(z, channel, factor)?;
        let name = if factor == 1 {
            format!("overview_base.{}", args.format)
        } else {
            format!("overview_{}.{}", factor, args.format)
        };
        let path = args.out.join(name);
        match args.format.as_str() {
            "png" => {
                let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_raw(
                    plane.w,
                    plane.h,
                    plane.data.clone(),
                )
                .ok_or_else(|| anyhow!("plane buffer mismatch at factor {}", factor))?;
                img.save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            _ => {
                let win = auto_window(&plane);
                let gray = to_u8(&plane, win);
                let bytes = encode_jpeg_gray(&gray, plane.w, plane.h, args.quality)?;
                fs::write(&path, bytes)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        info!(
            "overview exported z={} channel={} factor={} {}x{} path={}",
            z,
            channel_name,
            factor,
            plane.w,
            plane.h,
            path.display()
        );
    }
    Ok(())
}
