use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::core::mosaic::{fit_to, Plane};

/// Number of tiles probed when deriving the modal tile shape.
const SHAPE_SAMPLE: usize = 8;

/// Acquisition metadata written by the microscope alongside the tiles.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionParams {
    pub sensor_pixel_size_um: f64,
}

#[derive(Debug, Clone)]
struct ChannelFile {
    suffix: String,
    path: PathBuf,
}

/// A decoded FOV tile: one u16 plane per channel, channel order matching
/// [`DataSource::channels`].
#[derive(Debug, Clone)]
pub struct FovTile {
    pub fov: u32,
    pub z: u32,
    pub channels: Vec<Plane>,
}

impl FovTile {
    pub fn nbytes(&self) -> usize {
        self.channels.iter().map(Plane::nbytes).sum()
    }

    pub fn channel(&self, idx: usize) -> Result<&Plane> {
        self.channels
            .get(idx)
            .ok_or_else(|| anyhow!("channel index {} out of range", idx))
    }
}

/// Per-FOV pixel origins within the assembled mosaic.
#[derive(Debug, Clone)]
pub struct MosaicLayout {
    /// (fov, x0, y0) sorted ascending by fov. Origins are tile top-left corners.
    pub origins: Vec<(u32, u32, u32)>,
    pub width: u32,
    pub height: u32,
    pub tile_w: u32,
    pub tile_h: u32,
}

impl MosaicLayout {
    pub fn origin(&self, fov: u32) -> Option<(u32, u32)> {
        self.origins
            .iter()
            .find(|(f, _, _)| *f == fov)
            .map(|(_, x, y)| (*x, *y))
    }

    /// FOV center positions in mosaic pixels, (fov, cx, cy).
    pub fn centers(&self) -> Vec<(u32, f64, f64)> {
        self.origins
            .iter()
            .map(|&(fov, x, y)| {
                (
                    fov,
                    x as f64 + self.tile_w as f64 / 2.0,
                    y as f64 + self.tile_h as f64 / 2.0,
                )
            })
            .collect()
    }
}

/// Indexed view of an acquisition directory.
///
/// Scans `manual_{fov}_{z}_{suffix}.tiff` tiles under the root, reads
/// `acquisition parameters.json`, and picks up stage coordinates when the
/// offline pipeline has written them.
pub struct DataSource {
    root: PathBuf,
    pub params: AcquisitionParams,
    index: HashMap<(u32, u32), Vec<ChannelFile>>,
    channels: Vec<String>,
    zs: Vec<u32>,
    fovs: Vec<u32>,
    stage_mm: Option<HashMap<u32, (f64, f64)>>,
    tile_w: u32,
    tile_h: u32,
}

impl DataSource {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(anyhow!("root path '{}' is not a directory", root.display()));
        }

        let params_path = root.join("acquisition parameters.json");
        let params_raw = fs::read_to_string(&params_path)
            .with_context(|| format!("missing acquisition parameters at '{}'", params_path.display()))?;
        let params: AcquisitionParams = serde_json::from_str(&params_raw)
            .with_context(|| format!("parsing '{}'", params_path.display()))?;
        if params.sensor_pixel_size_um <= 0.0 {
            return Err(anyhow!(
                "sensor_pixel_size_um must be positive, got {}",
                params.sensor_pixel_size_um
            ));
        }

        let mut index: HashMap<(u32, u32), Vec<ChannelFile>> = HashMap::new();
        let mut paths = Vec::new();
        collect_tiffs(&root, &mut paths)?;
        for path in paths {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let Some((fov, z, suffix)) = parse_tile_name(name) else {
                continue;
            };
            index
                .entry((fov, z))
                .or_default()
                .push(ChannelFile { suffix, path });
        }
        if index.is_empty() {
            return Err(anyhow!("no FOV tiles found under '{}'", root.display()));
        }
        // Deterministic channel order within each (fov, z)
        for files in index.values_mut() {
            files.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        }

        let mut channels: Vec<String> = index
            .values()
            .flat_map(|files| files.iter().map(|f| f.suffix.clone()))
            .collect();
        channels.sort();
        channels.dedup();

        let mut zs: Vec<u32> = index.keys().map(|&(_, z)| z).collect();
        zs.sort_unstable();
        zs.dedup();
        let mut fovs: Vec<u32> = index.keys().map(|&(fov, _)| fov).collect();
        fovs.sort_unstable();
        fovs.dedup();

        let (tile_w, tile_h) = modal_tile_shape(&index)?;
        let stage_mm = load_stage_coordinates(&root)?;

        info!(
            "acquisition opened root={} fovs={} z_planes={} channels={} tile={}x{} stage_coords={}",
            root.display(),
            fovs.len(),
            zs.len(),
            channels.len(),
            tile_w,
            tile_h,
            stage_mm.is_some()
        );

        Ok(Self {
            root,
            params,
            index,
            channels,
            zs,
            fovs,
            stage_mm,
            tile_w,
            tile_h,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mm_per_px(&self) -> f64 {
        self.params.sensor_pixel_size_um / 1000.0
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == name)
    }

    pub fn z_planes(&self) -> &[u32] {
        &self.zs
    }

    pub fn fovs(&self) -> &[u32] {
        &self.fovs
    }

    pub fn tile_dims(&self) -> (u32, u32) {
        (self.tile_w, self.tile_h)
    }

    pub fn has_stage_coordinates(&self) -> bool {
        self.stage_mm.is_some()
    }

    /// FOVs present at a given z plane, ascending.
    pub fn fovs_at(&self, z: u32) -> Vec<u32> {
        let mut fovs: Vec<u32> = self
            .index
            .keys()
            .filter(|&&(_, tz)| tz == z)
            .map(|&(fov, _)| fov)
            .collect();
        fovs.sort_unstable();
        fovs
    }

    /// Decode every channel of one FOV tile. Planes deviating from the modal
    /// tile shape are center-cropped or zero-padded to it.
    pub fn load_tile(&self, fov: u32, z: u32) -> Result<FovTile> {
        let files = self
            .index
            .get(&(fov, z))
            .ok_or_else(|| anyhow!("no tile found for fov={} z={}", fov, z))?;

        let mut planes = vec![Plane::new(self.tile_w, self.tile_h); self.channels.len()];
        for file in files {
            let plane = decode_tiff_plane(&file.path)?;
            let plane = if plane.w != self.tile_w || plane.h != self.tile_h {
                warn!(
                    "tile shape {}x{} deviates from modal {}x{}, adjusting: {}",
                    plane.w,
                    plane.h,
                    self.tile_w,
                    self.tile_h,
                    file.path.display()
                );
                fit_to(&plane, self.tile_w, self.tile_h)
            } else {
                plane
            };
            let idx = self
                .channel_index(&file.suffix)
                .ok_or_else(|| anyhow!("unindexed channel suffix '{}'", file.suffix))?;
            planes[idx] = plane;
        }
        Ok(FovTile {
            fov,
            z,
            channels: planes,
        })
    }

    /// Mosaic layout at a z plane: stage-coordinate placement when available,
    /// row-major square grid otherwise.
    pub fn layout(&self, z: u32) -> Result<MosaicLayout> {
        let fovs = self.fovs_at(z);
        if fovs.is_empty() {
            return Err(anyhow!("no FOVs at z={}", z));
        }
        if let Some(stage) = &self.stage_mm {
            if fovs.iter().all(|fov| stage.contains_key(fov)) {
                return Ok(self.layout_from_stage(&fovs, stage));
            }
            warn!("stage coordinates incomplete at z={}, using grid layout", z);
        }
        Ok(grid_layout(&fovs, self.tile_w, self.tile_h))
    }

    fn layout_from_stage(&self, fovs: &[u32], stage: &HashMap<u32, (f64, f64)>) -> MosaicLayout {
        let mm_per_px = self.mm_per_px();
        // Stage positions are FOV centers; shift so the minimum origin is 0.
        let mut raw: Vec<(u32, i64, i64)> = fovs
            .iter()
            .map(|&fov| {
                let (x_mm, y_mm) = stage[&fov];
                let cx = (x_mm / mm_per_px).round() as i64;
                let cy = (y_mm / mm_per_px).round() as i64;
                (
                    fov,
                    cx - self.tile_w as i64 / 2,
                    cy - self.tile_h as i64 / 2,
                )
            })
            .collect();
        let min_x = raw.iter().map(|&(_, x, _)| x).min().unwrap_or(0);
        let min_y = raw.iter().map(|&(_, _, y)| y).min().unwrap_or(0);
        for (_, x, y) in raw.iter_mut() {
            *x -= min_x;
            *y -= min_y;
        }
        let width = raw.iter().map(|&(_, x, _)| x).max().unwrap_or(0) as u32 + self.tile_w;
        let height = raw.iter().map(|&(_, _, y)| y).max().unwrap_or(0) as u32 + self.tile_h;
        let origins = raw
            .into_iter()
            .map(|(fov, x, y)| (fov, x as u32, y as u32))
            .collect();
        MosaicLayout {
            origins,
            width,
            height,
            tile_w: self.tile_w,
            tile_h: self.tile_h,
        }
    }
}

/// Row-major square grid placement in ascending FOV order.
fn grid_layout(fovs: &[u32], tile_w: u32, tile_h: u32) -> MosaicLayout {
    let n = fovs.len() as u32;
    let cols = (n as f64).sqrt().ceil() as u32;
    let rows = n.div_ceil(cols);
    let origins = fovs
        .iter()
        .enumerate()
        .map(|(idx, &fov)| {
            let r = idx as u32 / cols;
            let c = idx as u32 % cols;
            (fov, c * tile_w, r * tile_h)
        })
        .collect();
    MosaicLayout {
        origins,
        width: cols * tile_w,
        height: rows * tile_h,
        tile_w,
        tile_h,
    }
}

/// Parse a tile filename like "manual_12_3_Fluorescence_405_nm_Ex.tiff"
/// → Some((12, 3, "Fluorescence_405_nm_Ex")).
pub fn parse_tile_name(name: &str) -> Option<(u32, u32, String)> {
    let lower = name.to_lowercase();
    let stem_len = if lower.ends_with(".tiff") {
        name.len() - 5
    } else if lower.ends_with(".tif") {
        name.len() - 4
    } else {
        return None;
    };
    let stem = &name[..stem_len];
    let rest = stem.strip_prefix("manual_")?;
    let mut parts = rest.splitn(3, '_');
    let fov = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    let suffix = parts.next()?;
    if suffix.is_empty() {
        return None;
    }
    Some((fov, z, suffix.to_string()))
}

fn collect_tiffs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_tiffs(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn decode_tiff_plane(path: &Path) -> Result<Plane> {
    let img = image::ImageReader::open(path)
        .with_context(|| format!("opening '{}'", path.display()))?
        .decode()
        .with_context(|| format!("decoding '{}'", path.display()))?;
    let gray = img.to_luma16();
    let (w, h) = gray.dimensions();
    Plane::from_vec(w, h, gray.into_raw())
}

/// The most common tile shape across a sample of tiles, ties broken toward
/// the first shape seen. Probes headers only.
fn modal_tile_shape(index: &HashMap<(u32, u32), Vec<ChannelFile>>) -> Result<(u32, u32)> {
    let mut keys: Vec<&(u32, u32)> = index.keys().collect();
    keys.sort_unstable();
    let mut counts: Vec<((u32, u32), usize)> = Vec::new();
    for key in keys.iter().take(SHAPE_SAMPLE) {
        let file = &index[*key][0];
        let dims = image::ImageReader::open(&file.path)
            .with_context(|| format!("opening '{}'", file.path.display()))?
            .into_dimensions()
            .with_context(|| format!("reading dimensions of '{}'", file.path.display()))?;
        match counts.iter_mut().find(|(shape, _)| *shape == dims) {
            Some((_, n)) => *n += 1,
            None => counts.push((dims, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(_, n)| n)
        .map(|(shape, _)| shape)
        .ok_or_else(|| anyhow!("no tiles to derive shape from"))
}

/// Load stage coordinates, preferring the calibrated file the offline
/// registration pipeline writes. Returns fov → (x_mm, y_mm).
fn load_stage_coordinates(root: &Path) -> Result<Option<HashMap<u32, (f64, f64)>>> {
    for name in ["coordinates_calibrated.csv", "coordinates.csv"] {
        for candidate in [root.join(name), root.join("0").join(name)] {
            if candidate.is_file() {
                let coords = parse_coordinates_csv(&candidate)
                    .with_context(|| format!("parsing '{}'", candidate.display()))?;
                info!("stage coordinates loaded from {}", candidate.display());
                return Ok(Some(coords));
            }
        }
    }
    Ok(None)
}

fn parse_coordinates_csv(path: &Path) -> Result<HashMap<u32, (f64, f64)>> {
    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines();
    let header = lines.next().ok_or_else(|| anyhow!("empty file"))?;
    let cols: Vec<&str> = header.split(',').map(str::trim).collect();
    let fov_col = find_column(&cols, "fov")?;
    let x_col = find_column(&cols, "x (mm)")?;
    let y_col = find_column(&cols, "y (mm)")?;

    let mut out = HashMap::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let get = |col: usize| -> Result<&str> {
            fields
                .get(col)
                .copied()
                .ok_or_else(|| anyhow!("line {}: missing column {}", lineno + 2, col))
        };
        let fov: u32 = get(fov_col)?
            .parse()
            .with_context(|| format!("line {}: bad fov", lineno + 2))?;
        let x: f64 = get(x_col)?
            .parse()
            .with_context(|| format!("line {}: bad x (mm)", lineno + 2))?;
        let y: f64 = get(y_col)?
            .parse()
            .with_context(|| format!("line {}: bad y (mm)", lineno + 2))?;
        out.insert(fov, (x, y));
    }
    if out.is_empty() {
        return Err(anyhow!("no coordinate rows"));
    }
    Ok(out)
}

fn find_column(cols: &[&str], name: &str) -> Result<usize> {
    cols.iter()
        .position(|c| *c == name)
        .ok_or_else(|| anyhow!("missing column '{}'", name))
}
