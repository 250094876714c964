use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use rtview::cache::TileCache;
use rtview::core::display::{auto_window, to_u8};
use rtview::core::mosaic::Rect;
use rtview::datasource::DataSource;
use rtview::pyramid::PyramidProvider;
use rtview::stitch::Stitcher;
use rtview::viewport::{self, DisplayPlan, Viewport, ZoomPolicy};
use rtview::volume::load_volume;
use rtview::zstack::ZStack;

const TILE: u32 = 32;
const PIXEL_SIZE_UM: f64 = 1.0; // 0.001 mm/px keeps stage math exact

/// Write a synthetic 2x2-grid acquisition: 4 FOVs, 2 channels, 2 z planes,
/// with stage coordinates matching the grid.
fn write_acquisition(root: &Path) -> Result<()> {
    fs::write(
        root.join("acquisition parameters.json"),
        format!(r#"{{"sensor_pixel_size_um": {}}}"#, PIXEL_SIZE_UM),
    )?;

    let mm_per_px = PIXEL_SIZE_UM / 1000.0;
    let mut csv = String::from("fov,x (mm),y (mm)\n");
    for fov in 0..4u32 {
        let col = fov % 2;
        let row = fov / 2;
        // Stage positions are FOV centers
        let cx_px = col * TILE + TILE / 2;
        let cy_px = row * TILE + TILE / 2;
        csv.push_str(&format!(
            "{},{},{}\n",
            fov,
            cx_px as f64 * mm_per_px,
            cy_px as f64 * mm_per_px
        ));

        for (suffix, mult) in [("Fluorescence_405_nm_Ex", 1u16), ("Fluorescence_488_nm_Ex", 10)] {
            for z in 0..2u32 {
                let value = (fov as u16 + 1) * mult + z as u16 * 1000;
                let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(
                    TILE,
                    TILE,
                    image::Luma([value]),
                );
                img.save(root.join(format!("manual_{}_{}_{}.tiff", fov, z, suffix)))?;
            }
        }
    }
    fs::write(root.join("coordinates.csv"), csv)?;
    Ok(())
}

#[test]
fn test_end_to_end_view_pipeline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_acquisition(dir.path())?;

    let source = Arc::new(DataSource::open(dir.path())?);
    assert_eq!(source.fovs(), &[0, 1, 2, 3]);
    assert_eq!(source.z_planes(), &[0, 1]);
    assert_eq!(
        source.channels(),
        &["Fluorescence_405_nm_Ex", "Fluorescence_488_nm_Ex"]
    );
    assert!(source.has_stage_coordinates());

    // Stage-coordinate layout reproduces the 2x2 grid
    let layout = source.layout(0)?;
    assert_eq!((layout.width, layout.height), (TILE * 2, TILE * 2));
    assert_eq!(layout.origin(0), Some((0, 0)));
    assert_eq!(layout.origin(3), Some((TILE, TILE)));

    let tiles = Arc::new(TileCache::new(source.clone(), 64 * 1024 * 1024));
    let provider = PyramidProvider::new(tiles.clone(), &[4, 8, 16], 64 * 1024 * 1024)?;

    // Base mosaic carries each FOV's fill value in channel 0
    let base = provider.level(0, 0, 1)?;
    assert_eq!(base.get(0, 0), 1);
    assert_eq!(base.get(TILE, 0), 2);
    assert_eq!(base.get(0, TILE), 3);
    assert_eq!(base.get(TILE, TILE), 4);

    // Constant tiles stay constant under block-mean downsampling
    let l4 = provider.level(0, 0, 4)?;
    assert_eq!((l4.w, l4.h), (TILE / 2, TILE / 2));
    assert_eq!(l4.get(0, 0), 1);
    assert_eq!(l4.get(l4.w - 1, l4.h - 1), 4);

    // Viewport planning: zoomed in on FOV 0 → live stitch
    let policy = ZoomPolicy::new(provider.coarsest());
    let vp = Viewport {
        cx: TILE as f64 / 2.0,
        cy: TILE as f64 / 2.0,
        zoom: 1.0,
        screen_w: TILE,
        screen_h: TILE,
    };
    let plan = viewport::plan(&vp, &layout, &policy, provider.factors(), 16);
    let DisplayPlan::LiveStitch { fovs, region } = plan else {
        panic!("expected a live-stitch plan");
    };
    assert_eq!(fovs, vec![0]);

    let stitcher = Stitcher::new(16);
    let composite = stitcher.composite_region(&tiles, &layout, 0, 0, region, &fovs)?;
    assert!(composite.data.iter().any(|&v| v == 1));

    // Second channel of the same tiles differs by the channel multiplier
    let composite_ch1 = stitcher.composite_region(&tiles, &layout, 0, 1, region, &fovs)?;
    assert!(composite_ch1.data.iter().any(|&v| v == 10));

    // Zoomed out → pyramid plan at the coarsest level
    let far = Viewport {
        cx: TILE as f64,
        cy: TILE as f64,
        zoom: 1.0 / 16.0,
        screen_w: TILE,
        screen_h: TILE,
    };
    let plan = viewport::plan(&far, &layout, &policy, provider.factors(), 16);
    assert!(matches!(plan, DisplayPlan::Pyramid { factor: 16, .. }));

    // Map view stays within the thumbnail
    let mv = viewport::map_view(&vp, &layout, provider.coarsest());
    assert_eq!((mv.thumb_w, mv.thumb_h), (4, 4));
    assert!(mv.rect.x + mv.rect.w <= mv.thumb_w);

    Ok(())
}

#[test]
fn test_end_to_end_zstack_and_volume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_acquisition(dir.path())?;

    let source = Arc::new(DataSource::open(dir.path())?);
    let zstack = ZStack::from_source(&source)?;
    assert_eq!(zstack.planes(), &[0, 1]);
    assert_eq!(zstack.step(0, 1), 1);
    assert!(zstack.select(7).is_err());

    let tiles = Arc::new(TileCache::new(source.clone(), 64 * 1024 * 1024));
    let provider = PyramidProvider::new(tiles, &[4, 8, 16], 64 * 1024 * 1024)?;

    // z=1 planes carry the +1000 offset
    let base_z1 = provider.level(1, 0, 1)?;
    assert_eq!(base_z1.get(0, 0), 1001);

    // Budget for a factor-2 stack: 2 planes of (64/2)^2 u16 = 4096 bytes
    let budget = 2 * (TILE as u64) * (TILE as u64) * 2;
    let volume = load_volume(&provider, &source, 0, budget)?;
    assert_eq!(volume.plan.factor, 2);
    assert_eq!(volume.plan.depth, 2);
    assert_eq!(volume.planes.len(), 2);
    assert_eq!((volume.planes[0].w, volume.planes[0].h), (TILE, TILE));
    assert!(volume.planes[1].get(0, 0) >= 1000);

    // Display mapping spreads the composite values over the u8 range
    let win = auto_window(&base_z1);
    let gray = to_u8(&base_z1, win);
    assert!(gray.iter().any(|&v| v == 0));
    assert!(gray.iter().any(|&v| v == 255));

    Ok(())
}

#[test]
fn test_grid_fallback_without_coordinates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_acquisition(dir.path())?;
    fs::remove_file(dir.path().join("coordinates.csv"))?;

    let source = Arc::new(DataSource::open(dir.path())?);
    assert!(!source.has_stage_coordinates());
    let layout = source.layout(0)?;
    // Square grid: 4 FOVs → 2x2
    assert_eq!((layout.width, layout.height), (TILE * 2, TILE * 2));
    assert_eq!(layout.origin(1), Some((TILE, 0)));

    // Stitching still works off the grid layout
    let tiles = Arc::new(TileCache::new(source, 64 * 1024 * 1024));
    let stitcher = Stitcher::new(16);
    let region = Rect::new(0, 0, TILE * 2, TILE * 2);
    let out = stitcher.composite_region(&tiles, &layout, 0, 0, region, &[0, 1, 2, 3])?;
    assert_eq!(out.get(0, 0), 1);
    assert_eq!(out.get(TILE, TILE), 4);
    Ok(())
}
