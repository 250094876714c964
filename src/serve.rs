use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use clap::Args;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::{mpsc, Semaphore};
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::TileCache;
use crate::core::display::{auto_window, encode_jpeg_gray, to_u8};
use crate::core::mosaic::{extract, Plane, Rect};
use crate::core::{resize_gray, ResampleFilter};
use crate::datasource::DataSource;
use crate::pyramid::PyramidProvider;
use crate::stitch::{Stitcher, DEFAULT_BATCH_LIMIT};
use crate::viewport::{self, DisplayPlan, Viewport, ZoomPolicy};
use crate::volume::plan_volume;
use crate::zstack::ZStack;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Acquisition root directory
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// JPEG quality for served composites
    #[arg(long, default_value_t = 90)]
    quality: u8,

    /// Decoded-tile cache size in MiB
    #[arg(long, default_value_t = 1024)]
    tile_cache_mb: u64,

    /// Overview-level cache size in MiB
    #[arg(long, default_value_t = 512)]
    level_cache_mb: u64,

    /// Encoded-response cache entries
    #[arg(long, default_value_t = 2048)]
    response_cache_entries: u64,

    /// Pyramid downsample factors
    #[arg(long, value_delimiter = ',', default_values_t = [4u32, 8, 16])]
    pyramid_levels: Vec<u32>,

    /// Maximum FOVs stitched live per composite
    #[arg(long, default_value_t = DEFAULT_BATCH_LIMIT)]
    batch_limit: usize,

    /// Demagnification at or below which visible FOVs are stitched live
    #[arg(long, default_value_t = 2.0)]
    live_stitch_demag: f64,

    /// Maximum zoom-in factor over native resolution
    #[arg(long, default_value_t = 8.0)]
    max_zoom_in: f64,

    /// Resample filter for display resizes: bilinear, bicubic, lanczos3
    #[arg(long, default_value = "bilinear")]
    filter: String,

    /// Save served composites under this directory
    #[arg(long)]
    save_views_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 2048)]
    write_queue_size: usize,

    #[arg(long, default_value_t = 30)]
    metrics_interval_secs: u64,

    #[arg(long, default_value_t = 32)]
    max_inflight_composites: usize,

    #[arg(long)]
    rayon_threads: Option<usize>,

    #[arg(long, default_value_t = 4)]
    tokio_workers: usize,

    #[arg(long, default_value_t = 16)]
    tokio_blocking_threads: usize,
}

#[derive(Clone)]
struct AppState {
    source: Arc<DataSource>,
    tiles: Arc<TileCache>,
    provider: Arc<PyramidProvider>,
    stitcher: Arc<Stitcher>,
    zstack: Arc<ZStack>,
    policy: ZoomPolicy,
    responses: Arc<moka::sync::Cache<ViewKey, Bytes>>,
    quality: u8,
    filter: ResampleFilter,
    metrics: Arc<Mutex<Metrics>>,
    inflight: Arc<InflightComposites>,
    inflight_limit: Arc<Semaphore>,
    writer: Option<mpsc::Sender<WriteJob>>,
    save_views_dir: Option<PathBuf>,
}

#[derive(Clone, Hash, Eq, PartialEq, Debug)]
enum ViewKey {
    Overview {
        z: u32,
        channel: usize,
        factor: u32,
    },
    View {
        z: u32,
        channel: usize,
        cx_px: i64,
        cy_px: i64,
        zoom_milli: i64,
        w: u32,
        h: u32,
    },
    Fov {
        z: u32,
        channel: usize,
        fov: u32,
    },
}

#[derive(Clone)]
struct WriteJob {
    path: PathBuf,
    bytes: Bytes,
}

#[derive(Deserialize)]
struct ViewQuery {
    cx: Option<f64>,
    cy: Option<f64>,
    zoom: Option<f64>,
    w: Option<u32>,
    h: Option<u32>,
}

#[derive(Deserialize)]
struct VolumeQuery {
    budget_mb: Option<u64>,
}

#[derive(Serialize)]
struct AcquisitionSummary {
    channels: Vec<String>,
    z_planes: Vec<u32>,
    fov_count: usize,
    tile_w: u32,
    tile_h: u32,
    mosaic_w: u32,
    mosaic_h: u32,
    mm_per_px: f64,
    pyramid_factors: Vec<u32>,
    stage_coordinates: bool,
    batch_limit: usize,
}

struct InflightComposites {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InflightComposites {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }

    fn enter(&self) -> InflightGuard<'_> {
        let cur = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(cur, Ordering::SeqCst);
        InflightGuard { stats: self }
    }

    fn take_max(&self) -> usize {
        self.max
            .swap(self.current.load(Ordering::SeqCst), Ordering::SeqCst)
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

struct InflightGuard<'a> {
    stats: &'a InflightComposites,
}

impl<'a> Drop for InflightGuard<'a> {
    fn drop(&mut self) {
        self.stats.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default, Clone)]
struct Metrics {
    total: u64,
    overview: u64,
    stitched: u64,
    pyramid: u64,
    fallback: u64,
    cache_hit: u64,
    fov: u64,
    ms_sum: u128,
    ms_max: u128,
}

impl Metrics {
    fn record(&mut self, kind: &str, ms: u128) {
        self.total += 1;
        self.ms_sum += ms;
        if ms > self.ms_max {
            self.ms_max = ms;
        }
        match kind {
            "overview" => self.overview += 1,
            "stitched" => self.stitched += 1,
            "pyramid" => self.pyramid += 1,
            "fallback" => self.fallback += 1,
            "cache_hit" => self.cache_hit += 1,
            "fov" => self.fov += 1,
            _ => {}
        }
    }

    fn take(&mut self) -> Metrics {
        let snapshot = self.clone();
        *self = Metrics::default();
        snapshot
    }
}

pub fn run(args: ServeArgs) -> Result<()> {
    if let Some(threads) = args.rayon_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| anyhow!("rayon init failed: {}", e))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.tokio_workers)
        .max_blocking_threads(args.tokio_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: ServeArgs) -> Result<()> {
    let filter: ResampleFilter = args
        .filter
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let source = Arc::new(DataSource::open(&args.dir)?);
    let zstack = Arc::new(ZStack::from_source(&source)?);
    let tiles = Arc::new(TileCache::new(
        source.clone(),
        args.tile_cache_mb * 1024 * 1024,
    ));
    let provider = Arc::new(PyramidProvider::new(
        tiles.clone(),
        &args.pyramid_levels,
        args.level_cache_mb * 1024 * 1024,
    )?);
    let mut policy = ZoomPolicy::new(provider.coarsest());
    policy.live_stitch_demag = args.live_stitch_demag;
    policy.max_zoom_in = args.max_zoom_in;

    let writer = if let Some(dir) = args.save_views_dir.clone() {
        fs::create_dir_all(&dir).ok();
        let (tx, mut rx) = mpsc::channel::<WriteJob>(args.write_queue_size);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Some(parent) = job.path.parent() {
                    if let Err(err) = fs::create_dir_all(parent) {
                        info!("write error mkdir {}: {}", parent.display(), err);
                        continue;
                    }
                }
                if let Err(err) = fs::write(&job.path, &job.bytes) {
                    info!("write error {}: {}", job.path.display(), err);
                }
            }
        });
        info!("save_views_dir enabled: {}", dir.display());
        Some(tx)
    } else {
        None
    };

    let responses = moka::sync::Cache::builder()
        .max_capacity(args.response_cache_entries)
        .time_to_idle(Duration::from_secs(300))
        .build();

    let state = AppState {
        source: source.clone(),
        tiles,
        provider,
        stitcher: Arc::new(Stitcher::new(args.batch_limit)),
        zstack,
        policy,
        responses: Arc::new(responses),
        quality: args.quality,
        filter,
        metrics: Arc::new(Mutex::new(Metrics::default())),
        inflight: Arc::new(InflightComposites::new()),
        inflight_limit: Arc::new(Semaphore::new(args.max_inflight_composites)),
        writer,
        save_views_dir: args.save_views_dir.clone(),
    };

    if args.metrics_interval_secs > 0 {
        spawn_metrics_loop(
            state.metrics.clone(),
            state.inflight.clone(),
            Duration::from_secs(args.metrics_interval_secs),
        );
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/acquisition", get(get_acquisition))
        .route("/overview/:z/:channel/:level", get(get_overview))
        .route("/view/:z/:channel", get(get_view))
        .route("/map/:z/:channel", get(get_map))
        .route("/fov/:z/:channel/:tile", get(get_fov))
        .route("/volume/:channel", get(get_volume_plan))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.port);
    info!(
        "listening on http://{} (rayon_threads={}, tokio_workers={}, tokio_blocking_threads={})",
        addr,
        rayon::current_num_threads(),
        args.tokio_workers,
        args.tokio_blocking_threads
    );
    for z in source.z_planes() {
        info!("view url: http://{}/view/{}/{}", addr, z, source.channels()[0]);
    }
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_metrics_loop(
    metrics: Arc<Mutex<Metrics>>,
    inflight: Arc<InflightComposites>,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let snapshot = metrics.lock().unwrap().take();
            if snapshot.total == 0 {
                continue;
            }
            let avg = snapshot.ms_sum / snapshot.total as u128;
            let inflight_current = inflight.current();
            let inflight_max = inflight.take_max();
            let mut sys = System::new();
            let (rss_bytes, cpu_pct) = if let Ok(pid) = sysinfo::get_current_pid() {
                sys.refresh_process(pid);
                sys.process(pid)
                    .map(|p| (p.memory(), p.cpu_usage()))
                    .unwrap_or((0, 0.0))
            } else {
                (0, 0.0)
            };
            info!(
                "metrics total={} overview={} stitched={} pyramid={} fallback={} cache_hit={} fov={} avg_ms={} max_ms={} inflight_current={} inflight_max={} rss_mb={} cpu_pct={:.1}",
                snapshot.total,
                snapshot.overview,
                snapshot.stitched,
                snapshot.pyramid,
                snapshot.fallback,
                snapshot.cache_hit,
                snapshot.fov,
                avg,
                snapshot.ms_max,
                inflight_current,
                inflight_max,
                rss_bytes / 1024 / 1024,
                cpu_pct
            );
        }
    });
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn get_acquisition(State(state): State<AppState>) -> Result<Json<AcquisitionSummary>, StatusCode> {
    let z = state.source.z_planes()[0];
    let layout = state
        .source
        .layout(z)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let (tile_w, tile_h) = state.source.tile_dims();
    Ok(Json(AcquisitionSummary {
        channels: state.source.channels().to_vec(),
        z_planes: state.source.z_planes().to_vec(),
        fov_count: state.source.fovs().len(),
        tile_w,
        tile_h,
        mosaic_w: layout.width,
        mosaic_h: layout.height,
        mm_per_px: state.source.mm_per_px(),
        pyramid_factors: state.provider.factors().to_vec(),
        stage_coordinates: state.source.has_stage_coordinates(),
        batch_limit: state.stitcher.batch_limit(),
    }))
}

async fn get_overview(
    State(state): State<AppState>,
    AxumPath((z, channel_name, factor)): AxumPath<(u32, String, u32)>,
) -> Result<Response, StatusCode> {
    let start = Instant::now();
    let channel = resolve(&state, z, &channel_name)?;
    if !state.provider.factors().contains(&factor) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let key = ViewKey::Overview { z, channel, factor };
    if let Some(bytes) = state.responses.get(&key) {
        record(&state, "cache_hit", start);
        return Ok(jpeg_response(bytes));
    }

    let permit = acquire(&state).await?;
    let blocking_state = state.clone();
    let bytes = task::spawn_blocking(move || -> Result<Vec<u8>> {
        let _permit = permit;
        let _inflight = blocking_state.inflight.enter();
        let plane = blocking_state.provider.level(z, channel, factor)?;
        encode_plane(&plane, blocking_state.quality)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(internal)?;

    let bytes = Bytes::from(bytes);
    state.responses.insert(key, bytes.clone());
    enqueue_save(
        &state,
        format!("overview_z{}_{}_{}x.jpg", z, channel_name, factor),
        &bytes,
    );
    record(&state, "overview", start);
    info!(
        "overview z={} channel={} factor={} ms={}",
        z,
        channel_name,
        factor,
        start.elapsed().as_millis()
    );
    Ok(jpeg_response(bytes))
}

async fn get_view(
    State(state): State<AppState>,
    AxumPath((z, channel_name)): AxumPath<(u32, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, StatusCode> {
    let start = Instant::now();
    let channel = resolve(&state, z, &channel_name)?;
    let layout = state.source.layout(z).map_err(internal)?;
    let vp = viewport_from_query(&state, &layout, &query);
    let key = view_key(z, channel, &vp);
    if let Some(bytes) = state.responses.get(&key) {
        record(&state, "cache_hit", start);
        return Ok(jpeg_response(bytes));
    }

    let permit = acquire(&state).await?;
    let blocking_state = state.clone();
    let result = task::spawn_blocking(move || -> Result<(Vec<u8>, &'static str)> {
        let _permit = permit;
        let _inflight = blocking_state.inflight.enter();
        render_view(&blocking_state, z, channel, &vp)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(internal)?;

    let (bytes, kind) = result;
    let bytes = Bytes::from(bytes);
    state.responses.insert(key, bytes.clone());
    enqueue_save(
        &state,
        format!(
            "view_z{}_{}_cx{}_cy{}_zm{}_{}x{}.jpg",
            z,
            channel_name,
            vp.cx.round() as i64,
            vp.cy.round() as i64,
            (vp.zoom * 1000.0).round() as i64,
            vp.screen_w,
            vp.screen_h
        ),
        &bytes,
    );
    record(&state, kind, start);
    info!(
        "view {} z={} channel={} cx={:.1} cy={:.1} zoom={:.3} ms={}",
        kind,
        z,
        channel_name,
        vp.cx,
        vp.cy,
        vp.zoom,
        start.elapsed().as_millis()
    );
    Ok(jpeg_response(bytes))
}

async fn get_map(
    State(state): State<AppState>,
    AxumPath((z, channel_name)): AxumPath<(u32, String)>,
    Query(query): Query<ViewQuery>,
) -> Result<Json<viewport::MapView>, StatusCode> {
    let _channel = resolve(&state, z, &channel_name)?;
    let layout = state.source.layout(z).map_err(internal)?;
    let vp = viewport_from_query(&state, &layout, &query);
    Ok(Json(viewport::map_view(
        &vp,
        &layout,
        state.provider.coarsest(),
    )))
}

async fn get_fov(
    State(state): State<AppState>,
    AxumPath((z, channel_name, tile)): AxumPath<(u32, String, String)>,
) -> Result<Response, StatusCode> {
    let start = Instant::now();
    let channel = resolve(&state, z, &channel_name)?;
    let fov = parse_fov_name(&tile).ok_or(StatusCode::BAD_REQUEST)?;
    let key = ViewKey::Fov { z, channel, fov };
    if let Some(bytes) = state.responses.get(&key) {
        record(&state, "cache_hit", start);
        return Ok(jpeg_response(bytes));
    }

    let permit = acquire(&state).await?;
    let blocking_state = state.clone();
    let bytes = task::spawn_blocking(move || -> Result<Vec<u8>> {
        let _permit = permit;
        let _inflight = blocking_state.inflight.enter();
        let tile = blocking_state.tiles.get(fov, z)?;
        let plane = tile.channel(channel)?;
        encode_plane(plane, blocking_state.quality)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|_| StatusCode::NOT_FOUND)?;

    let bytes = Bytes::from(bytes);
    state.responses.insert(key, bytes.clone());
    record(&state, "fov", start);
    Ok(jpeg_response(bytes))
}

async fn get_volume_plan(
    State(state): State<AppState>,
    AxumPath(channel_name): AxumPath<String>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<crate::volume::VolumePlan>, StatusCode> {
    if state.source.channel_index(&channel_name).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let z = state.source.z_planes()[0];
    let layout = state.source.layout(z).map_err(internal)?;
    let budget = query.budget_mb.unwrap_or(512) * 1024 * 1024;
    let plan = plan_volume(
        layout.width,
        layout.height,
        state.source.z_planes().len() as u32,
        budget,
    )
    .map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(Json(plan))
}

// ---------------------------------------------------------------------------
// Rendering helpers — shared by the view handler and its fallback path
// ---------------------------------------------------------------------------

fn render_view(
    state: &AppState,
    z: u32,
    channel: usize,
    vp: &Viewport,
) -> Result<(Vec<u8>, &'static str)> {
    let layout = state.source.layout(z)?;
    let plan = viewport::plan(
        vp,
        &layout,
        &state.policy,
        state.provider.factors(),
        state.stitcher.batch_limit(),
    );
    let (plane, kind) = match plan {
        DisplayPlan::LiveStitch { ref fovs, region } => {
            match state
                .stitcher
                .composite_region(&state.tiles, &layout, z, channel, region, fovs)
            {
                Ok(p) => (p, "stitched"),
                Err(err) => {
                    info!(
                        "stitch failed z={} channel={}, serving pyramid fallback: {:#}",
                        z, channel, err
                    );
                    let factor = state.provider.factors()[0];
                    (pyramid_crop(state, z, channel, factor, region)?, "fallback")
                }
            }
        }
        DisplayPlan::Pyramid { factor, region } => {
            (pyramid_crop(state, z, channel, factor, region)?, "pyramid")
        }
    };
    let win = auto_window(&plane);
    let gray = to_u8(&plane, win);
    let resized = resize_gray(
        &gray,
        plane.w,
        plane.h,
        vp.screen_w,
        vp.screen_h,
        state.filter,
    )?;
    let bytes = encode_jpeg_gray(&resized, vp.screen_w, vp.screen_h, state.quality)?;
    Ok((bytes, kind))
}

fn pyramid_crop(
    state: &AppState,
    z: u32,
    channel: usize,
    factor: u32,
    region: Rect,
) -> Result<Plane> {
    let level = state.provider.level(z, channel, factor)?;
    let scaled = Rect::new(
        region.x / factor,
        region.y / factor,
        region.w.div_ceil(factor).max(1),
        region.h.div_ceil(factor).max(1),
    );
    Ok(extract(&level, scaled))
}

fn encode_plane(plane: &Plane, quality: u8) -> Result<Vec<u8>> {
    let win = auto_window(plane);
    let gray = to_u8(plane, win);
    encode_jpeg_gray(&gray, plane.w, plane.h, quality)
}

fn viewport_from_query(
    state: &AppState,
    layout: &crate::datasource::MosaicLayout,
    query: &ViewQuery,
) -> Viewport {
    let screen_w = query.w.unwrap_or(1024).clamp(16, 8192);
    let screen_h = query.h.unwrap_or(768).clamp(16, 8192);
    let fit_zoom = (screen_w as f64 / layout.width as f64)
        .min(screen_h as f64 / layout.height as f64);
    Viewport {
        cx: query.cx.unwrap_or(layout.width as f64 / 2.0),
        cy: query.cy.unwrap_or(layout.height as f64 / 2.0),
        zoom: state.policy.clamp_zoom(query.zoom.unwrap_or(fit_zoom)),
        screen_w,
        screen_h,
    }
}

fn view_key(z: u32, channel: usize, vp: &Viewport) -> ViewKey {
    ViewKey::View {
        z,
        channel,
        cx_px: vp.cx.round() as i64,
        cy_px: vp.cy.round() as i64,
        zoom_milli: (vp.zoom * 1000.0).round() as i64,
        w: vp.screen_w,
        h: vp.screen_h,
    }
}

/// Validate z and channel path params, returning the channel index.
fn resolve(state: &AppState, z: u32, channel_name: &str) -> Result<usize, StatusCode> {
    state.zstack.select(z).map_err(|_| StatusCode::NOT_FOUND)?;
    state
        .source
        .channel_index(channel_name)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn acquire(state: &AppState) -> Result<tokio::sync::OwnedSemaphorePermit, StatusCode> {
    state
        .inflight_limit
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn record(state: &AppState, kind: &str, start: Instant) {
    state
        .metrics
        .lock()
        .unwrap()
        .record(kind, start.elapsed().as_millis());
}

fn internal<E: std::fmt::Display>(err: E) -> StatusCode {
    info!("internal error: {}", err);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn enqueue_save(state: &AppState, name: String, bytes: &Bytes) {
    let Some(writer) = &state.writer else { return };
    let Some(root) = &state.save_views_dir else {
        return;
    };
    let job = WriteJob {
        path: root.join(name),
        bytes: bytes.clone(),
    };
    if writer.try_send(job).is_err() {
        info!("write queue full, dropping saved view");
    }
}

/// Parse an FOV tile name like "12.jpg" → Some(12).
fn parse_fov_name(name: &str) -> Option<u32> {
    let trimmed = name.strip_suffix(".jpg").unwrap_or(name);
    trimmed.parse().ok()
}

fn jpeg_response(bytes: Bytes) -> Response {
    let mut resp = Response::new(bytes.into());
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fov_name() {
        assert_eq!(parse_fov_name("12.jpg"), Some(12));
        assert_eq!(parse_fov_name("0"), Some(0));
        assert_eq!(parse_fov_name("abc.jpg"), None);
        assert_eq!(parse_fov_name(""), None);
    }

    #[test]
    fn test_view_key_quantization() {
        let a = view_key(
            0,
            1,
            &Viewport {
                cx: 100.2,
                cy: 50.4,
                zoom: 1.0004,
                screen_w: 800,
                screen_h: 600,
            },
        );
        let b = view_key(
            0,
            1,
            &Viewport {
                cx: 100.4,
                cy: 49.6,
                zoom: 0.9996,
                screen_w: 800,
                screen_h: 600,
            },
        );
        // Sub-pixel pans and sub-millizoom changes share a cache slot
        assert_eq!(a, b);
        let c = view_key(
            1,
            1,
            &Viewport {
                cx: 100.2,
                cy: 50.4,
                zoom: 1.0,
                screen_w: 800,
                screen_h: 600,
            },
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_metrics_record_and_take() {
        let mut m = Metrics::default();
        m.record("stitched", 10);
        m.record("pyramid", 30);
        m.record("cache_hit", 0);
        let snap = m.take();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.stitched, 1);
        assert_eq!(snap.pyramid, 1);
        assert_eq!(snap.cache_hit, 1);
        assert_eq!(snap.ms_max, 30);
        assert_eq!(m.total, 0);
    }

    #[test]
    fn test_inflight_high_water_mark() {
        let inflight = InflightComposites::new();
        {
            let _a = inflight.enter();
            let _b = inflight.enter();
            assert_eq!(inflight.current(), 2);
        }
        assert_eq!(inflight.current(), 0);
        assert_eq!(inflight.take_max(), 2);
    }
}
