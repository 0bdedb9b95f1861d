// Concurrent pipeline orchestration
//
// Three outer worker threads (IR preprocess, visible preprocess, fusion
// compositor) plus the background reconstructor's own internal worker
// pair, all cooperating through `RingBuffer`s and a single shared stop
// flag -- the same "own a handful of thread::JoinHandle"s" shape
// `Category5::spin`/`run_forever` uses for its own subsystems, just with
// more than one handle and a cooperative stop instead of a wayland event
// loop driving the lifetime.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use fusion_utils::log;
use fusion_utils::ring::RingBuffer;
use fusion_utils::timing::TimingManager;
use fusion_utils::{debug, error, info};

use crate::background::BackgroundReconstructor;
use crate::clahe::ClaheConverter;
use crate::compositor::FusionCompositor;
use crate::config::Options;
use crate::error::FusionError;
use crate::frame::{Plane, PlaneBuf, Yuv420Buf};
use crate::registration::{self, AffineMatrix, ControlPoint, WarpTable};
use fusion_utils::Result;

const POLL_SLEEP: Duration = Duration::from_millis(3);
const TEARDOWN_GRACE_MS: u32 = 1000;

/// Optional on-disk cache for the registration warp table, keyed by a
/// geometry + control-point fingerprint (see `registration::fingerprint`).
#[derive(Debug, Clone)]
pub struct RegistrationCache {
    pub col_table: PathBuf,
    pub row_table: PathBuf,
    pub fingerprint: PathBuf,
}

fn resolve_warp_table(
    points: &[ControlPoint],
    base_w: usize,
    base_h: usize,
    unreg_w: usize,
    unreg_h: usize,
    cache: Option<&RegistrationCache>,
) -> Result<WarpTable> {
    let fp = registration::fingerprint(base_w, base_h, unreg_w, unreg_h, points);

    if let Some(cache) = cache {
        if let Some(table) = WarpTable::load_cached(
            &cache.col_table,
            &cache.row_table,
            &cache.fingerprint,
            base_w,
            base_h,
            fp,
        )? {
            info!("registration: loaded cached warp table");
            return Ok(table);
        }
    }

    let matrix: AffineMatrix = registration::solve_affine(points)?;
    let table = WarpTable::from_affine(&matrix, base_w, base_h);

    if let Some(cache) = cache {
        if let Err(e) = table.save_cached(&cache.col_table, &cache.row_table, &cache.fingerprint, fp) {
            error!("registration: failed to write warp table cache: {}", e);
        }
    }

    Ok(table)
}

/// Public surface exposed to the out-of-scope CLI/display layer: enqueue
/// raw frames, dequeue fused/debug-tap frames. Two-phase lifecycle --
/// `new` never spawns a worker; `start` does, and fails fast, tearing
/// down anything it already started, if any subcomponent can't start.
pub struct FusionPipeline {
    options: Options,
    base_w: usize,
    base_h: usize,
    unreg_w: usize,
    unreg_h: usize,

    clahe: Option<ClaheConverter>,
    table: Arc<WarpTable>,
    recon: Arc<BackgroundReconstructor>,

    ir_in: Arc<RingBuffer>,
    vis_in: Arc<RingBuffer>,
    gsci_ring: Arc<RingBuffer>,
    gsci_debug_ring: Arc<RingBuffer>,
    regt_ring: Arc<RingBuffer>,
    regt_debug_ring: Arc<RingBuffer>,
    fused_ring: Arc<RingBuffer>,
    bright_ring: Arc<RingBuffer>,

    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl FusionPipeline {
    /// Construct (but do not start) a fusion pipeline. `control_points`
    /// is the path to the control-point text file (see §6); `unreg_w` /
    /// `unreg_h` are the raw visible capture's geometry. Fails on any
    /// configuration error (bad resolution, too few control points,
    /// unparseable files) without spawning anything.
    pub fn new(
        options: Options,
        control_points: impl AsRef<Path>,
        unreg_w: u32,
        unreg_h: u32,
        registration_cache: Option<RegistrationCache>,
    ) -> Result<FusionPipeline> {
        let (base_w, base_h) = options.raw_reso.dims();
        if base_w == 0 || base_h == 0 {
            return Err(FusionError::UnsupportedResolution {
                width: base_w,
                height: base_h,
            }
            .into());
        }
        let (base_w, base_h) = (base_w as usize, base_h as usize);
        let (unreg_w, unreg_h) = (unreg_w as usize, unreg_h as usize);

        if options.ngls == 0 {
            return Err(FusionError::InvalidOption {
                name: "ngls",
                reason: "must be at least 1 (suppression histogram bin count)".into(),
            }
            .into());
        }

        let points = registration::parse_control_points(control_points)?;
        let table = resolve_warp_table(
            &points,
            base_w,
            base_h,
            unreg_w,
            unreg_h,
            registration_cache.as_ref(),
        )?;

        let clahe = ClaheConverter::new(
            options.raw_reso,
            options.raw_format,
            options.cut_thresh,
            options.clip_limit,
        )?;

        let recon = BackgroundReconstructor::new(
            base_w,
            base_h,
            options.quad,
            options.mf_size,
            options.gf_sigma,
        );

        let frames = options.ring_depth_frames.max(1);
        let gsci_y_bytes = base_w * base_h;
        let packed_bytes = Yuv420Buf::new(base_w, base_h).packed_len();
        let raw_ir_bytes = 2 * base_w * base_h;
        let raw_vis_bytes = Yuv420Buf::new(unreg_w, unreg_h).packed_len();

        Ok(FusionPipeline {
            options,
            base_w,
            base_h,
            unreg_w,
            unreg_h,
            clahe: Some(clahe),
            table: Arc::new(table),
            recon: Arc::new(recon),
            ir_in: Arc::new(RingBuffer::new(raw_ir_bytes * frames)),
            vis_in: Arc::new(RingBuffer::new(raw_vis_bytes * frames)),
            gsci_ring: Arc::new(RingBuffer::new(gsci_y_bytes * frames)),
            gsci_debug_ring: Arc::new(RingBuffer::new(packed_bytes * frames)),
            regt_ring: Arc::new(RingBuffer::new(packed_bytes * frames)),
            regt_debug_ring: Arc::new(RingBuffer::new(packed_bytes * frames)),
            fused_ring: Arc::new(RingBuffer::new(packed_bytes * frames)),
            bright_ring: Arc::new(RingBuffer::new(gsci_y_bytes * frames)),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    /// Start every worker, in dependency order: the background
    /// reconstructor's internal pair first, then the three outer
    /// stages. If any spawn fails, everything already started is
    /// stopped before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        if let Err(e) = self.try_start() {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn try_start(&mut self) -> Result<()> {
        Arc::get_mut(&mut self.recon)
            .ok_or(FusionError::AlreadyStarted)?
            .start()?;

        let clahe = self.clahe.take().ok_or(FusionError::AlreadyStarted)?;

        let (base_w, base_h) = (self.base_w, self.base_h);
        let (unreg_w, unreg_h) = (self.unreg_w, self.unreg_h);
        let table = self.table.clone();
        let recon = self.recon.clone();
        let stop = self.stop.clone();

        let ir_in = self.ir_in.clone();
        let gsci_ring = self.gsci_ring.clone();
        let gsci_debug_ring = self.gsci_debug_ring.clone();
        let handle = std::thread::Builder::new()
            .name("ir-preprocess".into())
            .spawn(move || {
                ir_preprocess_worker(
                    base_w,
                    base_h,
                    clahe,
                    ir_in,
                    gsci_ring,
                    gsci_debug_ring,
                    recon,
                    stop,
                )
            })
            .map_err(|e| FusionError::WorkerSpawn("ir-preprocess".into(), e))?;
        self.handles.push(handle);

        let vis_in = self.vis_in.clone();
        let regt_ring = self.regt_ring.clone();
        let regt_debug_ring = self.regt_debug_ring.clone();
        let stop2 = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("visible-preprocess".into())
            .spawn(move || {
                visible_preprocess_worker(
                    unreg_w,
                    unreg_h,
                    base_w,
                    base_h,
                    table,
                    vis_in,
                    regt_ring,
                    regt_debug_ring,
                    stop2,
                )
            })
            .map_err(|e| FusionError::WorkerSpawn("visible-preprocess".into(), e))?;
        self.handles.push(handle);

        let recon = self.recon.clone();
        let gsci_ring = self.gsci_ring.clone();
        let regt_ring = self.regt_ring.clone();
        let fused_ring = self.fused_ring.clone();
        let bright_ring = self.bright_ring.clone();
        let stop3 = self.stop.clone();
        let (ngls, ssr, bpr, style) = (
            self.options.ngls as usize,
            self.options.ssr,
            self.options.bpr,
            self.options.style,
        );
        let handle = std::thread::Builder::new()
            .name("fusion-compositor".into())
            .spawn(move || {
                compositor_worker(
                    base_w, base_h, ngls, ssr, bpr, style, recon, gsci_ring, regt_ring, fused_ring,
                    bright_ring, stop3,
                )
            })
            .map_err(|e| FusionError::WorkerSpawn("fusion-compositor".into(), e))?;
        self.handles.push(handle);

        Ok(())
    }

    /// Cooperatively stop every worker. Workers poll the stop flag every
    /// iteration (~3-10ms), so the grace period below is an upper bound,
    /// not a fixed wait -- it exists to catch a worker stuck on
    /// something unexpected rather than to pace normal shutdown.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        let mut grace = TimingManager::new(TEARDOWN_GRACE_MS);
        while !grace.is_overdue() && self.handles.iter().any(|h| !h.is_finished()) {
            std::thread::sleep(Duration::from_millis(5));
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }

        if let Some(recon) = Arc::get_mut(&mut self.recon) {
            recon.stop();
        } else {
            error!("fusion pipeline: reconstructor still shared at teardown, leaking its workers");
        }
    }

    pub fn raw_infrared_frame_len(&self) -> usize {
        2 * self.base_w * self.base_h
    }

    pub fn raw_visible_frame_len(&self) -> usize {
        Yuv420Buf::new(self.unreg_w, self.unreg_h).packed_len()
    }

    pub fn fused_frame_len(&self) -> usize {
        Yuv420Buf::new(self.base_w, self.base_h).packed_len()
    }

    pub fn gsci_frame_len(&self) -> usize {
        self.fused_frame_len()
    }

    pub fn registered_visible_frame_len(&self) -> usize {
        self.fused_frame_len()
    }

    pub fn bright_feature_frame_len(&self) -> usize {
        self.base_w * self.base_h
    }

    /// Enqueue one raw IR frame (2 bytes/pixel). Returns `false` (and
    /// logs) if the ring was full; the pipeline is lossy under
    /// backpressure by design (§5).
    pub fn put_infrared(&self, raw: &[u8]) -> bool {
        let written = self.ir_in.put(raw);
        if written < raw.len() {
            debug!(
                "put_infrared: ring full, dropped frame ({} of {} bytes accepted)",
                written,
                raw.len()
            );
            return false;
        }
        true
    }

    /// Enqueue one raw visible YUV 4:2:0 frame.
    pub fn put_visible(&self, raw: &[u8]) -> bool {
        let written = self.vis_in.put(raw);
        if written < raw.len() {
            debug!(
                "put_visible: ring full, dropped frame ({} of {} bytes accepted)",
                written,
                raw.len()
            );
            return false;
        }
        true
    }

    /// Non-blocking dequeue of one fused YUV frame. Returns whether a
    /// whole frame was available.
    pub fn get_fused(&self, out: &mut [u8]) -> bool {
        self.fused_ring.get_frame(out)
    }

    pub fn get_infrared_gsci(&self, out: &mut [u8]) -> bool {
        self.gsci_debug_ring.get_frame(out)
    }

    pub fn get_registered_visible(&self, out: &mut [u8]) -> bool {
        self.regt_debug_ring.get_frame(out)
    }

    pub fn get_bright_feature(&self, out: &mut [u8]) -> bool {
        self.bright_ring.get_frame(out)
    }
}

impl Drop for FusionPipeline {
    fn drop(&mut self) {
        if !self.handles.is_empty() || Arc::strong_count(&self.recon) > 1 {
            self.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ir_preprocess_worker(
    width: usize,
    height: usize,
    mut clahe: ClaheConverter,
    ir_in: Arc<RingBuffer>,
    gsci_ring: Arc<RingBuffer>,
    gsci_debug_ring: Arc<RingBuffer>,
    recon: Arc<BackgroundReconstructor>,
    stop: Arc<AtomicBool>,
) {
    let mut raw_buf = vec![0u8; clahe.raw_len()];
    let mut gsci = PlaneBuf::new(width, height);
    let mut packed = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        if !ir_in.get_frame(&mut raw_buf) {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }

        if let Err(e) = clahe.convert(&raw_buf, &mut gsci.as_plane_mut()) {
            error!("ir preprocess: clahe conversion failed: {}", e);
            continue;
        }

        recon.submit(&gsci.as_plane());

        if gsci_ring.put(gsci.as_slice()) < gsci.len() {
            debug!("ir preprocess: compositor gsci ring full, dropped frame");
        }

        clahe.pack(&gsci.as_plane(), &mut packed);
        if gsci_debug_ring.put(&packed) < packed.len() {
            debug!("ir preprocess: gsci debug ring full, dropped frame");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn visible_preprocess_worker(
    unreg_w: usize,
    unreg_h: usize,
    base_w: usize,
    base_h: usize,
    table: Arc<WarpTable>,
    vis_in: Arc<RingBuffer>,
    regt_ring: Arc<RingBuffer>,
    regt_debug_ring: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
) {
    let mut src = Yuv420Buf::new(unreg_w, unreg_h);
    let raw_len = src.packed_len();
    let mut raw_buf = vec![0u8; raw_len];

    let mut regt = Yuv420Buf::new(base_w, base_h);
    let mut packed = vec![0u8; regt.packed_len()];

    while !stop.load(Ordering::SeqCst) {
        if !vis_in.get_frame(&mut raw_buf) {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }
        src.read_packed(&raw_buf);

        regt.y_plane_mut().fill(0);
        regt.fill_chroma_neutral();
        registration::warp(&src, &table, &mut regt);

        regt.write_packed(&mut packed);
        if regt_ring.put(&packed) < packed.len() {
            debug!("visible preprocess: compositor regt ring full, dropped frame");
        }
        if regt_debug_ring.put(&packed) < packed.len() {
            debug!("visible preprocess: regt debug ring full, dropped frame");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compositor_worker(
    width: usize,
    height: usize,
    ngls: usize,
    ssr: f32,
    bpr: f32,
    style: crate::config::FusionStyle,
    recon: Arc<BackgroundReconstructor>,
    gsci_ring: Arc<RingBuffer>,
    regt_ring: Arc<RingBuffer>,
    fused_ring: Arc<RingBuffer>,
    bright_ring: Arc<RingBuffer>,
    stop: Arc<AtomicBool>,
) {
    let gsci_frame_bytes = width * height;
    let mut gsci_buf = vec![0u8; gsci_frame_bytes];

    let mut regt = Yuv420Buf::new(width, height);
    let regt_packed_len = regt.packed_len();
    let mut regt_packed = vec![0u8; regt_packed_len];

    let mut bkg = PlaneBuf::new(width, height);
    let mut compositor = FusionCompositor::new(width, height, ngls);
    let mut fused = Yuv420Buf::new(width, height);
    let mut fused_packed = vec![0u8; regt_packed_len];
    let mut bright = PlaneBuf::new(width, height);

    while !stop.load(Ordering::SeqCst) {
        // Per-frame correspondence across rings is maintained only by
        // lockstep consumption (§5): only actually drain once every
        // upstream source for this iteration -- gsci, regt, and the
        // reconstructed background -- is ready.
        if gsci_ring.len() < gsci_frame_bytes || regt_ring.len() < regt_packed_len {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }
        if !recon.try_reconstruct(&mut bkg.as_plane_mut()) {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }

        if !gsci_ring.get_frame(&mut gsci_buf) {
            continue;
        }
        if !regt_ring.get_frame(&mut regt_packed) {
            continue;
        }
        regt.read_packed(&regt_packed);

        let gsci_plane = match Plane::new(&gsci_buf, width, height) {
            Ok(p) => p,
            Err(e) => {
                error!("fusion compositor: bad gsci frame: {}", e);
                continue;
            }
        };

        if let Err(e) = compositor.compose(
            &gsci_plane,
            &regt,
            &bkg.as_plane(),
            ssr,
            bpr,
            style,
            &mut fused,
            Some(&mut bright.as_plane_mut()),
        ) {
            error!("fusion compositor: compose failed: {}", e);
            continue;
        }

        fused.write_packed(&mut fused_packed);
        if fused_ring.put(&fused_packed) < fused_packed.len() {
            debug!("fusion compositor: fused ring full, dropped frame");
        }
        if bright_ring.put(bright.as_slice()) < bright.len() {
            debug!("fusion compositor: bright-feature ring full, dropped frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_identity_control_points(path: &Path, n: usize, w: i32, h: i32) {
        let mut f = std::fs::File::create(path).unwrap();
        let mut written = 0;
        for y in (0..h).step_by((h / 3).max(1) as usize) {
            for x in (0..w).step_by((w / 3).max(1) as usize) {
                if written >= n {
                    break;
                }
                writeln!(f, "{} {} {} {}", x, y, x, y).unwrap();
                written += 1;
            }
        }
    }

    #[test]
    fn rejects_bad_resolution() {
        let dir = std::env::temp_dir().join(format!("ir_fusion_pipeline_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join("control_points.txt");
        write_identity_control_points(&cp_path, 6, 32, 32);

        let mut options = Options::default();
        options.raw_reso = crate::config::Resolution::Custom(0, 0);
        let result = FusionPipeline::new(options, &cp_path, 64, 64, None);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_too_few_control_points() {
        let dir = std::env::temp_dir().join(format!("ir_fusion_pipeline_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join("control_points.txt");
        write_identity_control_points(&cp_path, 3, 32, 32);

        let options = Options::default();
        let result = FusionPipeline::new(options, &cp_path, 64, 64, None);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_zero_ngls() {
        let dir = std::env::temp_dir().join(format!("ir_fusion_pipeline_test4_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join("control_points.txt");
        write_identity_control_points(&cp_path, 6, 32, 32);

        let mut options = Options::default();
        options.ngls = 0;
        let result = FusionPipeline::new(options, &cp_path, 64, 64, None);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn end_to_end_frame_flows_through_to_fused_output() {
        let dir = std::env::temp_dir().join(format!("ir_fusion_pipeline_test3_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cp_path = dir.join("control_points.txt");
        // Identity registration over the small test geometry below.
        write_identity_control_points(&cp_path, 9, 32, 24);

        let mut options = Options::default();
        options.raw_reso = crate::config::Resolution::Custom(32, 24);
        options.quad.min_bw = 4;
        options.quad.min_bh = 4;
        options.quad.min_range = 10;
        options.mf_size = 5;

        let mut pipeline = FusionPipeline::new(options, &cp_path, 32, 24, None).unwrap();
        pipeline.start().unwrap();

        // Build one raw IR frame: 14-bit samples, two halves of the
        // image at different brightness so the quadtree actually splits.
        let (w, h) = (32usize, 24usize);
        let mut raw_ir = vec![0u8; 2 * w * h];
        for i in 0..(w * h) {
            let x = i % w;
            let v: u16 = if x < w / 2 { 2000 } else { 9000 };
            raw_ir[i * 2] = (v & 0xFF) as u8;
            raw_ir[i * 2 + 1] = ((v >> 8) & 0x7F) as u8;
        }
        assert!(pipeline.put_infrared(&raw_ir));

        let mut raw_vis = vec![0u8; pipeline.raw_visible_frame_len()];
        for b in raw_vis.iter_mut().take(w * h) {
            *b = 128;
        }
        assert!(pipeline.put_visible(&raw_vis));

        let mut fused = vec![0u8; pipeline.fused_frame_len()];
        let mut produced = false;
        for _ in 0..2000 {
            if pipeline.get_fused(&mut fused) {
                produced = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        pipeline.stop();
        let _ = std::fs::remove_dir_all(&dir);

        assert!(produced, "pipeline never produced a fused frame");
    }
}
