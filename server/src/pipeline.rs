// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The single processing thread: each cycle acquires a frame, unpacks it,
//! finds and refines star candidates, publishes the display copy,
//! plate-solves, and writes the FITS image and blob table. The shared phase
//! indicator advances at each stage boundary; telemetry reads it. Commands
//! take effect at the next cycle via the per-cycle parameter snapshot.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use canonical_error::{failed_precondition_error, CanonicalError,
                      CanonicalErrorCode};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use starcam_elements::camera_trait::AbstractCamera;
use starcam_elements::image_utils::unpack_mono12;
use starcam_elements::params::{PhaseCell, SharedState, SolvePhase};
use starcam_elements::solver_trait::SolverTrait;
use starcam_elements::value_stats::LatencyTracker;

use crate::config::ServerConfig;
use crate::detect_engine::{Blob, DetectEngine};
use crate::fits_writer::{self, FitsMetadata};
use crate::focus_engine::{FocusAlgorithm, FocusEngine};
use crate::lens_controller::LensController;
use crate::solve_engine::{SolveContext, SolveEngine};
use crate::telemetry_sender::SolutionUpdate;

pub struct Pipeline {
    config: ServerConfig,
    algorithm: FocusAlgorithm,

    state: Arc<Mutex<SharedState>>,
    phase: Arc<PhaseCell>,
    camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,

    detect: DetectEngine,
    solve: SolveEngine,
    focus: FocusEngine,

    // The published copy of the most recent unpacked frame (write then
    // publish; telemetry copies out under the lock).
    display: Arc<Mutex<Vec<u16>>>,

    taking_image: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    solution_tx: watch::Sender<SolutionUpdate>,

    metadata: FitsMetadata,
    unpacked: Vec<u16>,
    display_scratch: Vec<u16>,
    cycle_latency: LatencyTracker,
    cycle_counter: u64,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(config: ServerConfig,
               algorithm: FocusAlgorithm,
               solver: Box<dyn SolverTrait + Send>,
               camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
               lens: Arc<Mutex<LensController>>,
               state: Arc<Mutex<SharedState>>,
               phase: Arc<PhaseCell>,
               display: Arc<Mutex<Vec<u16>>>,
               taking_image: Arc<AtomicBool>,
               shutting_down: Arc<AtomicBool>,
               solution_tx: watch::Sender<SolutionUpdate>)
               -> Result<Self, CanonicalError> {
        phase.set(SolvePhase::Init);
        std::fs::create_dir_all(config.data_dir.join("img")).map_err(
            |e| failed_precondition_error(
                format!("Could not create image directory under {:?}: {:?}",
                        config.data_dir, e).as_str()))?;
        let detect = DetectEngine::new(
            config.width, config.height, config.saturation_value,
            config.min_blobs, config.max_blobs, &config.static_hp_path,
            phase.clone())?;
        let solve = SolveEngine::new(solver, &config, shutting_down.clone());
        let focus = FocusEngine::new(
            camera.clone(), lens, state.clone(), taking_image.clone(),
            config.data_dir.clone(), config.focus_bin_factor);
        let num_pixels = config.num_pixels();
        Ok(Pipeline {
            config,
            algorithm,
            state,
            phase,
            camera,
            detect,
            solve,
            focus,
            display,
            taking_image,
            shutting_down,
            solution_tx,
            metadata: FitsMetadata::default(),
            unpacked: vec![0; num_pixels],
            display_scratch: vec![0; num_pixels],
            cycle_latency: LatencyTracker::new(100),
            cycle_counter: 0,
        })
    }

    /// Starts the processing loop on a dedicated thread. The loop does long
    /// stretches of non-async compute (filtering, blob finding, the solver),
    /// well beyond what should run on a shared async runtime, so it gets its
    /// own.
    pub fn spawn(self) -> std::thread::JoinHandle<Result<(), CanonicalError>> {
        std::thread::Builder::new().name("pipeline".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .thread_name("pipeline_rt")
                    .build().unwrap();
                runtime.block_on(self.run())
            }).unwrap()
    }

    async fn run(mut self) -> Result<(), CanonicalError> {
        info!("Starting pipeline");
        self.dump_camera_parameters("camera_params_startup.ini").await;
        while !self.shutting_down.load(Ordering::Relaxed) {
            match self.one_cycle().await {
                Ok(()) => (),
                Err(e) if matches!(e.code, CanonicalErrorCode::Internal) => {
                    error!("Fatal pipeline error: {:?}", e);
                    return Err(e);
                }
                Err(e) => {
                    // Transient: skip this cycle and keep going.
                    warn!("Pipeline cycle failed: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        self.dump_camera_parameters("camera_params_shutdown.ini").await;
        info!("Pipeline exiting");
        Ok(())
    }

    async fn dump_camera_parameters(&self, filename: &str) {
        let path = self.config.data_dir.join(filename);
        if let Err(e) = self.camera.lock().await.save_parameters(&path).await {
            warn!("Could not dump camera parameters: {:?}", e);
        }
    }

    /// One acquisition -> solve cycle.
    pub async fn one_cycle(&mut self) -> Result<(), CanonicalError> {
        let cycle_start = Instant::now();
        let now_system = SystemTime::now();
        let now_utc: DateTime<Utc> = now_system.into();
        let rawtime = now_system.duration_since(UNIX_EPOCH)
            .unwrap_or_default().as_secs_f64();

        let mut snapshot = self.state.lock().unwrap().clone();
        self.solve.log.ensure_open(now_utc, self.config.width,
                                   self.config.height, &self.metadata)?;

        // Auto-focus, when freshly commanded.
        if snapshot.camera.focus_mode && snapshot.camera.begin_auto_focus {
            self.phase.set(SolvePhase::Autofocus);
            match self.algorithm {
                FocusAlgorithm::ContrastDetect => {
                    self.focus.run_contrast_detect().await?;
                }
                FocusAlgorithm::QuadraticRegression => {
                    self.focus.run_quadratic_regression(
                        &mut self.detect, &mut self.unpacked).await?;
                }
            }
            // The sweep moved the lens and cleared the mode flags.
            snapshot = self.state.lock().unwrap().clone();
        }

        // Refresh the SDK-internal hot pixel list when a new static map was
        // requested or dynamic masking is active.
        if snapshot.blob.make_static_hp_mask != 0 ||
            snapshot.blob.dynamic_hot_pixels
        {
            if let Err(e) = self.camera.lock().await.renew_hot_pixels().await {
                warn!("Could not re-make camera hot pixel list: {:?}", e);
            }
        }

        // Acquire.
        self.phase.set(SolvePhase::ImageCap);
        if snapshot.trigger.trigger_mode {
            let sleep_step = Duration::from_micros(
                snapshot.trigger.trigger_timeout_us.max(1) as u64);
            loop {
                if self.shutting_down.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let fired = {
                    let mut locked_state = self.state.lock().unwrap();
                    if locked_state.trigger.triggered {
                        locked_state.trigger.triggered = false;
                        true
                    } else {
                        false
                    }
                };
                if fired {
                    break;
                }
                tokio::time::sleep(sleep_step).await;
            }
        }
        self.taking_image.store(true, Ordering::Relaxed);
        let capture_result = {
            let mut camera = self.camera.lock().await;
            let result = camera.trigger().await;
            match result {
                Ok(()) => {
                    let timeout = camera.get_exposure_duration() * 3;
                    camera.wait_for_frame(timeout).await
                }
                Err(e) => Err(e),
            }
        };
        self.taking_image.store(false, Ordering::Relaxed);
        let captured = capture_result?;
        let photo_time = SystemTime::now().duration_since(UNIX_EPOCH)
            .unwrap_or_default().as_secs_f64();

        // Transfer and unpack.
        self.phase.set(SolvePhase::ImageXfer);
        if captured.image.as_raw().len() != self.config.num_pixels() {
            return Err(failed_precondition_error(
                format!("Incomplete frame: {} of {} pixels",
                        captured.image.as_raw().len(),
                        self.config.num_pixels()).as_str()));
        }
        unpack_mono12(captured.image.as_raw(), &mut self.unpacked);

        // Find and refine star candidates.
        let num_blobs = self.detect.detect(
            &self.unpacked, &snapshot.blob,
            Some(&mut self.display_scratch))?;
        if snapshot.blob.make_static_hp_mask != 0 {
            // The static map was (re)stamped from this frame; one-shot.
            self.state.lock().unwrap().blob.make_static_hp_mask = 0;
        }
        self.detect.refine_centroids(&self.unpacked);

        // Publish the display frame.
        {
            let mut display = self.display.lock().unwrap();
            display.resize(self.display_scratch.len(), 0);
            display.copy_from_slice(&self.display_scratch);
        }
        let camera_timer = Instant::now();

        // Plate-solve, unless a sweep re-entered focus mode meanwhile.
        let focus_mode = self.state.lock().unwrap().camera.focus_mode;
        if !focus_mode {
            self.phase.set(SolvePhase::Astrometry);
            self.solve.log.begin_cycle(rawtime, now_utc);
            let context = SolveContext {
                astro: snapshot.astro.clone(),
                exposure_ms: snapshot.camera.exposure_time,
                rawtime,
                photo_time,
                num_blobs_found: num_blobs,
            };
            let field = self.detect.solver_field();
            match self.solve.solve_and_log(&field, &context) {
                Ok(Some(solution)) => {
                    self.state.lock().unwrap().solution = solution.clone();
                    self.cycle_counter += 1;
                    // Wakes the per-peer astrometry senders.
                    let _ = self.solution_tx.send(
                        (self.cycle_counter, solution));
                }
                Ok(None) => (),
                Err(e) => warn!("Solver error: {:?}", e),
            }
            let camera_ms = camera_timer.elapsed().as_secs_f64() * 1e3;
            self.solve.log.end_cycle(camera_ms);
        }

        self.write_fits(&captured.capture_params.exposure_duration,
                        photo_time, now_utc);
        self.write_blob_table();

        self.cycle_latency.record(cycle_start.elapsed());
        if let Some(stats) = self.cycle_latency.recent() {
            debug!("Cycle complete in {:.3} s (recent mean {:.3} s)",
                   cycle_start.elapsed().as_secs_f64(), stats.mean);
        }
        Ok(())
    }

    fn write_fits(&mut self, exposure: &Duration, photo_time: f64,
                  now_utc: DateTime<Utc>) {
        let filename = now_utc.format(
            "saved_image_%Y-%m-%d_%H-%M-%S.fits").to_string();
        let path = self.config.data_dir.join("img").join(&filename);
        {
            let locked_state = self.state.lock().unwrap();
            self.metadata.focus = locked_state.camera.focus_position as i16;
            self.metadata.aperture =
                locked_state.camera.current_aperture as i16;
            self.metadata.gainfact = locked_state.camera.gain_fact as f32;
        }
        self.metadata.filename = filename;
        self.metadata.date =
            now_utc.format("%Y-%m-%dT%H:%M:%S").to_string();
        self.metadata.utcsec = photo_time as u64;
        self.metadata.utcusec = (photo_time.fract() * 1e6) as u64;
        self.metadata.exptime = exposure.as_secs_f32();
        if let Err(e) = fits_writer::write_image(
            &path, &self.unpacked, self.config.width, self.config.height,
            &self.metadata)
        {
            warn!("Error writing FITS image {:?}: {:?}", path, e);
        }
    }

    /// Diagnostic blob table for display tooling; rewritten every cycle.
    fn write_blob_table(&self) {
        let path = self.config.data_dir.join("blob_table.txt");
        if let Err(e) = write_blob_table_file(&path, self.detect.blobs()) {
            warn!("Error writing blob table {:?}: {:?}", path, e);
        }
    }
}

fn write_blob_table_file(path: &Path, blobs: &[Blob]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for blob in blobs {
        writeln!(file, "{:.6},{:.6},{:.6}", blob.mag, blob.x, blob.y)?;
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use starcam_elements::image_utils::Gray16Image;
    use starcam_elements::solver_trait::{
        SolveContinuation, SolveMatch, SolveOptions, SolverField};
    use tempfile::tempdir;

    use crate::image_camera::ImageCamera;
    use crate::lens_controller::SimulatedLensTransport;
    use crate::telemetry_sender::solution_channel;
    use super::*;

    struct NeverSolver;

    impl SolverTrait for NeverSolver {
        fn solve_field(&mut self, _field: &SolverField,
                       _options: &SolveOptions,
                       _continuation: &mut dyn SolveContinuation)
                       -> Result<Option<SolveMatch>, CanonicalError> {
            Ok(None)
        }
    }

    // Five modest stars, far enough apart that the de-dup spacing (and its
    // 4x widening for very bright blobs) leaves them all distinct.
    fn star_field(width: u32, height: u32) -> Gray16Image {
        let mut frame = Gray16Image::new(width, height);
        for &(x, y, peak) in &[(10_u32, 10_u32, 1100_u16), (30, 10, 1000),
                               (50, 10, 900), (10, 30, 800), (30, 30, 700)] {
            frame.put_pixel(x, y, image::Luma([peak]));
            frame.put_pixel(x - 1, y, image::Luma([peak / 4]));
            frame.put_pixel(x + 1, y, image::Luma([peak / 4]));
            frame.put_pixel(x, y - 1, image::Luma([peak / 4]));
            frame.put_pixel(x, y + 1, image::Luma([peak / 4]));
        }
        frame
    }

    #[tokio::test]
    async fn test_one_cycle_end_to_end_with_no_solve() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            width: 64,
            height: 48,
            static_hp_path: dir.path().join("static_hp_mask.txt"),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(ImageCamera::new(
                "test", star_field(64, 48)))));
        let lens = Arc::new(Mutex::new(LensController::new(
            Box::new(SimulatedLensTransport::new()))));
        let mut initial_state = SharedState::default();
        // No sweep on startup; plain observing cycles.
        initial_state.camera.focus_mode = false;
        initial_state.camera.begin_auto_focus = false;
        initial_state.blob.dynamic_hot_pixels = false;
        initial_state.blob.high_pass_filter = false;
        initial_state.blob.use_static_hp_mask = false;
        initial_state.blob.n_sigma = 5.0;
        let state = Arc::new(Mutex::new(initial_state));
        let phase = Arc::new(PhaseCell::new());
        let display = Arc::new(Mutex::new(Vec::new()));
        let (solution_tx, solution_rx) = solution_channel();

        let mut pipeline = Pipeline::new(
            config.clone(), FocusAlgorithm::ContrastDetect,
            Box::new(NeverSolver), camera, lens, state.clone(), phase.clone(),
            display.clone(), Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)), solution_tx).unwrap();

        pipeline.one_cycle().await.unwrap();

        // The cycle ended in the astrometry stage.
        assert_eq!(phase.get(), SolvePhase::Astrometry);

        // Display buffer published with the raw frame.
        {
            let display = display.lock().unwrap();
            assert_eq!(display.len(), 64 * 48);
            assert_eq!(display[10 + 10 * 64], 1100);
        }

        // No solution was published.
        assert_eq!(solution_rx.borrow().0, 0);

        // Observing log holds a header plus a zero row ending in the camera
        // time.
        let log_path = pipeline.solve.log.current_path().unwrap().clone();
        let contents = std::fs::read_to_string(log_path).unwrap();
        let row = contents.lines().last().unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 15);
        for field in &fields[2..14] {
            assert_eq!(*field, "0");
        }

        // Blob table written with the detected stars, brightest first.
        let table = std::fs::read_to_string(
            dir.path().join("blob_table.txt")).unwrap();
        assert!(table.lines().count() >= 4);
        let first_mag: f64 = table.lines().next().unwrap()
            .split(',').next().unwrap().parse().unwrap();
        assert!(first_mag > 0.0);

        // A FITS image landed under img/.
        let images: Vec<_> = std::fs::read_dir(dir.path().join("img"))
            .unwrap().collect();
        assert_eq!(images.len(), 1);
    }
}  // mod tests.
