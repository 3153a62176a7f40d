// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use canonical_error::{failed_precondition_error, CanonicalError};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use starcam_elements::astro_util::{observed_from_icrs, parallactic_angle};
use starcam_elements::params::{AstroSettings, PointingSolution};
use starcam_elements::solver_trait::{
    SolveMatch, SolveOptions, SolveTicker, SolverField, SolverTrait};
use starcam_elements::value_stats::LatencyTracker;

use crate::config::ServerConfig;
use crate::fits_writer::FitsMetadata;

/// Per-day observing log: a '#'-commented metadata banner, a CSV header, and
/// one row per processing cycle. A cycle row is written in three parts
/// (time prefix, solution or zeros, camera time) as the cycle progresses.
pub struct ObservingLog {
    dir: PathBuf,
    current_path: Option<PathBuf>,
    file: Option<File>,
}

impl ObservingLog {
    pub fn new(dir: PathBuf) -> Self {
        ObservingLog { dir, current_path: None, file: None }
    }

    /// Opens (appending) the log for `now`'s date, writing the banner and
    /// CSV header if the file is new.
    pub fn ensure_open(&mut self, now: DateTime<Utc>, width: usize,
                       height: usize, metadata: &FitsMetadata)
                       -> Result<(), CanonicalError> {
        let path = self.dir.join(format!("data_{}.txt", now.format("%b-%d")));
        if self.current_path.as_ref() == Some(&path) && self.file.is_some() {
            return Ok(());
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true)
            .open(&path)
            .map_err(|e| failed_precondition_error(
                format!("Could not open observing log {:?}: {:?}",
                        path, e).as_str()))?;
        if is_new {
            Self::write_banner(&mut file, now, width, height, metadata)
                .map_err(|e| failed_precondition_error(
                    format!("Error writing observing log header: {:?}",
                            e).as_str()))?;
        }
        info!("Observing log is {:?}", path);
        self.current_path = Some(path);
        self.file = Some(file);
        Ok(())
    }

    fn write_banner(file: &mut File, now: DateTime<Utc>, width: usize,
                    height: usize, metadata: &FitsMetadata)
                    -> std::io::Result<()> {
        writeln!(file)?;
        writeln!(file,
                 "# ********************* {} Observing Session - beginning \
                  {} GMT *********************",
                 now.format("%B %d"), now.format("%H:%M:%S"))?;
        writeln!(file, "# Camera model: {}", metadata.detector)?;
        writeln!(file, "# ----------------------------------------------------")?;
        writeln!(file, "# Exposure: {} milliseconds",
                 metadata.exptime * 1000.0)?;
        writeln!(file, "# Pixel clock: {} MHz", metadata.pixelclk)?;
        writeln!(file, "# Frame rate achieved: {}", metadata.framerte)?;
        writeln!(file, "# Trigger delay (microseconds): {}",
                 metadata.trigdlay)?;
        writeln!(file, "# ----------------------------------------------------")?;
        writeln!(file, "# Sensor ID/type: {}", metadata.sensorid)?;
        writeln!(file, "# Sensor bit depth: {}", metadata.bitdepth)?;
        writeln!(file, "# Maximum image width and height: {}, {}",
                 width, height)?;
        writeln!(file, "# Pixel size (micrometers): {:.2}",
                 metadata.pixsize1)?;
        writeln!(file, "# Mono gain setting: {:.2}x base", metadata.gainfact)?;
        writeln!(file, "# Auto gain (should be disabled): {}",
                 metadata.autogain as i32)?;
        writeln!(file, "# Auto exposure (should be disabled): {}",
                 metadata.autoexp as i32)?;
        writeln!(file, "# Auto black level (should be disabled): {}",
                 metadata.autoblk as i32)?;
        writeln!(file, "# Black level offset: {}", metadata.bloffset)?;
        writeln!(file,
                 "C time,GMT,Blob #,RA (deg),DEC (deg),RA_OBS (deg),\
                  DEC_OBS (deg),FR (deg),PS,ALT (deg),AZ (deg),IR (deg),\
                  Astrom. solve time (msec),\
                  Solution Uncertainty (arcsec),Camera time (msec)")?;
        file.flush()
    }

    fn append(&mut self, text: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(text.as_bytes()) {
                warn!("Error writing observing log: {:?}", e);
            }
            let _ = file.flush();
        }
    }

    /// Starts a cycle row: epoch seconds and a GMT string.
    pub fn begin_cycle(&mut self, rawtime: f64, now: DateTime<Utc>) {
        self.append(&format!("{},{},", rawtime as i64,
                             now.format("%b %d %H:%M:%S")));
    }

    pub fn append_solution(&mut self, solution: &PointingSolution,
                           num_blobs_used: usize, solve_ms: f64) {
        self.append(&format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.15},{:.15},{:.6},\
             {:.6},{:.15}",
            num_blobs_used, solution.ra_j2000, solution.dec_j2000,
            solution.ra_observed, solution.dec_observed, solution.fr,
            solution.ps, solution.alt, solution.az, solution.ir, solve_ms,
            solution.sigma_as));
    }

    /// Zeros for every solution field, for ease of post-run analysis.
    pub fn append_no_solution(&mut self) {
        self.append("0,0,0,0,0,0,0,0,0,0,0,0");
    }

    /// Ends the cycle row with the camera round time.
    pub fn end_cycle(&mut self, camera_ms: f64) {
        self.append(&format!(",{:.6}\n", camera_ms));
    }

    pub fn current_path(&self) -> Option<&PathBuf> {
        self.current_path.as_ref()
    }
}

/// Stands in when no astrometry backend is wired into the build: every
/// attempt reports no match, so the pipeline logs zero rows and keeps
/// cycling. The real solver library lives behind SolverTrait and is supplied
/// by the binary.
pub struct UnconfiguredSolver {
    warned: bool,
}

impl UnconfiguredSolver {
    pub fn new() -> Self {
        UnconfiguredSolver { warned: false }
    }
}

impl Default for UnconfiguredSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SolverTrait for UnconfiguredSolver {
    fn solve_field(&mut self, _field: &SolverField,
                   _options: &SolveOptions,
                   _continuation: &mut dyn starcam_elements::solver_trait::SolveContinuation)
                   -> Result<Option<SolveMatch>, CanonicalError> {
        if !self.warned {
            warn!("No plate solver configured; all fields will go unsolved");
            self.warned = true;
        }
        Ok(None)
    }
}

/// Drives the plate solver for one field per cycle and converts its match
/// into the full pointing solution: observed alt/az and RA/Dec, image
/// rotation from the parallactic angle, and the pointing RMS from
/// matched-pair pixel residuals.
pub struct SolveEngine {
    solver: Box<dyn SolverTrait + Send>,
    ticker: SolveTicker,
    config: ServerConfig,
    pub log: ObservingLog,
    solve_latency: LatencyTracker,
}

/// Per-cycle inputs to the solve step.
pub struct SolveContext {
    pub astro: AstroSettings,

    // Exposure in effect for this frame, milliseconds.
    pub exposure_ms: f64,

    // Wall-clock seconds since the epoch at the start of the cycle.
    pub rawtime: f64,

    // Fractional epoch seconds at which the frame was captured.
    pub photo_time: f64,

    // Number of blobs the detector reported (before the solver's source
    // cap).
    pub num_blobs_found: usize,
}

impl SolveEngine {
    pub fn new(solver: Box<dyn SolverTrait + Send>, config: &ServerConfig,
               shutting_down: Arc<AtomicBool>) -> Self {
        SolveEngine {
            solver,
            ticker: SolveTicker::new(1, shutting_down),
            config: config.clone(),
            log: ObservingLog::new(config.data_dir.clone()),
            solve_latency: LatencyTracker::new(100),
        }
    }

    fn solve_options(&self, astro: &AstroSettings) -> SolveOptions {
        let active_w = self.config.active_width() as f64;
        let active_h = self.config.active_height() as f64;
        SolveOptions {
            funits_lower: self.config.min_pixel_scale,
            funits_upper: self.config.max_pixel_scale,
            max_sources: self.config.max_blobs,
            // Disallow tiny quads.
            quadsize_min: 0.1 * active_w.min(active_h),
            keep_logodds: astro.logodds.ln(),
            field_width: active_w,
            field_height: active_h,
            parity_both: true,
        }
    }

    /// Runs one solve attempt and appends the solution portion of the cycle
    /// row (zeros if no match). Returns the solution when one was found.
    pub fn solve_and_log(&mut self, field: &SolverField, context: &SolveContext)
                         -> Result<Option<PointingSolution>, CanonicalError> {
        // Reset the cooperative timeout for this attempt.
        self.ticker.reset(context.astro.timelimit as i32);
        let options = self.solve_options(&context.astro);
        let num_sources = field.len().min(options.max_sources);

        let solve_start = Instant::now();
        let result = self.solver.solve_field(field, &options, &mut self.ticker);
        let solve_elapsed = solve_start.elapsed();
        let solve_ms = solve_elapsed.as_secs_f64() * 1e3;
        self.solve_latency.record(solve_elapsed);
        if let Some(stats) = self.solve_latency.recent() {
            debug!("Solve latency: {:.1} ms (recent mean {:.1} ms)",
                   solve_ms, stats.mean * 1e3);
        }

        match result {
            Ok(Some(solve_match)) => {
                let solution = self.to_pointing_solution(
                    &solve_match, context)?;
                info!("Solved: RA {:.4} Dec {:.4} alt {:.4} az {:.4} \
                       RMS {:.2}\" in {:.1} ms",
                      solution.ra_j2000, solution.dec_j2000, solution.alt,
                      solution.az, solution.sigma_as, solve_ms);
                self.log.append_solution(&solution, num_sources, solve_ms);
                Ok(Some(solution))
            }
            Ok(None) => {
                info!("Could not solve field of {} sources in {:.1} ms",
                      num_sources, solve_ms);
                self.log.append_no_solution();
                Ok(None)
            }
            Err(e) => {
                // The attempt failed outright (not merely no-match); log the
                // zero row so the CSV stays rectangular, then surface it.
                self.log.append_no_solution();
                Err(e)
            }
        }
    }

    fn to_pointing_solution(&self, solve_match: &SolveMatch,
                            context: &SolveContext)
                            -> Result<PointingSolution, CanonicalError> {
        let astro = &context.astro;
        let ra = solve_match.ra_deg;
        let dec = solve_match.dec_deg;
        let fr = solve_match.field_rotation;
        let ps = solve_match.pixel_scale;

        // Mid-exposure epoch: cycle start plus half the exposure.
        let mid_exposure = SystemTime::UNIX_EPOCH
            + Duration::from_secs_f64(
                context.rawtime + context.exposure_ms / 2000.0);
        let lat = astro.latitude.to_radians();
        let observed = observed_from_icrs(
            ra.to_radians(), dec.to_radians(), lat,
            astro.longitude.to_radians(), mid_exposure, self.config.dut1);

        // Parallactic angle less the field rotation gives the rotation of
        // the image axes relative to the horizon.
        let ir = parallactic_angle(
            observed.hour_angle, observed.dec_observed, lat).to_degrees() - fr;

        // RMS pixel residual between detected centroids and reprojected
        // reference stars, over the valid correspondences.
        let mut sum_sq_diffs = 0.0;
        let mut counter = 0;
        for m in &solve_match.matches {
            if let Some((rx, ry)) = m.ref_pixel {
                sum_sq_diffs += (m.field_x - rx) * (m.field_x - rx)
                    + (m.field_y - ry) * (m.field_y - ry);
                counter += 1;
            }
        }
        let sigma_as = if counter > 0 {
            (sum_sq_diffs / counter as f64).sqrt() * ps
        } else {
            warn!("Solution has no valid star correspondences");
            0.0
        };
        debug!("Pointing RMS {:.3} arcsec over {} matches",
               sigma_as, counter);

        Ok(PointingSolution {
            ra_j2000: ra,
            dec_j2000: dec,
            ra_observed: observed.ra_observed.to_degrees(),
            dec_observed: observed.dec_observed.to_degrees(),
            rawtime: context.rawtime,
            sigma_as,
            fr,
            ps,
            ir,
            alt: observed.alt.to_degrees(),
            az: observed.az.to_degrees(),
            photo_time: context.photo_time,
            num_blobs_found: context.num_blobs_found as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use starcam_elements::solver_trait::{MatchedSource, SolveContinuation};
    use tempfile::tempdir;
    use super::*;

    /// Scripted solver: returns a canned result, recording the options it
    /// was called with.
    struct FakeSolver {
        result: Option<SolveMatch>,
        last_options: Option<SolveOptions>,
        ticks_consumed: i32,
    }

    impl SolverTrait for FakeSolver {
        fn solve_field(&mut self, _field: &SolverField,
                       options: &SolveOptions,
                       continuation: &mut dyn SolveContinuation)
                       -> Result<Option<SolveMatch>, CanonicalError> {
            self.last_options = Some(options.clone());
            self.ticks_consumed = 0;
            while continuation.should_continue() {
                self.ticks_consumed += 1;
                if self.result.is_some() {
                    break;
                }
            }
            Ok(self.result.clone())
        }
    }

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn test_context() -> SolveContext {
        SolveContext {
            astro: AstroSettings::default(),
            exposure_ms: 100.0,
            rawtime: 1_700_000_000.0,
            photo_time: 1_700_000_000.25,
            num_blobs_found: 20,
        }
    }

    fn read_log(engine: &SolveEngine) -> String {
        std::fs::read_to_string(engine.log.current_path().unwrap()).unwrap()
    }

    #[test]
    fn test_no_solve_appends_twelve_zero_fields() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let solver = Box::new(FakeSolver {
            result: None, last_options: None, ticks_consumed: 0 });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut engine = SolveEngine::new(solver, &config, shutdown);

        let now = Utc::now();
        let context = test_context();
        engine.log.ensure_open(now, config.width, config.height,
                               &FitsMetadata::default()).unwrap();
        engine.log.begin_cycle(context.rawtime, now);
        let result = engine.solve_and_log(
            &SolverField::default(), &context).unwrap();
        assert!(result.is_none());
        engine.log.end_cycle(1234.5);

        let contents = read_log(&engine);
        let row = contents.lines().last().unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        // time, GMT, 12 zero solution fields, camera time.
        assert_eq!(fields.len(), 15);
        for field in &fields[2..14] {
            assert_eq!(*field, "0");
        }
        assert_ne!(fields[14], "0");
    }

    #[test]
    fn test_solution_fields_and_pointing_rms() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let solve_match = SolveMatch {
            ra_deg: 120.0,
            dec_deg: 45.0,
            pixel_scale: 6.5,
            field_rotation: 10.0,
            matches: vec![
                MatchedSource {
                    field_x: 10.0, field_y: 10.0,
                    ref_pixel: Some((11.0, 10.0)),
                },
                MatchedSource {
                    field_x: 20.0, field_y: 20.0,
                    ref_pixel: Some((20.0, 22.0)),
                },
                // Unmatched; excluded from the RMS.
                MatchedSource {
                    field_x: 30.0, field_y: 30.0, ref_pixel: None,
                },
            ],
        };
        let solver = Box::new(FakeSolver {
            result: Some(solve_match), last_options: None, ticks_consumed: 0 });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut engine = SolveEngine::new(solver, &config, shutdown);

        let now = Utc::now();
        let context = test_context();
        engine.log.ensure_open(now, config.width, config.height,
                               &FitsMetadata::default()).unwrap();
        engine.log.begin_cycle(context.rawtime, now);
        let solution = engine.solve_and_log(
            &SolverField::default(), &context).unwrap().unwrap();
        engine.log.end_cycle(1000.0);

        assert_eq!(solution.ra_j2000, 120.0);
        assert_eq!(solution.dec_j2000, 45.0);
        // Refraction-free observed place keeps the catalog direction.
        assert_abs_diff_eq!(solution.ra_observed, 120.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.dec_observed, 45.0, epsilon = 1e-9);
        // RMS of residuals 1 px and 2 px over two valid matches, scaled by
        // the 6.5 arcsec/px plate scale.
        assert_abs_diff_eq!(solution.sigma_as, (2.5_f64).sqrt() * 6.5,
                            epsilon = 1e-9);
        assert!(solution.alt >= -90.0 && solution.alt <= 90.0);
        assert!(solution.az >= 0.0 && solution.az < 360.0);
        assert_eq!(solution.num_blobs_found, 20);

        // The logged row carries the solution, not zeros.
        let contents = read_log(&engine);
        let row = contents.lines().last().unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 15);
        assert_eq!(fields[2], "0");  // num sources capped from empty field
        assert_eq!(fields[3], "120.000000");
    }

    #[test]
    fn test_solver_options_derived_from_config() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let solver = Box::new(FakeSolver {
            result: None, last_options: None, ticks_consumed: 0 });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut engine = SolveEngine::new(solver, &config, shutdown);

        let now = Utc::now();
        let context = test_context();
        engine.log.ensure_open(now, config.width, config.height,
                               &FitsMetadata::default()).unwrap();
        engine.log.begin_cycle(context.rawtime, now);
        engine.solve_and_log(&SolverField::default(), &context).unwrap();
        engine.log.end_cycle(0.0);

        let options = engine.solver_options_for_test();
        assert_eq!(options.funits_lower, 6.0);
        assert_eq!(options.funits_upper, 7.0);
        assert_eq!(options.max_sources, 300);
        // 0.1 * min(1936, 1216).
        assert_abs_diff_eq!(options.quadsize_min, 121.6, epsilon = 1e-9);
        assert_abs_diff_eq!(options.keep_logodds, (1e8_f64).ln(),
                            epsilon = 1e-12);
        assert!(options.parity_both);
    }

    impl SolveEngine {
        fn solver_options_for_test(&self) -> SolveOptions {
            self.solve_options(&AstroSettings::default())
        }
    }
}  // mod tests.
