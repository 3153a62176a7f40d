// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{failed_precondition_error, internal_error,
                      CanonicalError};
use chrono::Utc;
use log::{info, warn};
use nalgebra::{Matrix3, Vector3};

use starcam_elements::camera_trait::AbstractCamera;
use starcam_elements::image_utils::unpack_mono12;
use starcam_elements::params::{BlobParams, SharedState};

use crate::detect_engine::DetectEngine;
use crate::lens_controller::LensController;

// An upper bound on focus tries guards against focusing forever if someone
// orders a pathologically wide, fine-stepped sweep.
const MAX_FOCUS_TRIES: u32 = 1600;

// Keep the sweep endpoints off the mechanical stops.
const FOCUS_STOP_GUARD: i32 = 25;

/// Which auto-focus search runs when a sweep is commanded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusAlgorithm {
    /// Per-frame SDK sharpness score at reduced resolution; preferred.
    /// photos_per_focus has no effect here (one score per step).
    ContrastDetect,

    /// Brightest-blob flux fitted with a quadratic; the older search.
    QuadraticRegression,
}

/// Orchestrates the auto-focus sweeps. The lens dialog and camera are shared
/// with the rest of the server; parameters come from (and results go back
/// to) the shared state block.
pub struct FocusEngine {
    camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
    lens: Arc<Mutex<LensController>>,
    state: Arc<Mutex<SharedState>>,
    taking_image: Arc<AtomicBool>,
    data_dir: PathBuf,
    focus_bin_factor: u32,
}

impl FocusEngine {
    pub fn new(camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
               lens: Arc<Mutex<LensController>>,
               state: Arc<Mutex<SharedState>>,
               taking_image: Arc<AtomicBool>,
               data_dir: PathBuf,
               focus_bin_factor: u32) -> Self {
        FocusEngine {
            camera, lens, state, taking_image, data_dir, focus_bin_factor,
        }
    }

    fn open_af_file(&self) -> Result<File, CanonicalError> {
        let path = self.data_dir.join(Utc::now().format(
            "auto_focus_starting_%Y-%m-%d_%H-%M-%S.txt").to_string());
        info!("Auto-focus data file: {:?}", path);
        File::create(&path).map_err(|e| failed_precondition_error(
            format!("Could not open auto-focus file {:?}: {:?}",
                    path, e).as_str()))
    }

    /// Clamps the sweep endpoints away from the mechanical stops and clears
    /// the begin request.
    fn clamp_sweep_range(&self) {
        let mut locked_state = self.state.lock().unwrap();
        let camera = &mut locked_state.camera;
        camera.begin_auto_focus = false;
        if camera.max_focus_pos - camera.end_focus_pos < FOCUS_STOP_GUARD {
            info!("Adjusting end focus position to {} below max",
                  FOCUS_STOP_GUARD);
            camera.end_focus_pos = camera.max_focus_pos - FOCUS_STOP_GUARD;
        }
        if camera.start_focus_pos - camera.min_focus_pos < FOCUS_STOP_GUARD {
            info!("Adjusting start focus position to {} above min",
                  FOCUS_STOP_GUARD);
            camera.start_focus_pos = camera.min_focus_pos + FOCUS_STOP_GUARD;
        }
    }

    /// Moves to the start of the sweep range. On failure falls back to the
    /// default focus position and aborts the sweep.
    fn seek_sweep_start(&self) -> Result<(), CanonicalError> {
        let mut locked_state = self.state.lock().unwrap();
        let mut lens = self.lens.lock().unwrap();
        if let Err(e) = lens.begin_auto_focus(&mut locked_state.camera) {
            warn!("Error starting auto-focus sweep: {:?}", e);
            let fallback = lens.default_focus_position(&mut locked_state.camera);
            locked_state.camera.focus_mode = false;
            fallback?;
            return Err(e);
        }
        Ok(())
    }

    fn finish(&self) {
        let mut locked_state = self.state.lock().unwrap();
        locked_state.camera.focus_mode = false;
        locked_state.cancelling_auto_focus = false;
    }

    async fn capture_frame(&self)
        -> Result<starcam_elements::camera_trait::CapturedImage,
                  CanonicalError> {
        let mut camera = self.camera.lock().await;
        self.taking_image.store(true, Ordering::Relaxed);
        let result = async {
            camera.trigger().await?;
            let timeout = camera.get_exposure_duration() * 3;
            camera.wait_for_frame(timeout).await
        }.await;
        self.taking_image.store(false, Ordering::Relaxed);
        result
    }

    /// Contrast-detect sweep: forward through the range at reduced
    /// resolution scoring each frame's SDK sharpness, one reversal at the
    /// far end, then return to the start (defeating backlash) and move to
    /// the best-scoring position.
    pub async fn run_contrast_detect(&self) -> Result<(), CanonicalError> {
        info!("Running contrast-detect auto-focus");
        self.clamp_sweep_range();

        let mut af_file = match self.open_af_file() {
            Ok(f) => f,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };

        if let Err(e) = self.seek_sweep_start() {
            self.finish();
            return Err(e);
        }
        let mut best_pos = self.state.lock().unwrap().camera.focus_position;
        let mut best_sharpness = 0.0_f64;

        // Reduced image for speed. Any exit from here on must restore the
        // binning factor; failing to restore leaves the camera unusable and
        // is fatal.
        if let Err(e) =
            self.camera.lock().await.set_binning(self.focus_bin_factor).await
        {
            self.finish();
            return Err(e);
        }

        let mut has_gone_forward = false;
        let mut has_gone_backward = false;
        let mut dir = 1;
        let mut remaining = MAX_FOCUS_TRIES;
        let mut sweep_error: Option<CanonicalError> = None;
        while remaining > 0 {
            remaining -= 1;
            let (position, start, end, step, focus_mode, cancelling) = {
                let locked_state = self.state.lock().unwrap();
                (locked_state.camera.focus_position,
                 locked_state.camera.start_focus_pos,
                 locked_state.camera.end_focus_pos,
                 locked_state.camera.focus_step,
                 locked_state.camera.focus_mode,
                 locked_state.cancelling_auto_focus)
            };
            if position >= end && has_gone_forward && !has_gone_backward {
                dir = -1;
                has_gone_backward = true;
            }
            if position < start && has_gone_backward {
                info!("Auto-focus sweep complete");
                break;
            }
            if !focus_mode {
                info!("Auto-focus cancelled");
                break;
            }

            if let Err(e) = self.capture_frame().await {
                sweep_error = Some(e);
                break;
            }
            let sharpness =
                match self.camera.lock().await.measure_sharpness().await {
                    Ok(s) => s,
                    Err(e) => {
                        sweep_error = Some(e);
                        break;
                    }
                };
            if sharpness >= best_sharpness {
                best_sharpness = sharpness;
                best_pos = position;
            }
            self.state.lock().unwrap().camera.flux = sharpness;
            let _ = writeln!(af_file, "{:.6}\t{:5}", sharpness, position);
            let _ = af_file.flush();

            if !cancelling {
                let mut locked_state = self.state.lock().unwrap();
                let mut lens = self.lens.lock().unwrap();
                if let Err(e) =
                    lens.shift_focus(step * dir, &mut locked_state.camera)
                {
                    drop(lens);
                    drop(locked_state);
                    sweep_error = Some(e);
                    break;
                }
            }
            has_gone_forward = true;
        }

        if self.camera.lock().await.set_binning(1).await.is_err() {
            self.finish();
            return Err(internal_error(
                "Failed to restore binning factor after auto-focus"));
        }
        if let Some(e) = sweep_error {
            self.finish();
            return Err(e);
        }
        info!("Auto-focus concluded with {} tries remaining; best score \
               {:.3} at {}", remaining, best_sharpness, best_pos);

        // Bounds-check the result, then approach it from the sweep start so
        // backlash doesn't shift the final position.
        {
            let locked_state = self.state.lock().unwrap();
            best_pos = best_pos.clamp(locked_state.camera.min_focus_pos,
                                      locked_state.camera.max_focus_pos);
        }
        if let Err(e) = self.seek_sweep_start() {
            self.finish();
            return Err(e);
        }
        {
            let mut locked_state = self.state.lock().unwrap();
            let mut lens = self.lens.lock().unwrap();
            let delta = best_pos - locked_state.camera.focus_position;
            lens.shift_focus(delta, &mut locked_state.camera)?;
        }
        self.finish();
        Ok(())
    }

    /// Legacy sweep: at each step, the brightest blob magnitude over
    /// photos_per_focus frames; afterward a quadratic is fitted to the
    /// bright half of the samples and the vertex (when concave) is the
    /// focus. Dynamic hot-pixel masking is suspended for the duration so
    /// defocused stars aren't masked away.
    pub async fn run_quadratic_regression(&self, detect: &mut DetectEngine,
                                          unpacked: &mut [u16])
                                          -> Result<(), CanonicalError> {
        info!("Running quadratic-regression auto-focus");
        self.clamp_sweep_range();
        let prev_dynamic_hp = {
            let mut locked_state = self.state.lock().unwrap();
            let prev = locked_state.blob.dynamic_hot_pixels;
            locked_state.blob.dynamic_hot_pixels = false;
            prev
        };

        let result = self.quadratic_sweep(detect, unpacked).await;

        self.state.lock().unwrap().blob.dynamic_hot_pixels = prev_dynamic_hp;
        self.finish();
        result
    }

    async fn quadratic_sweep(&self, detect: &mut DetectEngine,
                             unpacked: &mut [u16])
                             -> Result<(), CanonicalError> {
        let mut af_file = self.open_af_file()?;
        self.seek_sweep_start()?;

        let mut samples: Vec<(i32, i32)> = Vec::new();
        loop {
            let (position, end, step, photos, focus_mode, cancelling,
                 blob_params) = {
                let locked_state = self.state.lock().unwrap();
                (locked_state.camera.focus_position,
                 locked_state.camera.end_focus_pos,
                 locked_state.camera.focus_step,
                 locked_state.camera.photos_per_focus.max(1),
                 locked_state.camera.focus_mode,
                 locked_state.cancelling_auto_focus,
                 locked_state.blob.clone())
            };
            if !focus_mode || cancelling {
                info!("Auto-focus cancelled");
                return Ok(());
            }

            let max_flux = self.max_flux_over_photos(
                detect, unpacked, photos, &blob_params).await?;
            info!("Brightest blob at focus {} is {}", position, max_flux);
            self.state.lock().unwrap().camera.flux = max_flux as f64;
            let _ = writeln!(af_file, "{:3}\t{:5}", max_flux, position);
            let _ = af_file.flush();
            samples.push((position, max_flux));

            if position >= end {
                break;
            }
            // Don't overshoot the end of the range.
            let step = step.min(end - position);
            {
                let mut locked_state = self.state.lock().unwrap();
                let mut lens = self.lens.lock().unwrap();
                lens.shift_focus(step, &mut locked_state.camera)?;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let best = optimal_focus(&samples);
        match best {
            Some(best) => {
                let mut locked_state = self.state.lock().unwrap();
                let mut lens = self.lens.lock().unwrap();
                let best = best.clamp(locked_state.camera.min_focus_pos,
                                      locked_state.camera.max_focus_pos);
                info!("Optimal focus position: {}", best);
                let delta = best - locked_state.camera.focus_position;
                lens.shift_focus(delta, &mut locked_state.camera)?;
            }
            None => {
                warn!("Could not find focus of maximum flux; using default");
                let mut locked_state = self.state.lock().unwrap();
                let mut lens = self.lens.lock().unwrap();
                lens.default_focus_position(&mut locked_state.camera)?;
            }
        }
        Ok(())
    }

    async fn max_flux_over_photos(&self, detect: &mut DetectEngine,
                                  unpacked: &mut [u16], photos: i32,
                                  blob_params: &BlobParams)
                                  -> Result<i32, CanonicalError> {
        let mut max_flux = -1;
        for _ in 0..photos {
            let captured = self.capture_frame().await?;
            unpack_mono12(captured.image.as_raw(), unpacked);
            detect.detect(unpacked, blob_params, None)?;
            let brightest = detect.brightest_magnitude()
                .map(|mag| mag.min(i32::MAX as f64) as i32)
                .unwrap_or(-1);
            max_flux = max_flux.max(brightest);
        }
        Ok(max_flux)
    }
}

/// Least-squares quadratic a*x^2 + b*x + c over the samples whose flux is at
/// least (max+min)/2, via the normal equations. Returns (a, b, c).
fn quad_regression(samples: &[(i32, i32)]) -> Option<(f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let max_flux = samples.iter().map(|s| s.1).max().unwrap() as f64;
    let min_flux = samples.iter().map(|s| s.1).min().unwrap() as f64;
    let threshold = (max_flux + min_flux) / 2.0;

    let mut sumfocus = 0.0;
    let mut sumflux = 0.0;
    let mut sumfocus2 = 0.0;
    let mut sumfocus3 = 0.0;
    let mut sumfocus4 = 0.0;
    let mut sumfluxfocus = 0.0;
    let mut sumfocus2flux = 0.0;
    let mut num_elements = 0.0;
    for &(focus, flux) in samples {
        let flux = flux as f64;
        if flux < threshold {
            continue;
        }
        let f = focus as f64;
        sumfocus += f;
        sumflux += flux;
        sumfocus2 += f * f;
        sumfocus3 += f * f * f;
        sumfocus4 += f * f * f * f;
        sumfluxfocus += f * flux;
        sumfocus2flux += f * f * flux;
        num_elements += 1.0;
    }
    if num_elements < 3.0 {
        return None;
    }

    let normal = Matrix3::new(
        sumfocus4, sumfocus3, sumfocus2,
        sumfocus3, sumfocus2, sumfocus,
        sumfocus2, sumfocus, num_elements);
    let rhs = Vector3::new(sumfocus2flux, sumfluxfocus, sumflux);
    let solution = normal.lu().solve(&rhs)?;
    Some((solution[0], solution[1], solution[2]))
}

/// The vertex of the fitted quadratic, when it is a maximum.
fn optimal_focus(samples: &[(i32, i32)]) -> Option<i32> {
    let (a, b, _c) = quad_regression(samples)?;
    if 2.0 * a < 0.0 {
        Some((-b / (2.0 * a)).round() as i32)
    } else {
        None
    }
}

// mod tests.
