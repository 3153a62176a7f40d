// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicU8, Ordering};

/// Blob-finding parameters. Single writer (the command decoder); the pipeline
/// snapshots the whole block once per processing cycle.
#[derive(Clone, Debug)]
pub struct BlobParams {
    // Pixels whose neighbour-relative level exceeds this are dynamic hot
    // pixel candidates.
    pub spike_limit: i32,

    // Recompute the hot pixel mask from the current frame's neighbour
    // comparison.
    pub dynamic_hot_pixels: bool,

    // Boxcar smoothing radius, pixels.
    pub r_smooth: i32,

    // Subtract a large-radius boxcar from the smoothed image.
    pub high_pass_filter: bool,
    pub r_high_pass_filter: i32,

    // Pixel distance from the image edge at which the star search begins.
    pub centroid_search_border: i32,

    // Publish the filtered image (rather than the raw frame) to the display
    // buffer.
    pub filter_return_image: bool,

    // Pixels brighter than mean + n_sigma * sigma are blob candidates.
    pub n_sigma: f32,

    // Minimum pixel spacing between reported blobs.
    pub unique_star_spacing: i32,

    // When positive, scan the next raw frame and rewrite the static hot
    // pixel file with every pixel above this raw threshold, then clear.
    pub make_static_hp_mask: i32,

    // Apply the static hot pixel file to the mask.
    pub use_static_hp_mask: bool,
}

impl Default for BlobParams {
    fn default() -> Self {
        BlobParams {
            spike_limit: 3,
            dynamic_hot_pixels: true,
            r_smooth: 1,
            high_pass_filter: true,
            r_high_pass_filter: 10,
            centroid_search_border: 1,
            filter_return_image: false,
            n_sigma: 10.0,
            unique_star_spacing: 15,
            make_static_hp_mask: 0,
            use_static_hp_mask: true,
        }
    }
}

/// Camera and lens parameters, including the auto-focus sweep settings.
/// Exposure and gain changes are latched with the `change_*` booleans and
/// applied by the hardware-adjust step between captures.
#[derive(Clone, Debug)]
pub struct CameraParams {
    // Previous focus position, for computing the delta to a commanded
    // absolute position.
    pub prev_focus_pos: i32,
    pub focus_position: i32,
    pub focus_inf: bool,
    pub aperture_steps: i32,
    pub max_aperture: bool,
    pub min_focus_pos: i32,
    pub max_focus_pos: i32,
    pub current_aperture: i32,

    // Milliseconds.
    pub exposure_time: f64,
    pub change_exposure: bool,

    // Multiple of base analog gain.
    pub gain_fact: f64,
    pub change_gain: bool,

    pub begin_auto_focus: bool,
    pub focus_mode: bool,
    pub start_focus_pos: i32,
    pub end_focus_pos: i32,
    pub focus_step: i32,

    // Frames per focus position for the legacy sweep. The contrast-detect
    // sweep records one sharpness score per step and ignores this.
    pub photos_per_focus: i32,

    // Most recent auto-focus figure of merit (sharpness score or brightest
    // blob magnitude, depending on algorithm).
    pub flux: f64,
}

impl Default for CameraParams {
    fn default() -> Self {
        CameraParams {
            prev_focus_pos: 0,
            focus_position: 0,
            focus_inf: false,
            aperture_steps: 0,
            max_aperture: false,
            min_focus_pos: 0,
            max_focus_pos: 0,
            current_aperture: 0,
            exposure_time: 100.0,
            change_exposure: false,
            gain_fact: 1.0,
            change_gain: false,
            begin_auto_focus: true,
            focus_mode: false,
            start_focus_pos: 0,
            end_focus_pos: 0,
            focus_step: 5,
            photos_per_focus: 3,
            flux: 0.0,
        }
    }
}

/// Image triggering parameters.
#[derive(Clone, Debug)]
pub struct TriggerParams {
    // false: free-running software trigger. true: wait for a trigger packet
    // from a flight computer.
    pub trigger_mode: bool,

    // Set by the trigger-packet listener; consumed by the pipeline.
    pub triggered: bool,

    // Sleep granularity while awaiting a trigger, microseconds.
    pub trigger_timeout_us: i32,
}

impl Default for TriggerParams {
    fn default() -> Self {
        TriggerParams {
            trigger_mode: false,
            triggered: false,
            trigger_timeout_us: 100,
        }
    }
}

/// Astrometry settings commanded by the flight computers.
#[derive(Clone, Debug)]
pub struct AstroSettings {
    // Solver time limit, seconds (whole ticks of the solver's callback
    // clock).
    pub timelimit: f64,

    // Odds ratio the solver must reach to accept a match. Passed to the
    // solver as its natural log.
    pub logodds: f64,

    // Site coordinates.
    pub latitude: f64,  // degrees
    pub longitude: f64, // degrees, east positive
    pub hm: f64,        // height above WGS84, meters
}

impl Default for AstroSettings {
    fn default() -> Self {
        AstroSettings {
            timelimit: 1.0,
            logodds: 1e8,
            latitude: 32.233315,
            longitude: -110.948556,
            hm: 753.8,
        }
    }
}

/// The most recent pointing solution, as sent in astrometry telemetry and
/// logged to the observing CSV. All angles in degrees.
#[derive(Clone, Debug, Default)]
pub struct PointingSolution {
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    pub ra_observed: f64,
    pub dec_observed: f64,

    // Wall-clock seconds since the UNIX epoch at the start of the cycle.
    pub rawtime: f64,

    // Pointing RMS, arcseconds.
    pub sigma_as: f64,

    // Field rotation (deg), pixel scale (arcsec/px), image rotation (deg).
    pub fr: f64,
    pub ps: f64,
    pub ir: f64,

    pub alt: f64,
    pub az: f64,

    // Fractional seconds since the UNIX epoch at which the photo was taken.
    pub photo_time: f64,

    pub num_blobs_found: u32,
}

/// State shared between the pipeline thread, the command decoders, and the
/// telemetry senders. Always lock, mutate or snapshot, and release; the
/// pipeline takes one snapshot per cycle so a command's effect lands at the
/// next cycle boundary.
#[derive(Clone, Debug, Default)]
pub struct SharedState {
    pub camera: CameraParams,
    pub blob: BlobParams,
    pub trigger: TriggerParams,
    pub astro: AstroSettings,
    pub solution: PointingSolution,

    // Set when focus_mode is cleared mid-sweep; the sweep observes it at its
    // next iteration.
    pub cancelling_auto_focus: bool,
}

/// Pipeline stage indicator, advanced by the pipeline thread at each stage
/// boundary and read by telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SolvePhase {
    Uninit = 0,
    Init = 1,
    ImageCap = 2,
    ImageXfer = 3,
    HotpixMask = 4,
    Filtering = 5,
    Autofocus = 6,
    BlobFind = 7,
    Astrometry = 8,
}

impl SolvePhase {
    fn from_u8(value: u8) -> SolvePhase {
        match value {
            1 => SolvePhase::Init,
            2 => SolvePhase::ImageCap,
            3 => SolvePhase::ImageXfer,
            4 => SolvePhase::HotpixMask,
            5 => SolvePhase::Filtering,
            6 => SolvePhase::Autofocus,
            7 => SolvePhase::BlobFind,
            8 => SolvePhase::Astrometry,
            _ => SolvePhase::Uninit,
        }
    }
}

/// Lock-free cell for the pipeline stage. Strictly advanced by the pipeline
/// thread; any thread may read.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        PhaseCell(AtomicU8::new(SolvePhase::Uninit as u8))
    }

    pub fn set(&self, phase: SolvePhase) {
        self.0.store(phase as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> SolvePhase {
        SolvePhase::from_u8(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_cell_round_trip() {
        let cell = PhaseCell::new();
        assert_eq!(cell.get(), SolvePhase::Uninit);
        cell.set(SolvePhase::Astrometry);
        assert_eq!(cell.get(), SolvePhase::Astrometry);
        cell.set(SolvePhase::ImageCap);
        assert_eq!(cell.get(), SolvePhase::ImageCap);
    }

    #[test]
    fn test_defaults_match_flight_configuration() {
        let blob = BlobParams::default();
        assert_eq!(blob.spike_limit, 3);
        assert_eq!(blob.r_smooth, 1);
        assert_eq!(blob.r_high_pass_filter, 10);
        assert_eq!(blob.unique_star_spacing, 15);
        assert!(blob.use_static_hp_mask);

        let camera = CameraParams::default();
        assert_eq!(camera.exposure_time, 100.0);
        assert_eq!(camera.focus_step, 5);
        assert!(camera.begin_auto_focus);
        assert!(!camera.focus_mode);
    }
}  // mod tests.
