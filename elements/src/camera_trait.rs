// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::CanonicalError;

use crate::image_utils::Gray16Image;

/// Settings in effect when a frame was captured.
#[derive(Clone, Copy, Debug)]
pub struct CaptureParams {
    pub exposure_duration: Duration,

    // Multiple of the sensor's base analog gain.
    pub gain: f64,

    // Sensor binning in effect (1 = full resolution).
    pub binning: u32,
}

/// A frame delivered by the camera, in 12-in-16-bit samples with the top
/// nibble possibly dirty (see image_utils::unpack_mono12).
#[derive(Clone)]
pub struct CapturedImage {
    pub image: Arc<Gray16Image>,
    pub readout_time: SystemTime,
    pub capture_params: CaptureParams,
    pub temperature_celsius: f32,
}

/// Abstracts the vendor camera SDK: the set of operations the pipeline and
/// auto-focus need from frame grabbing and parameter control. Implementations
/// talk to real hardware; tests and --test_image runs use an image-backed
/// substitute.
#[async_trait]
pub trait AbstractCamera {
    /// Full-resolution sensor dimensions (width, height), pixels.
    fn dimensions(&self) -> (u32, u32);

    fn sensor_name(&self) -> &str;

    async fn set_exposure_duration(&mut self, exposure_duration: Duration)
                                   -> Result<(), CanonicalError>;
    fn get_exposure_duration(&self) -> Duration;

    /// Gain as a multiple of the sensor's base analog gain.
    async fn set_gain(&mut self, gain: f64) -> Result<(), CanonicalError>;

    /// Changing binning may stop and restart acquisition; a failure to
    /// restart is fatal and is reported as an internal error.
    async fn set_binning(&mut self, factor: u32) -> Result<(), CanonicalError>;

    /// Issues a software trigger for the next frame.
    async fn trigger(&mut self) -> Result<(), CanonicalError>;

    /// Blocks until the triggered frame is transferred, up to `timeout`
    /// (callers pass three frame times). Times out with a deadline_exceeded
    /// error; the pipeline logs it and skips the cycle.
    async fn wait_for_frame(&mut self, timeout: Duration)
                            -> Result<CapturedImage, CanonicalError>;

    /// SDK-side sharpness score (Sobel magnitude over an inset ROI) of the
    /// most recent frame. Used by the contrast-detect auto-focus.
    async fn measure_sharpness(&mut self) -> Result<f64, CanonicalError>;

    /// Re-makes the SDK-internal hot pixel list at maximum sensitivity.
    async fn renew_hot_pixels(&mut self) -> Result<(), CanonicalError>;

    /// Dumps the SDK's current parameter set to a file (format is the
    /// SDK's own). Written at startup and again at shutdown.
    async fn save_parameters(&mut self, path: &Path)
                             -> Result<(), CanonicalError>;
}
