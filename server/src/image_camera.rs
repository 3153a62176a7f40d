// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! An AbstractCamera backed by a fixed image, standing in for the vendor SDK
//! in --test_image runs and tests. Captures return the (possibly binned)
//! stored frame; the sharpness score is a Sobel gradient magnitude over an
//! inset region, mirroring the SDK metric the auto-focus consumes.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};
use log::info;

use starcam_elements::camera_trait::{
    AbstractCamera, CaptureParams, CapturedImage};
use starcam_elements::image_utils::Gray16Image;

// Blank pixels around the active array, excluded from the sharpness ROI.
const SHARPNESS_BORDER: u32 = 4;

pub struct ImageCamera {
    name: String,
    frame: Gray16Image,
    exposure: Duration,
    gain: f64,
    binning: u32,
    triggered: bool,
    last_frame: Option<Arc<Gray16Image>>,
}

impl ImageCamera {
    pub fn new(name: &str, frame: Gray16Image) -> Self {
        ImageCamera {
            name: name.to_string(),
            frame,
            exposure: Duration::from_millis(100),
            gain: 1.0,
            binning: 1,
            triggered: false,
            last_frame: None,
        }
    }

    /// Loads a test image from disk, converting to 16-bit grayscale and
    /// right-shifting into the 12-bit sample range.
    pub fn from_file(name: &str, path: &Path) -> Result<Self, CanonicalError> {
        let dynamic = image::open(path).map_err(|e| failed_precondition_error(
            format!("Could not load test image {:?}: {:?}", path, e).as_str()))?;
        let mut frame = dynamic.to_luma16();
        for pixel in frame.pixels_mut() {
            pixel[0] >>= 4;
        }
        info!("Loaded {}x{} test image from {:?}",
              frame.width(), frame.height(), path);
        Ok(ImageCamera::new(name, frame))
    }

    fn binned_frame(&self) -> Gray16Image {
        let b = self.binning;
        if b <= 1 {
            return self.frame.clone();
        }
        let (w, h) = (self.frame.width() / b, self.frame.height() / b);
        let mut binned = Gray16Image::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0_u32;
                for dy in 0..b {
                    for dx in 0..b {
                        sum += self.frame.get_pixel(x * b + dx, y * b + dy)[0]
                            as u32;
                    }
                }
                binned.put_pixel(x, y,
                                 image::Luma([(sum / (b * b)) as u16]));
            }
        }
        binned
    }
}

#[async_trait]
impl AbstractCamera for ImageCamera {
    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width(), self.frame.height())
    }

    fn sensor_name(&self) -> &str {
        &self.name
    }

    async fn set_exposure_duration(&mut self, exposure_duration: Duration)
                                   -> Result<(), CanonicalError> {
        self.exposure = exposure_duration;
        Ok(())
    }

    fn get_exposure_duration(&self) -> Duration {
        self.exposure
    }

    async fn set_gain(&mut self, gain: f64) -> Result<(), CanonicalError> {
        if gain <= 0.0 {
            return Err(invalid_argument_error(
                format!("gain must be positive; got {}", gain).as_str()));
        }
        self.gain = gain;
        Ok(())
    }

    async fn set_binning(&mut self, factor: u32) -> Result<(), CanonicalError> {
        if !matches!(factor, 1 | 2 | 4) {
            return Err(invalid_argument_error(
                format!("unsupported binning factor {}", factor).as_str()));
        }
        self.binning = factor;
        Ok(())
    }

    async fn trigger(&mut self) -> Result<(), CanonicalError> {
        self.triggered = true;
        Ok(())
    }

    async fn wait_for_frame(&mut self, _timeout: Duration)
                            -> Result<CapturedImage, CanonicalError> {
        if !self.triggered {
            return Err(failed_precondition_error(
                "wait_for_frame without a pending trigger"));
        }
        self.triggered = false;
        // Stand in for the exposure itself, without making tests crawl.
        tokio::time::sleep(self.exposure.min(Duration::from_millis(5))).await;
        let frame = Arc::new(self.binned_frame());
        self.last_frame = Some(frame.clone());
        Ok(CapturedImage {
            image: frame,
            readout_time: SystemTime::now(),
            capture_params: CaptureParams {
                exposure_duration: self.exposure,
                gain: self.gain,
                binning: self.binning,
            },
            temperature_celsius: 20.0,
        })
    }

    async fn measure_sharpness(&mut self) -> Result<f64, CanonicalError> {
        let frame = self.last_frame.as_ref().ok_or_else(
            || failed_precondition_error("No frame captured yet"))?;
        let (w, h) = frame.dimensions();
        let border = SHARPNESS_BORDER;
        if w <= 2 * border + 2 || h <= 2 * border + 2 {
            return Err(failed_precondition_error(
                "Frame too small for sharpness ROI"));
        }
        // Sobel y-gradient magnitude over the inset ROI; azimuth scanning
        // blurs mostly in x, making the y gradient the steadier metric.
        let mut total = 0.0;
        let mut count = 0_u64;
        for y in border + 1..h - border - 1 {
            for x in border + 1..w - border - 1 {
                let p = |dx: i32, dy: i32| -> f64 {
                    frame.get_pixel((x as i32 + dx) as u32,
                                    (y as i32 + dy) as u32)[0] as f64
                };
                let gy = -p(-1, -1) - 2.0 * p(0, -1) - p(1, -1)
                    + p(-1, 1) + 2.0 * p(0, 1) + p(1, 1);
                total += gy.abs();
                count += 1;
            }
        }
        Ok(total / count as f64)
    }

    async fn renew_hot_pixels(&mut self) -> Result<(), CanonicalError> {
        Ok(())
    }

    async fn save_parameters(&mut self, path: &Path)
                             -> Result<(), CanonicalError> {
        let dump = format!(
            "[{}]\nexposure_ms={}\ngain={}\nbinning={}\n",
            self.name, self.exposure.as_secs_f64() * 1000.0, self.gain,
            self.binning);
        std::fs::write(path, dump).map_err(|e| failed_precondition_error(
            format!("Could not save camera parameters to {:?}: {:?}",
                    path, e).as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Gray16Image {
        Gray16Image::from_fn(width, height,
                             |_x, y| image::Luma([(y * 16) as u16]))
    }

    #[tokio::test]
    async fn test_capture_requires_trigger() {
        let mut camera = ImageCamera::new("test", gradient_frame(32, 32));
        assert!(camera.wait_for_frame(Duration::from_secs(1)).await.is_err());
        camera.trigger().await.unwrap();
        let captured = camera.wait_for_frame(Duration::from_secs(1)).await
            .unwrap();
        assert_eq!(captured.image.dimensions(), (32, 32));
        // Trigger is consumed.
        assert!(camera.wait_for_frame(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_binning_averages_blocks() {
        let mut camera = ImageCamera::new("test", gradient_frame(32, 32));
        camera.set_binning(4).await.unwrap();
        camera.trigger().await.unwrap();
        let captured = camera.wait_for_frame(Duration::from_secs(1)).await
            .unwrap();
        assert_eq!(captured.image.dimensions(), (8, 8));
        // Rows 0..4 have values 0, 16, 32, 48; their mean is 24.
        assert_eq!(captured.image.get_pixel(0, 0)[0], 24);
    }

    #[tokio::test]
    async fn test_sharpness_sees_vertical_gradient() {
        let mut camera = ImageCamera::new("test", gradient_frame(32, 32));
        camera.trigger().await.unwrap();
        camera.wait_for_frame(Duration::from_secs(1)).await.unwrap();
        let sharp = camera.measure_sharpness().await.unwrap();
        // Constant dv/dy of 16 across the ROI: |gy| = 8 * 16.
        assert_eq!(sharp, 128.0);

        // A flat frame scores zero.
        let mut flat = ImageCamera::new("flat", Gray16Image::new(32, 32));
        flat.trigger().await.unwrap();
        flat.wait_for_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(flat.measure_sharpness().await.unwrap(), 0.0);
    }
}  // mod tests.
