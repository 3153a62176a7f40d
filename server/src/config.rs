// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use imageproc::rect::Rect;

/// One flight-computer peer: where its commands and triggers arrive, and
/// where its telemetry goes.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,

    // Peer IP address, dotted quad.
    pub address: String,

    // Local ports we listen on for this peer.
    pub command_port: u16,
    pub trigger_port: u16,

    // Peer ports we send telemetry to.
    pub astrometry_port: u16,
    pub parameter_port: u16,
}

/// Fixed configuration for a server run, established at startup and carried
/// by the pipeline. Geometry and search bounds are per-sensor constants; the
/// tunable parameters live in SharedState.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    // Sensor geometry, pixels.
    pub width: usize,
    pub height: usize,
    pub margin: usize,

    // Saturated sample value for the 12-bit sensor.
    pub saturation_value: u16,

    // Pixel scale search bounds for the plate solver, arcsec/px.
    pub min_pixel_scale: f64,
    pub max_pixel_scale: f64,

    // UT1 - UTC, seconds.
    pub dut1: f64,

    // Blob-count passband; outside it, blob finding is retried once with the
    // high-pass filter enabled.
    pub min_blobs: usize,
    pub max_blobs: usize,

    // Sensor binning used during the contrast-detect focus sweep.
    pub focus_bin_factor: u32,

    pub static_hp_path: PathBuf,

    // Observing logs, auto-focus logs, blob tables, and FITS images all land
    // under here.
    pub data_dir: PathBuf,

    pub lens_tty: Option<String>,

    pub peers: Vec<PeerConfig>,

    // Also accept commands on the loopback interface (bench testing).
    pub listen_loopback: bool,
    pub loopback_command_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            width: 1936,
            height: 1216,
            margin: 0,
            saturation_value: 4095,
            min_pixel_scale: 6.0,
            max_pixel_scale: 7.0,
            dut1: -0.23,
            min_blobs: 4,
            max_blobs: 300,
            focus_bin_factor: 4,
            static_hp_path: PathBuf::from("static_hp_mask.txt"),
            data_dir: PathBuf::from("."),
            lens_tty: None,
            peers: vec![
                PeerConfig {
                    name: "FC1".to_string(),
                    address: "192.168.1.3".to_string(),
                    command_port: 4950,
                    trigger_port: 4952,
                    astrometry_port: 4960,
                    parameter_port: 4970,
                },
                PeerConfig {
                    name: "FC2".to_string(),
                    address: "192.168.1.4".to_string(),
                    command_port: 4951,
                    trigger_port: 4953,
                    astrometry_port: 4961,
                    parameter_port: 4971,
                },
            ],
            listen_loopback: false,
            loopback_command_port: 4954,
        }
    }
}

impl ServerConfig {
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// The full sensor area.
    pub fn full_region(&self) -> Rect {
        Rect::at(0, 0).of_size(self.width as u32, self.height as u32)
    }

    /// Active field dimensions after margins, pixels.
    pub fn active_width(&self) -> usize {
        self.width - 2 * self.margin
    }

    pub fn active_height(&self) -> usize {
        self.height - 2 * self.margin
    }
}
