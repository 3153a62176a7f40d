// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Telemetry out to the flight computers. Each peer gets two senders: the
//! astrometry sender, woken by a watch channel whenever the pipeline
//! publishes a new pointing solution, and the parameter sender, which
//! snapshots and sends every tunable once per second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use starcam_elements::params::{PointingSolution, SharedState};
use starcam_elements::wire::{AstrometryPacket, ParameterPacket};

const PARAMETER_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Latest published solution plus a cycle counter; the counter distinguishes
/// fresh solves so each sender emits exactly once per solution.
pub type SolutionUpdate = (u64, PointingSolution);

pub fn solution_channel()
    -> (watch::Sender<SolutionUpdate>, watch::Receiver<SolutionUpdate>) {
    watch::channel((0, PointingSolution::default()))
}

pub fn astrometry_packet(solution: &PointingSolution) -> AstrometryPacket {
    AstrometryPacket {
        ra_j2000: solution.ra_j2000,
        dec_j2000: solution.dec_j2000,
        ra_observed: solution.ra_observed,
        dec_observed: solution.dec_observed,
        rawtime: solution.rawtime,
        image_rms: solution.sigma_as,
        fr: solution.fr,
        ps: solution.ps,
        ir: solution.ir,
        alt: solution.alt,
        az: solution.az,
        photo_time: solution.photo_time,
        num_blobs_found: solution.num_blobs_found,
    }
}

pub fn parameter_packet(state: &SharedState) -> ParameterPacket {
    let camera = &state.camera;
    let blob = &state.blob;
    ParameterPacket {
        log_odds: state.astro.logodds,
        latitude: state.astro.latitude,
        longitude: state.astro.longitude,
        height_wgs84: state.astro.hm,
        exposure_time_ms: camera.exposure_time,
        gain_fact: camera.gain_fact,
        solve_time_limit: state.astro.timelimit,
        focus_pos: camera.focus_position as f32,
        min_focus_pos: camera.min_focus_pos,
        max_focus_pos: camera.max_focus_pos,
        focus_mode: camera.focus_mode as i32,
        start_pos: camera.start_focus_pos,
        end_pos: camera.end_focus_pos,
        focus_step: camera.focus_step,
        photos_per_step: camera.photos_per_focus,
        set_focus_inf: camera.focus_inf as i32,
        aperture_steps: camera.aperture_steps,
        max_aperture: camera.max_aperture as i32,
        aperture: camera.current_aperture as f32,
        make_hp: blob.make_static_hp_mask,
        use_hp: blob.use_static_hp_mask as i32,
        blob_params: [
            blob.spike_limit as f32,
            blob.dynamic_hot_pixels as i32 as f32,
            blob.r_smooth as f32,
            blob.high_pass_filter as i32 as f32,
            blob.r_high_pass_filter as f32,
            blob.centroid_search_border as f32,
            blob.filter_return_image as i32 as f32,
            blob.n_sigma,
            blob.unique_star_spacing as f32,
        ],
        trigger_mode: state.trigger.trigger_mode as i32,
        trigger_timeout_us: state.trigger.trigger_timeout_us,
    }
}

/// Sends the astrometry packet to one peer whenever a new solution is
/// published.
pub async fn run_astrometry_sender(name: String, destination: String,
                                   mut solutions: watch::Receiver<SolutionUpdate>,
                                   shutting_down: Arc<AtomicBool>) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("{} astrometry sender could not bind: {:?}", name, e);
            return;
        }
    };
    info!("{} astrometry sender targeting {}", name, destination);
    while !shutting_down.load(Ordering::Relaxed) {
        // Poll the channel with a timeout so shutdown is observed.
        match tokio::time::timeout(SHUTDOWN_POLL, solutions.changed()).await {
            Err(_) => continue,
            Ok(Err(_)) => break,  // Sender dropped; pipeline is gone.
            Ok(Ok(())) => (),
        }
        let (cycle, solution) = solutions.borrow_and_update().clone();
        if cycle == 0 {
            continue;  // Initial placeholder value.
        }
        let packet = astrometry_packet(&solution);
        match socket.send_to(&packet.encode(), &destination).await {
            Ok(_) => debug!("{}: sent astrometry packet for cycle {}",
                            name, cycle),
            Err(e) => warn!("{}: astrometry send failed: {:?}", name, e),
        }
    }
    info!("{} astrometry sender exiting", name);
}

/// Sends the parameter snapshot to one peer once per second.
pub async fn run_parameter_sender(name: String, destination: String,
                                  state: Arc<Mutex<SharedState>>,
                                  shutting_down: Arc<AtomicBool>) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("{} parameter sender could not bind: {:?}", name, e);
            return;
        }
    };
    info!("{} parameter sender targeting {}", name, destination);
    while !shutting_down.load(Ordering::Relaxed) {
        let packet = {
            let locked_state = state.lock().unwrap();
            parameter_packet(&locked_state)
        };
        if let Err(e) = socket.send_to(&packet.encode(), &destination).await {
            warn!("{}: parameter send failed: {:?}", name, e);
        }
        tokio::time::sleep(PARAMETER_INTERVAL).await;
    }
    info!("{} parameter sender exiting", name);
}

// mod tests.
