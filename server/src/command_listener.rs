// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! UDP command ingestion from the flight computers. One listener per peer
//! (plus an optional loopback listener) receives fixed-size command packets;
//! packets from a computer that is not in charge are discarded. Decoded
//! updates land in the shared parameter state, and any pending hardware
//! mutations (focus, aperture, exposure, gain) are executed once no image
//! capture is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use starcam_elements::camera_trait::AbstractCamera;
use starcam_elements::params::SharedState;
use starcam_elements::wire::{CommandPacket, TriggerPacket,
                             COMMAND_PACKET_SIZE, TRIGGER_PACKET_SIZE};

use crate::lens_controller::LensController;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Shared handles a command listener needs to apply packets.
#[derive(Clone)]
pub struct CommandContext {
    pub state: Arc<Mutex<SharedState>>,
    pub lens: Arc<Mutex<LensController>>,
    pub camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
    pub taking_image: Arc<AtomicBool>,
    pub shutting_down: Arc<AtomicBool>,
}

/// Applies one decoded command packet to the shared state. Returns true if
/// the hardware-adjust step should run afterward. Pure state mutation; no
/// I/O, so the decode path never blocks the pipeline.
pub fn apply_command_packet(packet: &CommandPacket, state: &mut SharedState)
                            -> bool {
    if packet.in_charge != 1 {
        info!("Commands received from not-in-charge computer; ignoring");
        return false;
    }
    debug!("Processing command packet from FC{}", packet.fc);

    if packet.update_log_odds == 1 {
        state.astro.logodds = packet.log_odds;
    }
    if packet.update_latitude == 1 {
        state.astro.latitude = packet.latitude;
    }
    if packet.update_longitude == 1 {
        state.astro.longitude = packet.longitude;
    }
    if packet.update_height == 1 {
        state.astro.hm = packet.height_wgs84;
    }
    if packet.update_solve_time_limit == 1 {
        state.astro.timelimit = packet.solve_time_limit;
    }

    if packet.update_focus_mode == 1 {
        if packet.focus_mode == 0 && state.camera.focus_mode {
            info!("Cancelling auto-focus process");
            state.cancelling_auto_focus = true;
        } else {
            // Reset the cancellation flag if we are not auto-focusing at
            // all, staying in auto-focus, or entering it.
            state.cancelling_auto_focus = false;
        }
        // Auto-focus restricts the other lens commands, so settle it before
        // they are considered below.
        if packet.focus_mode != 0 {
            state.camera.begin_auto_focus = true;
        }
        state.camera.focus_mode = packet.focus_mode != 0;
    }
    if packet.update_start_pos == 1 {
        state.camera.start_focus_pos = packet.start_pos;
    }
    if packet.update_end_pos == 1 {
        state.camera.end_focus_pos = packet.end_pos;
    }
    if packet.update_focus_step == 1 {
        state.camera.focus_step = packet.focus_step;
    }
    if packet.update_photos_per_step == 1 {
        state.camera.photos_per_focus = packet.photos_per_step;
    }
    if packet.update_make_hp == 1 {
        state.blob.make_static_hp_mask = packet.make_hp;
    }
    if packet.update_use_hp == 1 {
        state.blob.use_static_hp_mask = packet.use_hp != 0;
    }

    let blob = &mut state.blob;
    let values = &packet.blob_params;
    if packet.update_blob_params[0] == 1 {
        blob.spike_limit = values[0] as i32;
    }
    if packet.update_blob_params[1] == 1 {
        blob.dynamic_hot_pixels = values[1] != 0.0;
    }
    if packet.update_blob_params[2] == 1 {
        blob.r_smooth = values[2] as i32;
    }
    if packet.update_blob_params[3] == 1 {
        blob.high_pass_filter = values[3] != 0.0;
    }
    if packet.update_blob_params[4] == 1 {
        blob.r_high_pass_filter = values[4] as i32;
    }
    if packet.update_blob_params[5] == 1 {
        blob.centroid_search_border = values[5] as i32;
    }
    if packet.update_blob_params[6] == 1 {
        blob.filter_return_image = values[6] != 0.0;
    }
    if packet.update_blob_params[7] == 1 {
        blob.n_sigma = values[7];
    }
    if packet.update_blob_params[8] == 1 {
        blob.unique_star_spacing = values[8] as i32;
    }

    if packet.update_trigger_mode == 1 {
        state.trigger.trigger_mode = packet.trigger_mode != 0;
    }
    if packet.update_trigger_timeout_us == 1 {
        state.trigger.trigger_timeout_us = packet.trigger_timeout_us;
    }

    // Lens and exposure commands are ignored while an auto-focus sweep is
    // active or being cancelled.
    let lens_locked_out = state.camera.focus_mode || state.cancelling_auto_focus;
    if lens_locked_out {
        if packet.update_exposure_time == 1 || packet.update_gain_fact == 1 ||
            packet.update_set_focus_inf == 1 || packet.update_focus_pos == 1 ||
            packet.update_max_aperture == 1 || packet.update_aperture_steps == 1
        {
            info!("In or entering auto-focus, or cancelling; ignoring lens \
                   commands");
        }
        return false;
    }

    if packet.update_exposure_time == 1
        && packet.exposure_time_ms.ceil() != state.camera.exposure_time.ceil()
    {
        state.camera.exposure_time = packet.exposure_time_ms;
        state.camera.change_exposure = true;
    }
    if packet.update_gain_fact == 1
        && packet.gain_fact != state.camera.gain_fact
    {
        state.camera.gain_fact = packet.gain_fact;
        state.camera.change_gain = true;
    }
    if packet.update_set_focus_inf == 1 {
        state.camera.focus_inf = packet.set_focus_inf != 0;
    }
    if packet.update_focus_pos == 1 {
        state.camera.focus_position = packet.focus_pos as i32;
    }
    if packet.update_max_aperture == 1 {
        state.camera.max_aperture = packet.max_aperture != 0;
    }
    if packet.update_aperture_steps == 1 {
        state.camera.aperture_steps = packet.aperture_steps;
    }
    true
}

/// Executes pending hardware mutations once the pipeline is not mid-capture.
pub async fn adjust_hardware(context: &CommandContext) {
    // A capture in flight owns the camera; wait for it to finish.
    while context.taking_image.load(Ordering::Relaxed) {
        if context.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (change_exposure, exposure_ms, change_gain, gain_fact) = {
        let mut locked_state = context.state.lock().unwrap();
        let mut lens = context.lens.lock().unwrap();
        if let Err(e) = lens.adjust_hardware(&mut locked_state.camera) {
            warn!("Error executing at least one lens command: {:?}", e);
        }
        let camera = &mut locked_state.camera;
        let pending = (camera.change_exposure, camera.exposure_time,
                       camera.change_gain, camera.gain_fact);
        camera.change_exposure = false;
        camera.change_gain = false;
        pending
    };

    if change_exposure {
        let result = context.camera.lock().await.set_exposure_duration(
            Duration::from_secs_f64(exposure_ms / 1000.0)).await;
        if let Err(e) = result {
            warn!("Error setting exposure: {:?}", e);
        }
    }
    if change_gain {
        if let Err(e) = context.camera.lock().await.set_gain(gain_fact).await {
            warn!("Error setting gain: {:?}", e);
        }
    }
}

/// Listens for command packets from one peer until shutdown. The socket is
/// re-armed with a 500 ms timeout so the shutdown flag is observed promptly.
pub async fn run_command_listener(name: String, socket: UdpSocket,
                                  context: CommandContext) {
    info!("{} command listener on {:?}", name, socket.local_addr().ok());
    let mut buf = [0_u8; COMMAND_PACKET_SIZE + 1];
    while !context.shutting_down.load(Ordering::Relaxed) {
        let received = tokio::time::timeout(
            RECEIVE_TIMEOUT, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Err(_) => continue,  // Timeout; re-check shutdown.
            Ok(Err(e)) => {
                warn!("{} receive error: {:?}", name, e);
                continue;
            }
            Ok(Ok(result)) => result,
        };
        let packet = match CommandPacket::decode(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: bad command datagram from {}: {:?}", name, from, e);
                continue;
            }
        };
        let needs_hardware = {
            let mut locked_state = context.state.lock().unwrap();
            apply_command_packet(&packet, &mut locked_state)
        };
        if needs_hardware {
            adjust_hardware(&context).await;
        }
        debug!("{}: packet from FC{} processed", name, packet.fc);
    }
    info!("{} command listener exiting", name);
}

/// Listens for trigger packets from one peer; an in-charge trigger arms the
/// pipeline's next capture when trigger mode is enabled.
pub async fn run_trigger_listener(name: String, socket: UdpSocket,
                                  state: Arc<Mutex<SharedState>>,
                                  shutting_down: Arc<AtomicBool>) {
    info!("{} trigger listener on {:?}", name, socket.local_addr().ok());
    let mut buf = [0_u8; TRIGGER_PACKET_SIZE + 1];
    while !shutting_down.load(Ordering::Relaxed) {
        let received = tokio::time::timeout(
            RECEIVE_TIMEOUT, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!("{} receive error: {:?}", name, e);
                continue;
            }
            Ok(Ok(result)) => result,
        };
        match TriggerPacket::decode(&buf[..len]) {
            Ok(packet) if packet.in_charge == 1 && packet.trigger == 1 => {
                debug!("{}: trigger from FC{}", name, packet.fc);
                state.lock().unwrap().trigger.triggered = true;
            }
            Ok(_) => (),
            Err(e) => {
                warn!("{}: bad trigger datagram from {}: {:?}", name, from, e);
            }
        }
    }
    info!("{} trigger listener exiting", name);
}

#[cfg(test)]
mod tests {
    use crate::lens_controller::SimulatedLensTransport;
    use crate::image_camera::ImageCamera;
    use starcam_elements::image_utils::Gray16Image;
    use super::*;

    fn updating_packet() -> CommandPacket {
        CommandPacket {
            fc: 1,
            in_charge: 1,
            log_odds: 1e6,
            update_log_odds: 1,
            latitude: 33.0,
            update_latitude: 1,
            exposure_time_ms: 250.0,
            update_exposure_time: 1,
            gain_fact: 2.0,
            update_gain_fact: 1,
            focus_pos: 1500.0,
            update_focus_pos: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_not_in_charge_has_no_effect() {
        let mut state = SharedState::default();
        let baseline = state.clone();
        let mut packet = updating_packet();
        packet.in_charge = 0;
        assert!(!apply_command_packet(&packet, &mut state));
        assert_eq!(state.astro.logodds, baseline.astro.logodds);
        assert_eq!(state.astro.latitude, baseline.astro.latitude);
        assert_eq!(state.camera.exposure_time, baseline.camera.exposure_time);
        assert!(!state.camera.change_exposure);
        assert_eq!(state.camera.focus_position, baseline.camera.focus_position);
    }

    #[test]
    fn test_flagged_fields_are_applied() {
        let mut state = SharedState::default();
        assert!(apply_command_packet(&updating_packet(), &mut state));
        assert_eq!(state.astro.logodds, 1e6);
        assert_eq!(state.astro.latitude, 33.0);
        // Longitude had no update flag.
        assert_eq!(state.astro.longitude,
                   SharedState::default().astro.longitude);
        assert_eq!(state.camera.exposure_time, 250.0);
        assert!(state.camera.change_exposure);
        assert_eq!(state.camera.gain_fact, 2.0);
        assert!(state.camera.change_gain);
        assert_eq!(state.camera.focus_position, 1500);
    }

    #[test]
    fn test_unchanged_exposure_does_not_request_change() {
        let mut state = SharedState::default();
        let mut packet = CommandPacket {
            in_charge: 1,
            update_exposure_time: 1,
            exposure_time_ms: state.camera.exposure_time,
            ..Default::default()
        };
        apply_command_packet(&packet, &mut state);
        assert!(!state.camera.change_exposure);

        packet.exposure_time_ms += 100.0;
        apply_command_packet(&packet, &mut state);
        assert!(state.camera.change_exposure);
    }

    #[test]
    fn test_focus_mode_transitions() {
        let mut state = SharedState::default();
        state.camera.begin_auto_focus = false;

        // Entering focus mode requests a sweep.
        let enter = CommandPacket {
            in_charge: 1,
            update_focus_mode: 1,
            focus_mode: 1,
            ..Default::default()
        };
        assert!(!apply_command_packet(&enter, &mut state));
        assert!(state.camera.focus_mode);
        assert!(state.camera.begin_auto_focus);
        assert!(!state.cancelling_auto_focus);

        // Clearing focus mode mid-sweep cancels.
        let cancel = CommandPacket {
            in_charge: 1,
            update_focus_mode: 1,
            focus_mode: 0,
            ..Default::default()
        };
        apply_command_packet(&cancel, &mut state);
        assert!(!state.camera.focus_mode);
        assert!(state.cancelling_auto_focus);
    }

    #[test]
    fn test_lens_commands_ignored_during_sweep() {
        let mut state = SharedState::default();
        state.camera.focus_mode = true;
        state.camera.focus_position = 1000;

        let packet = CommandPacket {
            in_charge: 1,
            update_focus_pos: 1,
            focus_pos: 1500.0,
            update_exposure_time: 1,
            exposure_time_ms: 999.0,
            ..Default::default()
        };
        // Applied nothing lens-related; no hardware pass requested.
        assert!(!apply_command_packet(&packet, &mut state));
        assert_eq!(state.camera.focus_position, 1000);
        assert!(!state.camera.change_exposure);
    }

    #[test]
    fn test_blob_param_array_mapping() {
        let mut state = SharedState::default();
        let packet = CommandPacket {
            in_charge: 1,
            blob_params: [5.0, 0.0, 2.0, 1.0, 12.0, 3.0, 1.0, 7.5, 20.0],
            update_blob_params: [1; 9],
            ..Default::default()
        };
        apply_command_packet(&packet, &mut state);
        let blob = &state.blob;
        assert_eq!(blob.spike_limit, 5);
        assert!(!blob.dynamic_hot_pixels);
        assert_eq!(blob.r_smooth, 2);
        assert!(blob.high_pass_filter);
        assert_eq!(blob.r_high_pass_filter, 12);
        assert_eq!(blob.centroid_search_border, 3);
        assert!(blob.filter_return_image);
        assert_eq!(blob.n_sigma, 7.5);
        assert_eq!(blob.unique_star_spacing, 20);
    }

    #[tokio::test]
    async fn test_listener_applies_datagram_end_to_end() {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let context = CommandContext {
            state: state.clone(),
            lens: Arc::new(Mutex::new(LensController::new(
                Box::new(SimulatedLensTransport::new())))),
            camera: Arc::new(tokio::sync::Mutex::new(Box::new(
                ImageCamera::new("test", Gray16Image::new(32, 32))))),
            taking_image: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        };

        let listener_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener_socket.local_addr().unwrap();
        let shutting_down = context.shutting_down.clone();
        let listener = tokio::spawn(run_command_listener(
            "test".to_string(), listener_socket, context));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = updating_packet();
        sender.send_to(&packet.encode(), listener_addr).await.unwrap();

        // Wait for the listener to process it.
        for _ in 0..100 {
            if state.lock().unwrap().astro.logodds == 1e6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.lock().unwrap().astro.logodds, 1e6);
        // The exposure write reached the camera via the hardware-adjust
        // step.
        assert!(!state.lock().unwrap().camera.change_exposure);

        shutting_down.store(true, Ordering::Relaxed);
        listener.await.unwrap();
        assert_eq!(state.lock().unwrap().astro.latitude, 33.0);
    }
}  // mod tests.
