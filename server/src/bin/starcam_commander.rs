// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Bench commander: builds a command (or trigger) packet from command-line
//! options and sends it to a star camera server over UDP. Every supplied
//! option sets both the value and its update flag; omitted fields are left
//! untouched by the server. Optionally waits for one parameter telemetry
//! packet and prints the echo.

use std::net::UdpSocket;
use std::time::Duration;

use pico_args::Arguments;

use starcam_elements::wire::{CommandPacket, ParameterPacket, TriggerPacket,
                             PARAMETER_PACKET_SIZE};

const HELP: &str = "\
USAGE:
  starcam-commander --target <ip:port> [options]

FLAGS:
  -h, --help                     Prints help information
  --trigger                      Send a trigger packet instead of a command
  --not_in_charge                Mark the packet as not in charge

OPTIONS:
  --target <ip:port>             127.0.0.1:4954
  --fc <n>                       1
  --logodds <x>                  Solver odds ratio to accept a match
  --latitude <deg>
  --longitude <deg>
  --height <m>
  --exposure <ms>
  --gain <x>
  --solve_timeout <s>
  --focus_pos <counts>
  --focus_mode <0|1>
  --start_pos <counts>
  --end_pos <counts>
  --focus_step <counts>
  --photos_per_step <n>
  --focus_inf <0|1>
  --aperture_steps <n>
  --max_aperture <0|1>
  --make_hp <threshold>
  --use_hp <0|1>
  --blob <idx>=<value>           Blob parameter (0..8); repeatable
  --trigger_mode <0|1>
  --trigger_timeout_us <n>
  --await_params <port>          Wait for one parameter packet on this port
";

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        return Ok(());
    }

    let target: String = pargs.value_from_str("--target")
        .unwrap_or("127.0.0.1:4954".to_string());
    let fc: i32 = pargs.value_from_str("--fc").unwrap_or(1);
    let in_charge = !pargs.contains("--not_in_charge");
    let send_trigger = pargs.contains("--trigger");
    let await_params: Option<u16> =
        pargs.opt_value_from_str("--await_params").map_err(err_str)?;

    let socket = UdpSocket::bind("0.0.0.0:0").map_err(err_str)?;

    if send_trigger {
        let packet = TriggerPacket {
            fc,
            target: [0; 16],
            in_charge: in_charge as i32,
            trigger: 1,
        };
        socket.send_to(&packet.encode(), &target).map_err(err_str)?;
        println!("Sent trigger packet to {}", target);
        return Ok(());
    }

    let mut packet = CommandPacket {
        fc,
        in_charge: in_charge as i32,
        ..Default::default()
    };

    if let Some(value) = opt_f64(&mut pargs, "--logodds")? {
        packet.log_odds = value;
        packet.update_log_odds = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--latitude")? {
        packet.latitude = value;
        packet.update_latitude = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--longitude")? {
        packet.longitude = value;
        packet.update_longitude = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--height")? {
        packet.height_wgs84 = value;
        packet.update_height = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--exposure")? {
        packet.exposure_time_ms = value;
        packet.update_exposure_time = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--gain")? {
        packet.gain_fact = value;
        packet.update_gain_fact = 1;
    }
    if let Some(value) = opt_f64(&mut pargs, "--solve_timeout")? {
        packet.solve_time_limit = value;
        packet.update_solve_time_limit = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--focus_pos")? {
        packet.focus_pos = value as f32;
        packet.update_focus_pos = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--focus_mode")? {
        packet.focus_mode = value;
        packet.update_focus_mode = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--start_pos")? {
        packet.start_pos = value;
        packet.update_start_pos = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--end_pos")? {
        packet.end_pos = value;
        packet.update_end_pos = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--focus_step")? {
        packet.focus_step = value;
        packet.update_focus_step = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--photos_per_step")? {
        packet.photos_per_step = value;
        packet.update_photos_per_step = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--focus_inf")? {
        packet.set_focus_inf = value;
        packet.update_set_focus_inf = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--aperture_steps")? {
        packet.aperture_steps = value;
        packet.update_aperture_steps = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--max_aperture")? {
        packet.max_aperture = value;
        packet.update_max_aperture = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--make_hp")? {
        packet.make_hp = value;
        packet.update_make_hp = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--use_hp")? {
        packet.use_hp = value;
        packet.update_use_hp = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--trigger_mode")? {
        packet.trigger_mode = value;
        packet.update_trigger_mode = 1;
    }
    if let Some(value) = opt_i32(&mut pargs, "--trigger_timeout_us")? {
        packet.trigger_timeout_us = value;
        packet.update_trigger_timeout_us = 1;
    }
    loop {
        let blob: Option<String> =
            pargs.opt_value_from_str("--blob").map_err(err_str)?;
        let Some(blob) = blob else { break };
        let (index, value) = blob.split_once('=').ok_or_else(
            || format!("--blob wants <idx>=<value>, got {:?}", blob))?;
        let index: usize = index.parse().map_err(err_str)?;
        if index > 8 {
            return Err(format!("--blob index {} out of range 0..8", index));
        }
        packet.blob_params[index] = value.parse().map_err(err_str)?;
        packet.update_blob_params[index] = 1;
    }

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        return Err(format!("Unrecognized arguments: {:?}", remaining));
    }

    socket.send_to(&packet.encode(), &target).map_err(err_str)?;
    println!("Sent command packet to {}", target);

    if let Some(port) = await_params {
        let listener =
            UdpSocket::bind(("0.0.0.0", port)).map_err(err_str)?;
        listener.set_read_timeout(Some(Duration::from_secs(5)))
            .map_err(err_str)?;
        let mut buf = [0_u8; PARAMETER_PACKET_SIZE + 1];
        let (len, from) = listener.recv_from(&mut buf).map_err(err_str)?;
        let echo = ParameterPacket::decode(&buf[..len]).map_err(err_str)?;
        println!("Parameter echo from {}:", from);
        println!("  exposure {} ms, gain {:.2}x, solve timeout {} s",
                 echo.exposure_time_ms, echo.gain_fact, echo.solve_time_limit);
        println!("  focus {} in [{}, {}], aperture f{}, focus mode {}",
                 echo.focus_pos, echo.min_focus_pos, echo.max_focus_pos,
                 echo.aperture, echo.focus_mode);
        println!("  site {:.6}, {:.6} at {:.1} m; log odds {:.3e}",
                 echo.latitude, echo.longitude, echo.height_wgs84,
                 echo.log_odds);
        println!("  blob params {:?}", echo.blob_params);
    }
    Ok(())
}

fn opt_f64(pargs: &mut Arguments, key: &'static str)
           -> Result<Option<f64>, String> {
    pargs.opt_value_from_str(key).map_err(err_str)
}

fn opt_i32(pargs: &mut Arguments, key: &'static str)
           -> Result<Option<i32>, String> {
    pargs.opt_value_from_str(key).map_err(err_str)
}

fn err_str<E: std::fmt::Debug>(e: E) -> String {
    format!("{:?}", e)
}
