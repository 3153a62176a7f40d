// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Half-duplex text dialog with the lens focus/aperture controller. Each
//! command is a short ASCII token terminated by CR; the controller echoes the
//! command, then "OK" and any payload. After motion commands the position is
//! queried back ("fp" for focus, "pa" for aperture) and parsed into the
//! camera parameter block.

use std::io::{Read, Write};
use std::time::Duration;

use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};
use log::{debug, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use starcam_elements::params::CameraParams;

// Counts below infinity that focus best at typical operating temperature,
// found by repeated auto-focus runs against the flight lens.
const DEFAULT_FOCUS_OFFSET: i32 = -80;

const RESPONSE_CAPACITY: usize = 99;

/// One command/response exchange with the lens. Implemented over a serial
/// port in flight; tests and --no-lens bench runs use substitutes.
pub trait LensTransport: Send {
    fn transact(&mut self, command: &str) -> Result<String, CanonicalError>;
}

/// RS-232 transport: 115200 baud, 8N1, no flow control, ~0.1 s
/// inter-character timeout, reads capped at 99 bytes.
pub struct SerialLensTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLensTransport {
    pub fn open(path: &str) -> Result<Self, CanonicalError> {
        let port = serialport::new(path, 115_200)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| failed_precondition_error(
                format!("Error opening lens port {}: {:?}", path, e).as_str()))?;
        Ok(SerialLensTransport { port })
    }
}

impl LensTransport for SerialLensTransport {
    fn transact(&mut self, command: &str) -> Result<String, CanonicalError> {
        // Drop any stale bytes from a previous unclean exchange.
        self.port.clear(ClearBuffer::All).map_err(|e| failed_precondition_error(
            format!("Error flushing lens port: {:?}", e).as_str()))?;
        self.port.write_all(command.as_bytes()).map_err(
            |e| failed_precondition_error(
                format!("Error writing lens command {:?}: {:?}",
                        command.trim_end(), e).as_str()))?;

        let mut response = Vec::with_capacity(RESPONSE_CAPACITY);
        let mut chunk = [0_u8; RESPONSE_CAPACITY];
        while response.len() < RESPONSE_CAPACITY {
            match self.port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let take = n.min(RESPONSE_CAPACITY - response.len());
                    response.extend_from_slice(&chunk[..take]);
                }
                // The inter-character timeout marks end of response.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(failed_precondition_error(
                        format!("Error reading lens response: {:?}",
                                e).as_str()));
                }
            }
        }
        if response.is_empty() {
            return Err(failed_precondition_error(
                format!("No response to lens command {:?}",
                        command.trim_end()).as_str()));
        }
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Bench/test substitute: models the focus and aperture motors well enough
/// to exercise the full dialog, including the learn/move/query sequences.
pub struct SimulatedLensTransport {
    min_focus: i32,
    max_focus: i32,
    focus: i32,
    aperture: i32,
}

impl SimulatedLensTransport {
    pub fn new() -> Self {
        Self::with_range(0, 2200, 1000)
    }

    pub fn with_range(min_focus: i32, max_focus: i32, focus: i32) -> Self {
        SimulatedLensTransport {
            min_focus,
            max_focus,
            focus,
            aperture: 14,
        }
    }
}

impl Default for SimulatedLensTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LensTransport for SimulatedLensTransport {
    fn transact(&mut self, command: &str) -> Result<String, CanonicalError> {
        let token = command.trim_end_matches('\r');
        let echo = token.split_whitespace().next().unwrap_or(token);
        let response = if token == "la" {
            format!("{}\nOK\nDONE", echo)
        } else if token == "mi" {
            self.focus = self.max_focus;
            format!("{}\nOK\nDONE", echo)
        } else if token == "mz" {
            self.focus = self.min_focus;
            format!("{}\nOK\nDONE", echo)
        } else if let Some(rest) = token.strip_prefix("mf") {
            let delta: i32 = rest.trim().parse().map_err(
                |_| invalid_argument_error(
                    format!("Bad focus move {:?}", token).as_str()))?;
            self.focus = (self.focus + delta)
                .clamp(self.min_focus, self.max_focus);
            format!("{}\nOK\nDONE", echo)
        } else if token == "fp" {
            format!("{}\nOK\nfmin:{}  fmax:{}  current:{} %",
                    echo, self.min_focus, self.max_focus, self.focus)
        } else if token == "in" || token == "mo" {
            self.aperture = 14;
            format!("{}\nOK\nDONE", echo)
        } else if let Some(rest) = token.strip_prefix("mn") {
            let steps: i32 = rest.trim().parse().map_err(
                |_| invalid_argument_error(
                    format!("Bad aperture move {:?}", token).as_str()))?;
            self.aperture = (self.aperture + steps).clamp(14, 320);
            format!("{}\nOK\nDONE", echo)
        } else if token == "pa" {
            format!("{}\nOK\n0,f{}", echo, self.aperture)
        } else {
            format!("{}\nERR1", echo)
        };
        Ok(response)
    }
}

/// Drives the lens dialog and keeps the camera parameter block's focus and
/// aperture readbacks current.
pub struct LensController {
    transport: Box<dyn LensTransport>,
    default_focus: i32,
}

impl LensController {
    pub fn new(transport: Box<dyn LensTransport>) -> Self {
        LensController { transport, default_focus: 0 }
    }

    pub fn open_serial(path: &str) -> Result<Self, CanonicalError> {
        Ok(LensController::new(Box::new(SerialLensTransport::open(path)?)))
    }

    /// Runs one command. "fp" and "pa" responses update the parameter
    /// block's focus and aperture readbacks. An "ERR" in the response fails
    /// this command only.
    pub fn run_command(&mut self, command: &str, params: &mut CameraParams)
                       -> Result<String, CanonicalError> {
        let response = self.transport.transact(&format!("{}\r", command))?;
        if response.contains("ERR") {
            return Err(failed_precondition_error(
                format!("Lens command {:?} returned {:?}",
                        command, response.trim()).as_str()));
        }
        if command == "fp" {
            parse_focus_response(&response, params)?;
        } else if command == "pa" {
            parse_aperture_response(&response, params)?;
        }
        debug!("Lens {:?} -> {:?}", command, response.trim());
        Ok(response)
    }

    /// Startup sequence: learn the focus range, move to infinity, back off
    /// to the heuristic default, then initialize and fully open the
    /// aperture. Seeds the auto-focus sweep range from the learned limits.
    pub fn init(&mut self, params: &mut CameraParams)
                -> Result<(), CanonicalError> {
        self.run_command("la", params)?;
        // The learn sweep takes an appreciable time; one settle here, once.
        std::thread::sleep(Duration::from_secs(1));
        self.run_command("mi", params)?;
        self.run_command(&format!("mf {}", DEFAULT_FOCUS_OFFSET), params)?;
        self.run_command("fp", params)?;
        self.default_focus = params.focus_position;
        info!("Default focus position: {}", self.default_focus);

        params.start_focus_pos = params.focus_position - 100;
        params.end_focus_pos = params.max_focus_pos - 25;
        params.max_aperture = true;

        self.run_command("in", params)?;
        self.run_command("mo", params)?;
        self.run_command("pa", params)?;
        Ok(())
    }

    pub fn default_focus(&self) -> i32 {
        self.default_focus
    }

    /// Moves to the beginning of the auto-focus range, re-reading the
    /// position before and after to get the deltas right.
    pub fn begin_auto_focus(&mut self, params: &mut CameraParams)
                            -> Result<(), CanonicalError> {
        self.run_command("fp", params)?;
        info!("Auto-focus start {} end {} step {}", params.start_focus_pos,
              params.end_focus_pos, params.focus_step);
        self.run_command(
            &format!("mf {}", params.start_focus_pos - params.focus_position),
            params)?;
        self.run_command("fp", params)?;
        Ok(())
    }

    /// Returns to the heuristic default focus position.
    pub fn default_focus_position(&mut self, params: &mut CameraParams)
                                  -> Result<(), CanonicalError> {
        self.run_command("fp", params)?;
        self.run_command(
            &format!("mf {}", self.default_focus - params.focus_position),
            params)?;
        self.run_command("fp", params)?;
        Ok(())
    }

    /// Shifts focus by `delta` counts and reads back the new position.
    pub fn shift_focus(&mut self, delta: i32, params: &mut CameraParams)
                       -> Result<(), CanonicalError> {
        self.run_command(&format!("mf {}", delta), params)?;
        self.run_command("fp", params)?;
        Ok(())
    }

    /// Executes pending lens mutations from the parameter block: focus to
    /// infinity, focus to a commanded absolute position, aperture to
    /// maximum, or an incremental aperture move. Exposure and gain changes
    /// are camera-side and handled by the caller.
    pub fn adjust_hardware(&mut self, params: &mut CameraParams)
                           -> Result<(), CanonicalError> {
        let mut first_error = None;
        let mut note = |result: Result<String, CanonicalError>| {
            if let Err(e) = result {
                warn!("Lens adjustment failed: {:?}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        if params.focus_inf {
            // Overrides any absolute focus command this round.
            note(self.run_command("mi", params));
            note(self.run_command("fp", params));
        } else {
            let focus_shift = params.focus_position - params.prev_focus_pos;
            if focus_shift != 0 {
                debug!("Focus change to fulfill command: {}", focus_shift);
                note(self.run_command(&format!("mf {}", focus_shift), params));
                note(self.run_command("fp", params));
            }
        }

        if params.max_aperture {
            // We know where fully open lands; no need to query it back.
            params.current_aperture = 14;
            note(self.run_command("mo", params));
        } else if params.aperture_steps != 0 {
            let steps = params.aperture_steps;
            note(self.run_command(&format!("mn{}", steps), params));
            note(self.run_command("pa", params));
            // One-shot: the aperture stays put until the next command.
            params.aperture_steps = 0;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Parses "fmin:<int>  fmax:<int>  current:<int>" out of an "fp" response
/// and updates the focus readbacks; the previous-position field tracks the
/// confirmed position.
fn parse_focus_response(response: &str, params: &mut CameraParams)
                        -> Result<(), CanonicalError> {
    let mut fmin = None;
    let mut fmax = None;
    let mut current = None;
    for token in response.split_whitespace() {
        if let Some(rest) = token.strip_prefix("fmin:") {
            fmin = rest.parse::<i32>().ok();
        } else if let Some(rest) = token.strip_prefix("fmax:") {
            fmax = rest.parse::<i32>().ok();
        } else if let Some(rest) = token.strip_prefix("current:") {
            current = rest.parse::<i32>().ok();
        }
    }
    match (fmin, fmax, current) {
        (Some(fmin), Some(fmax), Some(current)) => {
            params.min_focus_pos = fmin;
            params.max_focus_pos = fmax;
            params.focus_position = current;
            params.prev_focus_pos = current;
            Ok(())
        }
        _ => Err(failed_precondition_error(
            format!("Unparseable focus response {:?}",
                    response.trim()).as_str())),
    }
}

/// Parses "<position>,f<aperture>" out of a "pa" response; tolerates the
/// controller's "DONE" prefix.
fn parse_aperture_response(response: &str, params: &mut CameraParams)
                           -> Result<(), CanonicalError> {
    for line in response.lines() {
        let line = line.trim().trim_start_matches("DONE");
        if let Some((_position, f_part)) = line.split_once(",f") {
            if let Ok(aperture) =
                f_part.split_whitespace().next().unwrap_or("").parse::<i32>()
            {
                params.current_aperture = aperture;
                return Ok(());
            }
        }
    }
    Err(failed_precondition_error(
        format!("Unparseable aperture response {:?}",
                response.trim()).as_str()))
}

// mod tests.
