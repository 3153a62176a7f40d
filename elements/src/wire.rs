// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Fixed-size little-endian datagram codecs for the flight-computer links.
//! Field order and widths mirror the packed structures the flight software
//! sends and expects; a datagram of any other size is rejected outright.

use canonical_error::{invalid_argument_error, CanonicalError};

pub const COMMAND_PACKET_SIZE: usize = 284;
pub const TRIGGER_PACKET_SIZE: usize = 28;
pub const ASTROMETRY_PACKET_SIZE: usize = 100;
pub const PARAMETER_PACKET_SIZE: usize = 156;

/// Per-field command packet from a flight computer. Every tunable comes as a
/// (value, update flag) pair; only fields whose flag is set are applied, and
/// nothing is applied unless `in_charge` is 1.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandPacket {
    pub fc: i32,
    pub target: [u8; 16],
    pub in_charge: i32,

    pub log_odds: f64,
    pub update_log_odds: i32,
    pub latitude: f64,
    pub update_latitude: i32,
    pub longitude: f64,
    pub update_longitude: i32,
    pub height_wgs84: f64,
    pub update_height: i32,
    pub exposure_time_ms: f64,
    pub update_exposure_time: i32,
    pub gain_fact: f64,
    pub update_gain_fact: i32,
    pub solve_time_limit: f64,
    pub update_solve_time_limit: i32,

    pub focus_pos: f32,
    pub update_focus_pos: i32,
    pub focus_mode: i32,
    pub update_focus_mode: i32,
    pub start_pos: i32,
    pub update_start_pos: i32,
    pub end_pos: i32,
    pub update_end_pos: i32,
    pub focus_step: i32,
    pub update_focus_step: i32,
    pub photos_per_step: i32,
    pub update_photos_per_step: i32,
    pub set_focus_inf: i32,
    pub update_set_focus_inf: i32,
    pub aperture_steps: i32,
    pub update_aperture_steps: i32,
    pub max_aperture: i32,
    pub update_max_aperture: i32,
    pub make_hp: i32,
    pub update_make_hp: i32,
    pub use_hp: i32,
    pub update_use_hp: i32,

    // Blob parameters, indexed as: 0 spike limit, 1 dynamic hot pixels,
    // 2 smoothing radius, 3 high pass on/off, 4 high pass radius,
    // 5 centroid search border, 6 filter return image, 7 n sigma,
    // 8 unique star spacing.
    pub blob_params: [f32; 9],
    pub update_blob_params: [i32; 9],

    pub update_trigger_mode: i32,
    pub trigger_mode: i32,
    pub update_trigger_timeout_us: i32,
    pub trigger_timeout_us: i32,
}

/// Software trigger packet: tells the pipeline to take an image when
/// trigger_mode is 1.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerPacket {
    pub fc: i32,
    pub target: [u8; 16],
    pub in_charge: i32,
    pub trigger: i32,
}

/// Astrometry solution telemetry. Angles in degrees, RMS in arcseconds,
/// times in seconds since the UNIX epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AstrometryPacket {
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    pub ra_observed: f64,
    pub dec_observed: f64,
    pub rawtime: f64,
    pub image_rms: f64,
    pub fr: f64,
    pub ps: f64,
    pub ir: f64,
    pub alt: f64,
    pub az: f64,
    pub photo_time: f64,
    pub num_blobs_found: u32,
}

/// Parameter echo telemetry: every tunable plus lens readbacks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterPacket {
    pub log_odds: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub height_wgs84: f64,
    pub exposure_time_ms: f64,
    pub gain_fact: f64,
    pub solve_time_limit: f64,
    pub focus_pos: f32,
    pub min_focus_pos: i32,
    pub max_focus_pos: i32,
    pub focus_mode: i32,
    pub start_pos: i32,
    pub end_pos: i32,
    pub focus_step: i32,
    pub photos_per_step: i32,
    pub set_focus_inf: i32,
    pub aperture_steps: i32,
    pub max_aperture: i32,
    pub aperture: f32,
    pub make_hp: i32,
    pub use_hp: i32,
    pub blob_params: [f32; 9],
    pub trigger_mode: i32,
    pub trigger_timeout_us: i32,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn i32(&mut self) -> i32 {
        let v = i32::from_le_bytes(
            self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(
            self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn f32(&mut self) -> f32 {
        let v = f32::from_le_bytes(
            self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn f64(&mut self) -> f64 {
        let v = f64::from_le_bytes(
            self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }

    fn bytes16(&mut self) -> [u8; 16] {
        let v: [u8; 16] =
            self.buf[self.pos..self.pos + 16].try_into().unwrap();
        self.pos += 16;
        v
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Writer { buf: Vec::with_capacity(capacity) }
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes16(&mut self, v: &[u8; 16]) {
        self.buf.extend_from_slice(v);
    }
}

fn check_size(buf: &[u8], expected: usize, what: &str)
              -> Result<(), CanonicalError> {
    if buf.len() != expected {
        return Err(invalid_argument_error(
            format!("{} datagram is {} bytes, expected {}",
                    what, buf.len(), expected).as_str()));
    }
    Ok(())
}

impl CommandPacket {
    pub fn decode(buf: &[u8]) -> Result<CommandPacket, CanonicalError> {
        check_size(buf, COMMAND_PACKET_SIZE, "command")?;
        let mut r = Reader::new(buf);
        let mut packet = CommandPacket {
            fc: r.i32(),
            target: r.bytes16(),
            in_charge: r.i32(),
            log_odds: r.f64(),
            update_log_odds: r.i32(),
            latitude: r.f64(),
            update_latitude: r.i32(),
            longitude: r.f64(),
            update_longitude: r.i32(),
            height_wgs84: r.f64(),
            update_height: r.i32(),
            exposure_time_ms: r.f64(),
            update_exposure_time: r.i32(),
            gain_fact: r.f64(),
            update_gain_fact: r.i32(),
            solve_time_limit: r.f64(),
            update_solve_time_limit: r.i32(),
            focus_pos: r.f32(),
            update_focus_pos: r.i32(),
            focus_mode: r.i32(),
            update_focus_mode: r.i32(),
            start_pos: r.i32(),
            update_start_pos: r.i32(),
            end_pos: r.i32(),
            update_end_pos: r.i32(),
            focus_step: r.i32(),
            update_focus_step: r.i32(),
            photos_per_step: r.i32(),
            update_photos_per_step: r.i32(),
            set_focus_inf: r.i32(),
            update_set_focus_inf: r.i32(),
            aperture_steps: r.i32(),
            update_aperture_steps: r.i32(),
            max_aperture: r.i32(),
            update_max_aperture: r.i32(),
            make_hp: r.i32(),
            update_make_hp: r.i32(),
            use_hp: r.i32(),
            update_use_hp: r.i32(),
            ..Default::default()
        };
        for i in 0..9 {
            packet.blob_params[i] = r.f32();
        }
        for i in 0..9 {
            packet.update_blob_params[i] = r.i32();
        }
        packet.update_trigger_mode = r.i32();
        packet.trigger_mode = r.i32();
        packet.update_trigger_timeout_us = r.i32();
        packet.trigger_timeout_us = r.i32();
        Ok(packet)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(COMMAND_PACKET_SIZE);
        w.i32(self.fc);
        w.bytes16(&self.target);
        w.i32(self.in_charge);
        w.f64(self.log_odds);
        w.i32(self.update_log_odds);
        w.f64(self.latitude);
        w.i32(self.update_latitude);
        w.f64(self.longitude);
        w.i32(self.update_longitude);
        w.f64(self.height_wgs84);
        w.i32(self.update_height);
        w.f64(self.exposure_time_ms);
        w.i32(self.update_exposure_time);
        w.f64(self.gain_fact);
        w.i32(self.update_gain_fact);
        w.f64(self.solve_time_limit);
        w.i32(self.update_solve_time_limit);
        w.f32(self.focus_pos);
        w.i32(self.update_focus_pos);
        w.i32(self.focus_mode);
        w.i32(self.update_focus_mode);
        w.i32(self.start_pos);
        w.i32(self.update_start_pos);
        w.i32(self.end_pos);
        w.i32(self.update_end_pos);
        w.i32(self.focus_step);
        w.i32(self.update_focus_step);
        w.i32(self.photos_per_step);
        w.i32(self.update_photos_per_step);
        w.i32(self.set_focus_inf);
        w.i32(self.update_set_focus_inf);
        w.i32(self.aperture_steps);
        w.i32(self.update_aperture_steps);
        w.i32(self.max_aperture);
        w.i32(self.update_max_aperture);
        w.i32(self.make_hp);
        w.i32(self.update_make_hp);
        w.i32(self.use_hp);
        w.i32(self.update_use_hp);
        for value in self.blob_params {
            w.f32(value);
        }
        for flag in self.update_blob_params {
            w.i32(flag);
        }
        w.i32(self.update_trigger_mode);
        w.i32(self.trigger_mode);
        w.i32(self.update_trigger_timeout_us);
        w.i32(self.trigger_timeout_us);
        w.buf
    }
}

impl TriggerPacket {
    pub fn decode(buf: &[u8]) -> Result<TriggerPacket, CanonicalError> {
        check_size(buf, TRIGGER_PACKET_SIZE, "trigger")?;
        let mut r = Reader::new(buf);
        Ok(TriggerPacket {
            fc: r.i32(),
            target: r.bytes16(),
            in_charge: r.i32(),
            trigger: r.i32(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(TRIGGER_PACKET_SIZE);
        w.i32(self.fc);
        w.bytes16(&self.target);
        w.i32(self.in_charge);
        w.i32(self.trigger);
        w.buf
    }
}

impl AstrometryPacket {
    pub fn decode(buf: &[u8]) -> Result<AstrometryPacket, CanonicalError> {
        check_size(buf, ASTROMETRY_PACKET_SIZE, "astrometry")?;
        let mut r = Reader::new(buf);
        Ok(AstrometryPacket {
            ra_j2000: r.f64(),
            dec_j2000: r.f64(),
            ra_observed: r.f64(),
            dec_observed: r.f64(),
            rawtime: r.f64(),
            image_rms: r.f64(),
            fr: r.f64(),
            ps: r.f64(),
            ir: r.f64(),
            alt: r.f64(),
            az: r.f64(),
            photo_time: r.f64(),
            num_blobs_found: r.u32(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(ASTROMETRY_PACKET_SIZE);
        w.f64(self.ra_j2000);
        w.f64(self.dec_j2000);
        w.f64(self.ra_observed);
        w.f64(self.dec_observed);
        w.f64(self.rawtime);
        w.f64(self.image_rms);
        w.f64(self.fr);
        w.f64(self.ps);
        w.f64(self.ir);
        w.f64(self.alt);
        w.f64(self.az);
        w.f64(self.photo_time);
        w.u32(self.num_blobs_found);
        w.buf
    }
}

impl ParameterPacket {
    pub fn decode(buf: &[u8]) -> Result<ParameterPacket, CanonicalError> {
        check_size(buf, PARAMETER_PACKET_SIZE, "parameter")?;
        let mut r = Reader::new(buf);
        let mut packet = ParameterPacket {
            log_odds: r.f64(),
            latitude: r.f64(),
            longitude: r.f64(),
            height_wgs84: r.f64(),
            exposure_time_ms: r.f64(),
            gain_fact: r.f64(),
            solve_time_limit: r.f64(),
            focus_pos: r.f32(),
            min_focus_pos: r.i32(),
            max_focus_pos: r.i32(),
            focus_mode: r.i32(),
            start_pos: r.i32(),
            end_pos: r.i32(),
            focus_step: r.i32(),
            photos_per_step: r.i32(),
            set_focus_inf: r.i32(),
            aperture_steps: r.i32(),
            max_aperture: r.i32(),
            aperture: r.f32(),
            make_hp: r.i32(),
            use_hp: r.i32(),
            ..Default::default()
        };
        for i in 0..9 {
            packet.blob_params[i] = r.f32();
        }
        packet.trigger_mode = r.i32();
        packet.trigger_timeout_us = r.i32();
        Ok(packet)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(PARAMETER_PACKET_SIZE);
        w.f64(self.log_odds);
        w.f64(self.latitude);
        w.f64(self.longitude);
        w.f64(self.height_wgs84);
        w.f64(self.exposure_time_ms);
        w.f64(self.gain_fact);
        w.f64(self.solve_time_limit);
        w.f32(self.focus_pos);
        w.i32(self.min_focus_pos);
        w.i32(self.max_focus_pos);
        w.i32(self.focus_mode);
        w.i32(self.start_pos);
        w.i32(self.end_pos);
        w.i32(self.focus_step);
        w.i32(self.photos_per_step);
        w.i32(self.set_focus_inf);
        w.i32(self.aperture_steps);
        w.i32(self.max_aperture);
        w.f32(self.aperture);
        w.i32(self.make_hp);
        w.i32(self.use_hp);
        for value in self.blob_params {
            w.f32(value);
        }
        w.i32(self.trigger_mode);
        w.i32(self.trigger_timeout_us);
        w.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packet_round_trip() {
        let mut packet = CommandPacket {
            fc: 1,
            in_charge: 1,
            log_odds: 1e8,
            update_log_odds: 1,
            latitude: 32.2,
            longitude: -110.9,
            update_longitude: 1,
            exposure_time_ms: 250.0,
            update_exposure_time: 1,
            focus_pos: 1234.0,
            update_focus_pos: 1,
            focus_mode: 1,
            update_focus_mode: 1,
            trigger_mode: 1,
            update_trigger_mode: 1,
            trigger_timeout_us: 200,
            ..Default::default()
        };
        packet.target[..9].copy_from_slice(b"192.0.2.1");
        packet.blob_params[7] = 8.5;
        packet.update_blob_params[7] = 1;

        let encoded = packet.encode();
        assert_eq!(encoded.len(), COMMAND_PACKET_SIZE);
        let decoded = CommandPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_command_packet_field_offsets() {
        // Pin the wire layout: the flight software counts on these offsets.
        let packet = CommandPacket {
            in_charge: 1,
            log_odds: 2.5,
            update_log_odds: 1,
            trigger_timeout_us: 0x01020304,
            ..Default::default()
        };
        let encoded = packet.encode();
        // fc(4) + target(16) precede in_charge.
        assert_eq!(&encoded[20..24], &1_i32.to_le_bytes());
        assert_eq!(&encoded[24..32], &2.5_f64.to_le_bytes());
        assert_eq!(&encoded[32..36], &1_i32.to_le_bytes());
        // trigger_timeout_us is the last field.
        assert_eq!(&encoded[280..284], &0x01020304_i32.to_le_bytes());
    }

    #[test]
    fn test_astrometry_packet_blob_count_offset() {
        let packet = AstrometryPacket {
            num_blobs_found: 0xabcd,
            ..Default::default()
        };
        let encoded = packet.encode();
        // Twelve f64 fields precede the count.
        assert_eq!(&encoded[96..100], &0xabcd_u32.to_le_bytes());
    }

    #[test]
    fn test_command_packet_rejects_wrong_size() {
        let buf = vec![0_u8; COMMAND_PACKET_SIZE - 1];
        assert!(CommandPacket::decode(&buf).is_err());
        let buf = vec![0_u8; COMMAND_PACKET_SIZE + 1];
        assert!(CommandPacket::decode(&buf).is_err());
    }

    #[test]
    fn test_trigger_packet_round_trip() {
        let packet = TriggerPacket {
            fc: 2, target: [0; 16], in_charge: 1, trigger: 1,
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), TRIGGER_PACKET_SIZE);
        assert_eq!(TriggerPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_astrometry_packet_round_trip() {
        let packet = AstrometryPacket {
            ra_j2000: 180.5,
            dec_j2000: -30.25,
            ra_observed: 180.6,
            dec_observed: -30.20,
            rawtime: 1.7e9,
            image_rms: 2.5,
            fr: 12.0,
            ps: 6.3,
            ir: -4.0,
            alt: 55.0,
            az: 123.0,
            photo_time: 1.7e9 + 0.25,
            num_blobs_found: 42,
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), ASTROMETRY_PACKET_SIZE);
        assert_eq!(AstrometryPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_parameter_packet_round_trip() {
        let packet = ParameterPacket {
            log_odds: 1e8,
            latitude: 32.2,
            longitude: -110.9,
            height_wgs84: 753.8,
            exposure_time_ms: 100.0,
            gain_fact: 2.0,
            solve_time_limit: 5.0,
            focus_pos: 900.0,
            min_focus_pos: -300,
            max_focus_pos: 2200,
            focus_mode: 0,
            start_pos: 800,
            end_pos: 2175,
            focus_step: 5,
            photos_per_step: 3,
            set_focus_inf: 0,
            aperture_steps: 0,
            max_aperture: 1,
            aperture: 14.0,
            make_hp: 0,
            use_hp: 1,
            blob_params: [3.0, 1.0, 1.0, 1.0, 10.0, 1.0, 0.0, 10.0, 15.0],
            trigger_mode: 0,
            trigger_timeout_us: 100,
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), PARAMETER_PACKET_SIZE);
        assert_eq!(ParameterPacket::decode(&encoded).unwrap(), packet);
    }
}  // mod tests.
