// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use astro::angle::limit_to_two_PI;
use astro::coords::{alt_frm_eq, az_frm_eq};
use astro::time::{CalType, Date, julian_day, mn_sidr};

use chrono::{Datelike, DateTime, Timelike, Utc};
use std::f64::consts::PI;
use std::time::{Duration, SystemTime};

/// Topocentric place of a target at a site, with refraction disabled (the
/// atmospheric terms of the pointing chain are configured to zero). Angles in
/// radians; azimuth is clockwise from north, hour angle is -PI..PI.
#[derive(Clone, Copy, Debug, Default)]
pub struct ObservedPlace {
    pub alt: f64,
    pub az: f64,
    pub hour_angle: f64,
    pub ra_observed: f64,
    pub dec_observed: f64,
}

/// Converts an ICRS direction to the observed place for a site at `time`.
/// ra, dec, lat, long in radians (longitude east positive). `dut1` is the
/// UT1-UTC offset in seconds, folded into the Earth-rotation argument.
/// Without refraction the observed RA/Dec equal the catalog direction; the
/// horizontal coordinates come from the hour angle at the site.
pub fn observed_from_icrs(ra: f64, dec: f64, lat: f64, long: f64,
                          time: SystemTime, dut1: f64) -> ObservedPlace {
    let ut1 = if dut1 >= 0.0 {
        time + Duration::from_secs_f64(dut1)
    } else {
        time - Duration::from_secs_f64(-dut1)
    };
    let (alt, az, hour_angle) = alt_az_from_equatorial(ra, dec, lat, long, ut1);
    ObservedPlace {
        alt,
        az,
        hour_angle,
        ra_observed: ra,
        dec_observed: dec,
    }
}

/// Returns (alt, az, ha) in radians. Returned azimuth is clockwise from
/// north. Returned hour angle is -PI..PI.
/// ra: right ascension in radians.
/// dec: declination in radians.
/// lat: observer latitude in radians.
/// long: observer longitude in radians.
pub fn alt_az_from_equatorial(ra: f64, dec: f64, lat: f64, long: f64,
                              time: SystemTime) -> (/*alt*/f64, /*az*/f64, /*ha*/f64) {
    let gmst = greenwich_mean_sidereal_time_from_system_time(time);

    // Note that astro::coords::hr_angl_frm_observer_long() has a bug. Fortunately
    // the correct relation is trivial.
    let hour_angle = gmst + long - ra;

    let meeus_az = az_frm_eq(hour_angle, dec, lat);
    let az = limit_to_two_PI(meeus_az + PI);
    let mut ha = limit_to_two_PI(hour_angle);
    if ha > PI {
        ha -= 2.0 * PI;
    }

    (alt_frm_eq(hour_angle, dec, lat), az, ha)
}

/// Returns the parallactic angle, in radians, of a target at hour angle `ha`
/// and declination `dec` for an observer at latitude `lat` (all radians):
/// the angle between celestial north and the local zenith at the target.
/// Zero on the meridian, positive west of it.
pub fn parallactic_angle(ha: f64, dec: f64, lat: f64) -> f64 {
    // Standard relation, e.g. Meeus eq. 14.1.
    let y = ha.sin();
    let x = lat.tan() * dec.cos() - dec.sin() * ha.cos();
    y.atan2(x)
}

fn greenwich_mean_sidereal_time_from_system_time(time: SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(time);
    let date = Date{year: dt_utc.date_naive().year() as i16,
                    month: dt_utc.date_naive().month() as u8,
                    decimal_day: dt_utc.date_naive().day() as f64,
                    cal_type: CalType::Gregorian};
    let jd = julian_day(&date);

    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;

    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use astro::angle::{deg_frm_dms, deg_frm_hms};
    use approx::assert_abs_diff_eq;
    use chrono::{FixedOffset, TimeZone};
    use super::*;

    fn system_time(dt: DateTime<FixedOffset>) -> SystemTime {
        SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs_f64(
            dt.timestamp_millis() as f64 / 1000.0)).unwrap()
    }

    #[test]
    fn test_alt_az_from_equatorial() {
        let mizar_ra = deg_frm_hms(13, 23, 55.5).to_radians();
        let mizar_dec = deg_frm_dms(54, 55, 31.3).to_radians();

        let dt = FixedOffset::west_opt(8 * 3600).unwrap().with_ymd_and_hms(
            2024, 3, 7, 23, 56, 0).unwrap();
        let time = system_time(dt);

        let lat = 37_f64.to_radians();
        let long = -122_f64.to_radians();

        let (alt, az, ha) =
            alt_az_from_equatorial(mizar_ra, mizar_dec, lat, long, time);

        // Expected values obtained from SkySafari.
        assert_abs_diff_eq!(alt,
                            deg_frm_dms(58, 52, 14.3).to_radians(),
                            epsilon = 0.01);
        assert_abs_diff_eq!(az,
                            deg_frm_dms(42, 59, 36.7).to_radians(),
                            epsilon = 0.01);
        assert_abs_diff_eq!(ha,
                            -deg_frm_hms(2, 29, 50.9).to_radians(),
                            epsilon = 0.01);
    }

    #[test]
    fn test_observed_place_matches_alt_az() {
        let ra = 180_f64.to_radians();
        let dec = 20_f64.to_radians();
        let lat = 32.233315_f64.to_radians();
        let long = -110.948556_f64.to_radians();
        let dt = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(
            2024, 6, 1, 8, 0, 0).unwrap();
        let time = system_time(dt);

        let observed = observed_from_icrs(ra, dec, lat, long, time, -0.23);
        // Observed RA/Dec are the catalog direction with refraction off.
        assert_eq!(observed.ra_observed, ra);
        assert_eq!(observed.dec_observed, dec);
        assert!(observed.alt > -PI / 2.0 && observed.alt < PI / 2.0);
        assert!(observed.az >= 0.0 && observed.az < 2.0 * PI);
        assert!(observed.hour_angle >= -PI && observed.hour_angle <= PI);
    }

    #[test]
    fn test_parallactic_angle_zero_on_meridian() {
        let lat = 32_f64.to_radians();
        let dec = 10_f64.to_radians();
        assert_abs_diff_eq!(parallactic_angle(0.0, dec, lat), 0.0,
                            epsilon = 1e-12);
        // West of the meridian the angle is positive for a target south of
        // the zenith.
        assert!(parallactic_angle(0.5, dec, lat) > 0.0);
        // And antisymmetric in hour angle.
        assert_abs_diff_eq!(parallactic_angle(-0.5, dec, lat),
                            -parallactic_angle(0.5, dec, lat),
                            epsilon = 1e-12);
    }
}  // mod tests.
