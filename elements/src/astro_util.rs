// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use astro::time::{CalType, Date, julian_day};
use canonical_error::{CanonicalError, internal_error, not_found_error};
use chrono::{DateTime, Datelike, Local, Timelike, Utc};

use crate::ephemeris_trait::{EphemerisTrait, SunMoonTimes};
use crate::hardware_trait::Location;

const J2000: f64 = 2451545.0;
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;
const SECONDS_PER_DAY: f64 = 86400.0;

// Apparent altitude of the sun's centre at rise/set: refraction plus the
// solar semi-diameter.
const SUN_HORIZON_ALTITUDE_DEG: f64 = -0.833;
const OBLIQUITY_DEG: f64 = 23.4397;

/// Julian day of the given instant.
pub fn julian_day_from_datetime(time: &DateTime<Utc>) -> f64 {
    let seconds_into_day = time.num_seconds_from_midnight() as f64 +
        time.nanosecond() as f64 / 1.0e9;
    let date = Date{year: time.year() as i16,
                    month: time.month() as u8,
                    decimal_day: time.day() as f64 + seconds_into_day / SECONDS_PER_DAY,
                    cal_type: CalType::Gregorian};
    julian_day(&date)
}

/// Inverse of julian_day_from_datetime(), to millisecond resolution.
pub fn datetime_from_julian_day(jd: f64) -> Option<DateTime<Utc>> {
    let unix_millis = ((jd - UNIX_EPOCH_JULIAN_DAY) * SECONDS_PER_DAY * 1000.0).round();
    DateTime::from_timestamp_millis(unix_millis as i64)
}

/// Returns (rise, set) as Julian days for the solar cycle `n` (whole days
/// since the J2000 epoch), using the sunrise equation with an observer
/// altitude correction.
/// lon: degrees east
/// lat: degrees north
/// altitude: metres above sea level
/// Returns None if the sun stays above or below the horizon all cycle.
pub fn sun_rise_set_for_cycle(n: f64, lon: f64, lat: f64, altitude: f64)
                              -> Option<(f64, f64)> {
    let mean_solar_noon = n - lon / 360.0;
    let mean_anomaly = (357.5291 + 0.98560028 * mean_solar_noon).rem_euclid(360.0);
    let m = mean_anomaly.to_radians();
    let center = 1.9148 * m.sin() + 0.0200 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin();
    let ecliptic_lon = (mean_anomaly + center + 180.0 + 102.9372)
        .rem_euclid(360.0).to_radians();
    let transit = J2000 + mean_solar_noon + 0.0053 * m.sin() -
        0.0069 * (2.0 * ecliptic_lon).sin();

    let sin_dec = ecliptic_lon.sin() * OBLIQUITY_DEG.to_radians().sin();
    let cos_dec = (1.0 - sin_dec * sin_dec).sqrt();

    // An elevated observer sees the sun earlier and later.
    let dip = -2.076 * altitude.max(0.0).sqrt() / 60.0;
    let horizon = (SUN_HORIZON_ALTITUDE_DEG + dip).to_radians();

    let lat = lat.to_radians();
    let cos_hour_angle = (horizon.sin() - lat.sin() * sin_dec) / (lat.cos() * cos_dec);
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let half_day = cos_hour_angle.acos().to_degrees() / 360.0;
    Some((transit - half_day, transit + half_day))
}

/// Returns (next sunrise, next sunset) strictly after `now`.
pub fn next_sunrise_sunset(location: &Location, now: &DateTime<Utc>)
                           -> Result<(DateTime<Utc>, DateTime<Utc>), CanonicalError> {
    let jd_now = julian_day_from_datetime(now);
    let cycle = (jd_now - J2000).floor();

    let mut next_rise: Option<f64> = None;
    let mut next_set: Option<f64> = None;
    for n in [cycle - 1.0, cycle, cycle + 1.0, cycle + 2.0] {
        let Some((rise, set)) = sun_rise_set_for_cycle(
            n, location.lon, location.lat, location.altitude) else {
            continue;
        };
        if rise > jd_now && next_rise.map_or(true, |r| rise < r) {
            next_rise = Some(rise);
        }
        if set > jd_now && next_set.map_or(true, |s| set < s) {
            next_set = Some(set);
        }
    }
    match (next_rise, next_set) {
        (Some(rise), Some(set)) => {
            let rise = datetime_from_julian_day(rise).ok_or_else(
                || internal_error("sunrise out of range"))?;
            let set = datetime_from_julian_day(set).ok_or_else(
                || internal_error("sunset out of range"))?;
            Ok((rise, set))
        },
        _ => Err(not_found_error(
            format!("Sun does not rise or set at lat {} lon {}",
                    location.lat, location.lon).as_str())),
    }
}

// Sun-only ephemeris; moon times are not computed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SolarEphemeris;

impl EphemerisTrait for SolarEphemeris {
    fn compute(&self, location: &Location, now: DateTime<Local>)
               -> Result<SunMoonTimes, CanonicalError> {
        let (sunrise, sunset) =
            next_sunrise_sunset(location, &now.with_timezone(&Utc))?;
        Ok(SunMoonTimes{
            sunrise: sunrise.with_timezone(&Local),
            sunset: sunset.with_timezone(&Local),
            moonrise: None,
            moonset: None,
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone};
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn assert_near(actual: DateTime<Utc>, expected: DateTime<Utc>, minutes: i64) {
        let diff = (actual - expected).num_seconds().abs();
        assert!(diff <= minutes * 60, "{} vs {}", actual, expected);
    }

    #[test]
    fn test_julian_day_round_trip() {
        let t = utc(2024, 3, 20, 12, 0);
        let jd = julian_day_from_datetime(&t);
        assert_abs_diff_eq!(jd, 2460390.0, epsilon = 1e-6);
        assert_eq!(datetime_from_julian_day(jd).unwrap(), t);
    }

    #[test]
    fn test_equator_equinox() {
        let location = Location{lon: 0.0, lat: 0.0, altitude: 0.0};
        let (rise, set) = next_sunrise_sunset(&location, &utc(2024, 3, 20, 0, 0))
            .unwrap();
        assert_near(rise, utc(2024, 3, 20, 6, 4), 5);
        assert_near(set, utc(2024, 3, 20, 18, 11), 5);
    }

    #[test]
    fn test_perth_winter_solstice() {
        // Local time is UTC+8: sunrise about 07:16, sunset about 17:20.
        let location = Location{lon: 115.86, lat: -31.95, altitude: 0.0};
        let (rise, set) = next_sunrise_sunset(&location, &utc(2024, 6, 20, 12, 0))
            .unwrap();
        assert_near(rise, utc(2024, 6, 20, 23, 16), 10);
        assert_near(set, utc(2024, 6, 21, 9, 20), 10);
    }

    #[test]
    fn test_next_events_are_after_now() {
        let location = Location{lon: 115.86, lat: -31.95, altitude: 300.0};
        // Mid-night local time: next sunset is tomorrow, so it comes after
        // the next sunrise.
        let now = utc(2024, 6, 20, 16, 0);
        let (rise, set) = next_sunrise_sunset(&location, &now).unwrap();
        assert!(rise > now);
        assert!(set > now);
        assert!(set > rise);
        assert!(rise - now < Duration::hours(24));
        assert!(set - now < Duration::hours(24));
    }

    #[test]
    fn test_altitude_lengthens_day() {
        let day_length = |altitude: f64| {
            let (rise, set) =
                sun_rise_set_for_cycle(8938.0, 115.86, -31.95, altitude).unwrap();
            set - rise
        };
        assert!(day_length(2000.0) > day_length(0.0));
    }

    #[test]
    fn test_polar_night() {
        let location = Location{lon: 0.0, lat: 80.0, altitude: 0.0};
        let result = next_sunrise_sunset(&location, &utc(2023, 12, 21, 0, 0));
        assert!(result.is_err());
    }

    #[test]
    fn test_solar_ephemeris_local_times() {
        let location = Location{lon: 0.0, lat: 0.0, altitude: 0.0};
        let now = utc(2024, 3, 20, 0, 0).with_timezone(&Local);
        let times = SolarEphemeris.compute(&location, now).unwrap();
        assert!(times.sunrise > now);
        assert!(times.sunset > times.sunrise);
        assert!(times.moonrise.is_none());
    }

}  // mod tests.
