// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cmp::max;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use interval_elements::ephemeris_trait::SunMoonTimes;

// When the computed schedule is unusable the session starts this long after
// "now" instead.
pub const IMMEDIATE_START_GRACE: Duration = Duration::from_secs(30);

/// Absolute start and end times of a night's phases.
///
/// evening_start .. evening_twilight_end    evening twilight
/// evening_twilight_end .. night_end        night
/// night_end .. morning_end                 morning twilight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBoundaries {
    pub evening_start: DateTime<Local>,
    pub evening_twilight_end: DateTime<Local>,
    pub night_end: DateTime<Local>,
    pub morning_end: DateTime<Local>,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

impl PhaseBoundaries {
    /// Derives the boundaries from sun times. The leeway moves the evening
    /// start later and the morning end earlier; each twilight window is
    /// `twilight_margin` long.
    pub fn from_sun_times(times: &SunMoonTimes,
                          leeway: chrono::Duration,
                          twilight_margin: chrono::Duration) -> Self {
        let evening_start = times.sunset + leeway;
        let morning_end = times.sunrise - leeway;
        PhaseBoundaries{
            evening_start,
            evening_twilight_end: evening_start + twilight_margin,
            night_end: morning_end - twilight_margin,
            morning_end,
        }
    }

    /// Test-mode schedule: starts `start_delay` after `now`, runs a night of
    /// `night_length`, and has zero-width twilight windows.
    pub fn for_test(now: DateTime<Local>, start_delay: Duration,
                    night_length: Duration) -> Self {
        let evening_start = now + chrono_duration(start_delay);
        let morning_end = evening_start + chrono_duration(night_length);
        PhaseBoundaries{
            evening_start,
            evening_twilight_end: evening_start,
            night_end: morning_end,
            morning_end,
        }
    }

    /// True if acquisition can begin before the night ends. A false value
    /// comes from a missed sunset, a bad position or a skewed clock.
    pub fn is_schedulable(&self) -> bool {
        self.evening_start < self.night_end
    }

    /// True if the four boundaries never run backwards.
    pub fn is_ordered(&self) -> bool {
        self.evening_start <= self.evening_twilight_end &&
            self.evening_twilight_end <= self.night_end &&
            self.night_end <= self.morning_end
    }

    /// Replacement for an unschedulable result: the evening starts `grace`
    /// after `now` with no evening twilight, and the remaining boundaries
    /// are kept where they still lie ahead of the new start.
    pub fn with_immediate_start(&self, now: DateTime<Local>, grace: Duration)
                                -> Self {
        let evening_start = now + chrono_duration(grace);
        let night_end = max(self.night_end, evening_start);
        PhaseBoundaries{
            evening_start,
            evening_twilight_end: evening_start,
            night_end,
            morning_end: max(self.morning_end, night_end),
        }
    }

    /// Moves any boundary that lies before `now` up to `now`. Applied after a
    /// recompute so that no phase lands retroactively in the past.
    pub fn not_before(&self, now: DateTime<Local>) -> Self {
        PhaseBoundaries{
            evening_start: max(self.evening_start, now),
            evening_twilight_end: max(self.evening_twilight_end, now),
            night_end: max(self.night_end, now),
            morning_end: max(self.morning_end, now),
        }
    }

    /// Seconds from `now` until `end`, clamped at zero.
    pub fn seconds_until(now: DateTime<Local>, end: DateTime<Local>) -> u64 {
        (end - now).num_seconds().max(0) as u64
    }

    pub fn log(&self, now: DateTime<Local>) {
        info!("sunset, {}", self.evening_start.to_rfc3339());
        info!("sunset_after_twilight, {}", self.evening_twilight_end.to_rfc3339());
        info!("sunrise_before_twilight, {}", self.night_end.to_rfc3339());
        info!("sunrise, {}", self.morning_end.to_rfc3339());
        info!("now, {}", now.to_rfc3339());
        info!("UTCnow, {}", now.naive_utc());
        info!("timezone, {}", now.offset());
        debug!("recalc_sunrise, {}, {}",
               self.morning_end.timestamp(), self.morning_end);
    }
}

/// Computes the phase boundaries for one night, falling back to an
/// immediate start when the raw schedule cannot be used. Returns the
/// boundaries and whether the fallback was taken.
pub fn schedule_night(times: &SunMoonTimes,
                      now: DateTime<Local>,
                      leeway: chrono::Duration,
                      twilight_margin: chrono::Duration,
                      grace: Duration) -> (PhaseBoundaries, bool) {
    let boundaries = PhaseBoundaries::from_sun_times(times, leeway, twilight_margin);
    if boundaries.is_schedulable() && boundaries.is_ordered() {
        return (boundaries, false);
    }
    warn!("late_start-forcing_immediate, {}, {}",
          boundaries.evening_start.to_rfc3339(), boundaries.night_end.to_rfc3339());
    (boundaries.with_immediate_start(now, grace), true)
}

// mod tests.
