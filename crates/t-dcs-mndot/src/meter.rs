//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Ramp meter rate conversion and timing tables."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use t_dcs_common::config::{MeterTimingConfig, MeterType};
use t_dcs_core::Result;

use crate::bcd;

/// Metering rate codes stored in the controller timing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MeterRateCode {
    Flash = 0,
    TimeOfDay = 1,
    Central = 2,
    ForcedFlash = 3,
}

impl MeterRateCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MeterRateCode::Flash),
            1 => Some(MeterRateCode::TimeOfDay),
            2 => Some(MeterRateCode::Central),
            3 => Some(MeterRateCode::ForcedFlash),
            _ => None,
        }
    }

    /// Whether this code means the meter is actively cycling.
    pub fn is_metering(&self) -> bool {
        matches!(self, MeterRateCode::TimeOfDay | MeterRateCode::Central)
    }
}

/// Seconds in one hour; release rates are vehicles per hour.
const HOUR_SECS: f32 = 3600.0;

/// Red time (seconds) for a release rate.
///
/// One release cycle is red + yellow + green; a SINGLE-release meter serves
/// one vehicle per cycle where a dual meter serves two, so its
/// seconds-per-vehicle is halved. Red never drops below the configured
/// minimum.
pub fn red_time_from_rate(timing: &MeterTimingConfig, meter_type: MeterType, rate: u32) -> f32 {
    let mut secs_per_veh = HOUR_SECS / rate as f32;
    if meter_type == MeterType::Single {
        secs_per_veh /= 2.0;
    }
    let red = secs_per_veh - (timing.green_secs + timing.yellow_secs);
    red.max(timing.min_red_secs)
}

/// Release rate (vehicles per hour) for a red time, rounded half-up.
pub fn rate_from_red_time(timing: &MeterTimingConfig, meter_type: MeterType, red_secs: f32) -> u32 {
    let mut secs_per_veh = red_secs + timing.yellow_secs + timing.green_secs;
    if meter_type == MeterType::Single {
        secs_per_veh *= 2.0;
    }
    (HOUR_SECS / secs_per_veh).round() as u32
}

/// Red time in tenths of a second, rounded half-up, as stored on the wire.
pub fn red_tenths(red_secs: f32) -> u32 {
    (red_secs * 10.0).round() as u32
}

/// Startup interval constants (tenths of a second).
const STARTUP_GREEN: u32 = 80;
const STARTUP_YELLOW: u32 = 50;
/// HOV preempt time (obsolete, still part of the table layout).
const HOV_PREEMPT: u32 = 80;

/// Default AM/PM table boundaries (BCD minute-of-day).
const AM_MID_TIME: u32 = 730;
const PM_MID_TIME: u32 = 1630;

/// Metering windows programmed when a meter has target rates.
const AM_START_MIN: u32 = 6 * 60 + 30;
const AM_STOP_MIN: u32 = 9 * 60;
const PM_START_MIN: u32 = 15 * 60;
const PM_STOP_MIN: u32 = 18 * 60;

/// Convert minute-of-day (0-1440) to the table's 4-digit BCD form.
pub fn minute_bcd(minute: u32) -> u32 {
    100 * (minute / 60) + minute % 60
}

const AM: usize = 0;
const PM: usize = 1;

/// Per-meter timing table: red times, rate codes, and start/stop times for
/// the AM and PM halves.
#[derive(Debug, Clone)]
pub struct TimingTable {
    red_tenths: [u32; 2],
    rate: [MeterRateCode; 2],
    start: [u32; 2],
    stop: [u32; 2],
}

impl TimingTable {
    /// A table that keeps the meter in flash all day.
    pub fn flash() -> Self {
        Self {
            red_tenths: [1, 1],
            rate: [MeterRateCode::Flash, MeterRateCode::Flash],
            start: [AM_MID_TIME, PM_MID_TIME],
            stop: [AM_MID_TIME, PM_MID_TIME],
        }
    }

    /// A table metering both peaks from the meter's target rates.
    pub fn for_targets(
        timing: &MeterTimingConfig,
        meter_type: MeterType,
        am_target: u32,
        pm_target: u32,
    ) -> Self {
        let mut table = Self::flash();
        for (period, target, start, stop) in [
            (AM, am_target, AM_START_MIN, AM_STOP_MIN),
            (PM, pm_target, PM_START_MIN, PM_STOP_MIN),
        ] {
            let red = red_time_from_rate(timing, meter_type, target);
            table.red_tenths[period] = red_tenths(red);
            table.rate[period] = MeterRateCode::TimeOfDay;
            table.start[period] = minute_bcd(start);
            table.stop[period] = minute_bcd(stop);
        }
        table
    }

    /// The table programmed for warning signs: flash-only with unit times.
    pub fn warning_sign() -> Self {
        Self {
            red_tenths: [1, 1],
            rate: [MeterRateCode::Flash, MeterRateCode::Flash],
            start: [AM_MID_TIME, PM_MID_TIME],
            stop: [AM_MID_TIME, PM_MID_TIME],
        }
    }

    /// Encode the full 54-byte BCD table, AM half then PM half.
    pub fn encode(&self, timing: &MeterTimingConfig) -> Result<Vec<u8>> {
        let green = (timing.green_secs * 10.0).round() as u32;
        let yellow = (timing.yellow_secs * 10.0).round() as u32;
        let mut table = Vec::with_capacity(54);
        for period in [AM, PM] {
            for value in [STARTUP_GREEN, STARTUP_YELLOW, green, yellow, HOV_PREEMPT] {
                table.extend_from_slice(&bcd::bcd4_encode(value)?);
            }
            for _ in 0..6 {
                table.extend_from_slice(&bcd::bcd4_encode(self.red_tenths[period])?);
            }
            table.push(bcd::bcd2_encode(self.rate[period] as u32)?);
            table.extend_from_slice(&bcd::bcd4_encode(self.start[period])?);
            table.extend_from_slice(&bcd::bcd4_encode(self.stop[period])?);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> MeterTimingConfig {
        MeterTimingConfig {
            green_secs: 1.3,
            yellow_secs: 0.7,
            min_red_secs: 0.1,
        }
    }

    #[test]
    fn rate_and_red_time_are_inverse_within_one_vehicle() {
        let timing = timing();
        for meter_type in [MeterType::Single, MeterType::Dual] {
            for rate in (240..=2000).step_by(20) {
                let red = red_time_from_rate(&timing, meter_type, rate);
                let recovered = rate_from_red_time(&timing, meter_type, red);
                assert!(
                    recovered.abs_diff(rate) <= 1,
                    "{:?} rate {} -> red {} -> {}",
                    meter_type,
                    rate,
                    red,
                    recovered
                );
            }
        }
    }

    #[test]
    fn single_release_meters_halve_the_cycle() {
        let timing = timing();
        let dual = red_time_from_rate(&timing, MeterType::Dual, 900);
        let single = red_time_from_rate(&timing, MeterType::Single, 900);
        assert!(single < dual);
        assert!((dual - (3600.0 / 900.0 - 2.0)).abs() < 1e-3);
    }

    #[test]
    fn red_time_never_drops_below_the_minimum() {
        let timing = timing();
        let red = red_time_from_rate(&timing, MeterType::Single, 2000);
        assert!((red - timing.min_red_secs).abs() < 1e-6);
    }

    #[test]
    fn red_tenths_round_half_up() {
        assert_eq!(red_tenths(1.25), 13);
        assert_eq!(red_tenths(1.24), 12);
    }

    #[test]
    fn timing_table_encodes_to_54_bcd_bytes() {
        let timing = timing();
        let table = TimingTable::for_targets(&timing, MeterType::Dual, 1200, 1500)
            .encode(&timing)
            .expect("encode");
        assert_eq!(table.len(), 54);
        // AM half leads with startup green (80 -> 0x00 0x80 in BCD).
        assert_eq!(&table[0..2], &[0x00, 0x80]);
        // Rate code byte sits after the five headers and six red times.
        assert_eq!(table[22], MeterRateCode::TimeOfDay as u8);
        // Start time for the AM half is 06:30.
        assert_eq!(&table[23..25], &[0x06, 0x30]);
    }
}
