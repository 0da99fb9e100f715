//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "170 controller memory map and pin assignments."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Memory map of the 170 controller firmware.

/// Cabinet type dip-switch register.
pub const CABINET_TYPE: u16 = 0x00FE;

/// Alarm input bitmap (2 bytes).
pub const ALARM_INPUTS: u16 = 0x0104;

/// Ramp meter data blocks; meter 2 at [`OFF_METER_2`].
pub const RAMP_METER_DATA: u16 = 0x010C;

/// Queue detector bitmap (3 bytes, one bit per detector input).
pub const QUEUE_BITMAP: u16 = 0x0129;

/// Comm-fail timeout register.
pub const COMM_FAIL: u16 = 0x012C;

/// Special function output buffer (2 bytes of pinned outputs; the watchdog
/// byte sits at +2, the detector-reset byte at -1).
pub const SPECIAL_FUNCTION_OUTPUTS: u16 = 0x012F;

/// Meter timing tables (54 bytes each: AM then PM half).
pub const METER_1_TIMING_TABLE: u16 = 0x0140;
pub const METER_2_TIMING_TABLE: u16 = 0x0180;

/// 5-minute binned sample buffer.
pub const SAMPLE_5MIN_BUFFER: u16 = 0x0300;

/// 30-second binned sample buffer (24 volume bytes + 24 scan bytes).
pub const SAMPLE_30SEC_BUFFER: u16 = 0x034B;

/// PROM version register (major, minor).
pub const PROM_VERSION: u16 = 0xFFF6;

/// Offsets within a ramp meter data block.
pub const OFF_RATE_CODE: u16 = 0x00;
/// Police panel / verify flags byte; writing zero clears pending verifies.
pub const OFF_POLICE_PANEL: u16 = 0x01;
pub const OFF_REMOTE_RATE: u16 = 0x02;
pub const OFF_REMOTE_RED_TIME: u16 = 0x03;
pub const OFF_GREEN_COUNT: u16 = 0x06;
/// Meter 2 block offset from [`RAMP_METER_DATA`].
pub const OFF_METER_2: u16 = 0x08;
/// Combined size of both meter data blocks.
pub const METER_DATA_LEN: usize = 16;

/// Bit written to the watchdog byte to reset the monitor.
pub const WATCHDOG_BITS: u8 = 0x80;

/// Bit written below the special function outputs to reset detectors.
pub const DETECTOR_RESET: u8 = 0x01;

/// Comm-fail threshold written during settings download.
pub const COMM_FAIL_THRESHOLD: u8 = 10;

/// Controller I/O pin of the first ramp meter.
pub const METER_1_PIN: u8 = 2;
/// Controller I/O pin of the second ramp meter.
pub const METER_2_PIN: u8 = 3;

/// First detector input pin and input count.
pub const FIRST_DETECTOR_PIN: u8 = 39;
pub const DETECTOR_INPUTS: u8 = 24;

/// First pin mapped into the special function output buffer.
pub const FIRST_SPECIAL_FUNCTION_PIN: u8 = 19;
/// Number of pins the 2-byte output buffer can address.
pub const SPECIAL_FUNCTION_PINS: u8 = 16;

/// First alarm input pin.
pub const FIRST_ALARM_PIN: u8 = 70;
pub const ALARM_INPUT_COUNT: u8 = 16;

/// Set one special function output bit by pin number.
///
/// Pins outside the buffer are ignored rather than rejected: indication
/// objects may be configured after an output snapshot was taken, and the
/// snapshot must still apply cleanly.
pub fn set_spec_func_output(buffer: &mut [u8; 2], pin: u8) {
    if let Some(index) = spec_func_index(pin) {
        buffer[index / 8] |= 1 << (index % 8);
    }
}

/// Clear one special function output bit by pin number.
pub fn clear_spec_func_output(buffer: &mut [u8; 2], pin: u8) {
    if let Some(index) = spec_func_index(pin) {
        buffer[index / 8] &= !(1 << (index % 8));
    }
}

/// Read one special function output bit; out-of-range pins read as false.
pub fn get_spec_func_output(buffer: &[u8; 2], pin: u8) -> bool {
    match spec_func_index(pin) {
        Some(index) => buffer[index / 8] & (1 << (index % 8)) != 0,
        None => false,
    }
}

fn spec_func_index(pin: u8) -> Option<usize> {
    if pin < FIRST_SPECIAL_FUNCTION_PIN {
        return None;
    }
    let index = (pin - FIRST_SPECIAL_FUNCTION_PIN) as usize;
    (index < SPECIAL_FUNCTION_PINS as usize).then_some(index)
}

/// Meter number (1 or 2) for a controller pin, if the pin drives a meter.
pub fn meter_number(pin: u8) -> Option<u8> {
    match pin {
        METER_1_PIN => Some(1),
        METER_2_PIN => Some(2),
        _ => None,
    }
}

/// Timing table base address for a meter number.
pub fn timing_table(meter_number: u8) -> u16 {
    if meter_number == 2 {
        METER_2_TIMING_TABLE
    } else {
        METER_1_TIMING_TABLE
    }
}

/// Ramp meter data block base address for a meter number.
pub fn meter_data(meter_number: u8) -> u16 {
    if meter_number == 2 {
        RAMP_METER_DATA + OFF_METER_2
    } else {
        RAMP_METER_DATA
    }
}
