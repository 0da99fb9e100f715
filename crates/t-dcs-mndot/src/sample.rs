//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Binned sample record properties."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Binned 5-minute sample records drain through a count/fetch/delete
//! sequence. A record is a BCD timestamp followed by one volume byte and one
//! scan byte per detector input.

use chrono::{DateTime, Local, TimeZone};
use t_dcs_core::{CommError, Result};

use crate::address::DETECTOR_INPUTS;
use crate::bcd;
use crate::frame::{CategoryCode, ControllerStatus};
use crate::property::{Framer, MndotProperty};

/// Record body: 5-byte BCD timestamp (yy mm dd hh mm), then volume and scan
/// bytes for each detector input.
pub const RECORD_LEN: usize = 5 + 2 * DETECTOR_INPUTS as usize;

/// One drained 5-minute sample record.
#[derive(Debug, Clone)]
pub struct BinnedRecord {
    /// `None` when the BCD digits were valid but do not form a real date.
    pub stamp: Option<DateTime<Local>>,
    pub volume: [u8; DETECTOR_INPUTS as usize],
    pub scans: [u8; DETECTOR_INPUTS as usize],
}

/// Number of records queued on the controller.
#[derive(Debug, Default)]
pub struct RecordCountProperty {
    pub count: u8,
}

impl MndotProperty for RecordCountProperty {
    fn encode_query(&self, framer: &Framer) -> Result<Vec<u8>> {
        framer.frame(CategoryCode::QueryRecordCount, &[])
    }

    fn decode_query(&mut self, framer: &Framer, resp: &[u8]) -> Result<()> {
        let (status, payload) = framer.validate_response(resp)?;
        status.check()?;
        if payload.len() != 1 {
            return Err(CommError::Parsing(format!(
                "record count returned {} bytes, expected 1",
                payload.len()
            )));
        }
        self.count = payload[0];
        Ok(())
    }
}

/// Result of a fetch: an empty queue is an expected outcome, not an error.
#[derive(Debug, Default)]
pub enum SampleFetch {
    #[default]
    Pending,
    Record(BinnedRecord),
    Empty,
}

/// Fetch the oldest queued record without removing it.
#[derive(Debug, Default)]
pub struct NextRecordProperty {
    pub fetch: SampleFetch,
}

impl MndotProperty for NextRecordProperty {
    fn encode_query(&self, framer: &Framer) -> Result<Vec<u8>> {
        framer.frame(CategoryCode::SendNextRecord, &[])
    }

    fn decode_query(&mut self, framer: &Framer, resp: &[u8]) -> Result<()> {
        let (status, payload) = framer.validate_response(resp)?;
        if status == ControllerStatus::NoData {
            self.fetch = SampleFetch::Empty;
            return Ok(());
        }
        status.check()?;
        if payload.len() != RECORD_LEN {
            return Err(CommError::Parsing(format!(
                "sample record of {} bytes, expected {}",
                payload.len(),
                RECORD_LEN
            )));
        }
        let stamp = decode_stamp(&payload[..5])?;
        let mut volume = [0u8; DETECTOR_INPUTS as usize];
        let mut scans = [0u8; DETECTOR_INPUTS as usize];
        volume.copy_from_slice(&payload[5..5 + DETECTOR_INPUTS as usize]);
        scans.copy_from_slice(&payload[5 + DETECTOR_INPUTS as usize..]);
        self.fetch = SampleFetch::Record(BinnedRecord {
            stamp,
            volume,
            scans,
        });
        Ok(())
    }
}

/// Remove the oldest queued record after it has been fetched.
#[derive(Debug, Default)]
pub struct DeleteRecordProperty;

impl MndotProperty for DeleteRecordProperty {
    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        framer.frame(CategoryCode::DeleteOldestRecord, &[])
    }
}

/// Decode a 5-byte BCD timestamp. Malformed BCD digits are framing errors;
/// digits that form an impossible date yield `None` so the operation can
/// apply its bad-timestamp policy instead of aborting the exchange.
fn decode_stamp(bytes: &[u8]) -> Result<Option<DateTime<Local>>> {
    let year = 2000 + bcd::bcd2_decode(bytes[0])? as i32;
    let month = bcd::bcd2_decode(bytes[1])?;
    let day = bcd::bcd2_decode(bytes[2])?;
    let hour = bcd::bcd2_decode(bytes[3])?;
    let minute = bcd::bcd2_decode(bytes[4])?;
    Ok(Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single())
}

/// Encode a timestamp into the 5-byte record prefix (used by tests and the
/// field simulator).
pub fn encode_stamp(stamp: DateTime<Local>) -> Result<[u8; 5]> {
    use chrono::{Datelike, Timelike};
    Ok([
        bcd::bcd2_encode(stamp.year() as u32 % 100)?,
        bcd::bcd2_encode(stamp.month())?,
        bcd::bcd2_encode(stamp.day())?,
        bcd::bcd2_encode(stamp.hour())?,
        bcd::bcd2_encode(stamp.minute())?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;

    fn framer() -> Framer {
        Framer::new(7, FrameFormat::CategoryBits3)
    }

    fn response(status: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![(7 << 3) | status, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(0);
        bcd::seal(&mut frame);
        frame
    }

    #[test]
    fn record_count_decodes() {
        let mut prop = RecordCountProperty::default();
        prop.decode_query(&framer(), &response(0, &[5])).expect("decode");
        assert_eq!(prop.count, 5);
    }

    #[test]
    fn no_data_status_is_an_empty_fetch_not_an_error() {
        let mut prop = NextRecordProperty::default();
        prop.decode_query(&framer(), &response(6, &[])).expect("decode");
        assert!(matches!(prop.fetch, SampleFetch::Empty));
    }

    #[test]
    fn record_round_trips_through_the_stamp_codec() {
        let stamp = Local.with_ymd_and_hms(2024, 3, 14, 9, 25, 0).unwrap();
        let mut payload = encode_stamp(stamp).expect("stamp").to_vec();
        payload.extend_from_slice(&[3u8; DETECTOR_INPUTS as usize]);
        payload.extend_from_slice(&[40u8; DETECTOR_INPUTS as usize]);

        let mut prop = NextRecordProperty::default();
        prop.decode_query(&framer(), &response(0, &payload)).expect("decode");
        match &prop.fetch {
            SampleFetch::Record(record) => {
                assert_eq!(record.stamp, Some(stamp));
                assert_eq!(record.volume[0], 3);
                assert_eq!(record.scans[23], 40);
            }
            other => panic!("unexpected fetch: {:?}", other),
        }
    }

    #[test]
    fn impossible_dates_decode_to_a_missing_stamp() {
        // 13th month: valid BCD, impossible date.
        let mut payload = vec![0x24, 0x13, 0x01, 0x00, 0x00];
        payload.extend_from_slice(&[0u8; 2 * DETECTOR_INPUTS as usize]);
        let mut prop = NextRecordProperty::default();
        prop.decode_query(&framer(), &response(0, &payload)).expect("decode");
        match &prop.fetch {
            SampleFetch::Record(record) => assert!(record.stamp.is_none()),
            other => panic!("unexpected fetch: {:?}", other),
        }
    }
}
