//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "170 protocol properties: framing and memory access."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! One property is one protocol exchange: a query (read) encoding, a store
//! (write) encoding, and response validation. Framing and validation are
//! shared; concrete properties specialize payload layout and parsing only.

use chrono::{DateTime, Datelike, Local, Timelike};
use t_dcs_core::{CommError, Result};

use crate::bcd;
use crate::frame::{CategoryCode, ControllerStatus, FrameFormat};

/// Largest payload a 170 frame can carry.
pub const MAX_PAYLOAD: usize = 123;

/// Bytes of framing around the payload: drop/category, length, checksum.
pub const FRAME_OVERHEAD: usize = 3;

/// Shared framing context for one controller: drop address plus the
/// link's category-packing variant.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    pub drop: u8,
    pub format: FrameFormat,
}

impl Framer {
    pub fn new(drop: u8, format: FrameFormat) -> Self {
        Self { drop, format }
    }

    /// Build a complete request frame around a payload.
    pub fn frame(&self, category: CategoryCode, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CommError::Encoding(format!(
                "payload of {} bytes exceeds maximum {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        frame.push(self.format.pack_drop_cat(self.drop, category)?);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        frame.push(0);
        bcd::seal(&mut frame);
        Ok(frame)
    }

    /// Validate a response frame and return its status and payload.
    ///
    /// Length is checked exactly against the frame's own length byte,
    /// then checksum, then drop address, before any payload is exposed.
    pub fn validate_response<'a>(&self, resp: &'a [u8]) -> Result<(ControllerStatus, &'a [u8])> {
        if resp.len() < FRAME_OVERHEAD {
            return Err(CommError::Parsing(format!(
                "response truncated to {} bytes",
                resp.len()
            )));
        }
        let expected_len = resp[1] as usize + FRAME_OVERHEAD;
        if resp.len() != expected_len {
            return Err(CommError::Parsing(format!(
                "response length {} != framed length {}",
                resp.len(),
                expected_len
            )));
        }
        let expected = bcd::checksum(resp);
        let actual = resp[resp.len() - 1];
        if expected != actual {
            return Err(CommError::Checksum { expected, actual });
        }
        let (drop, stat) = self.format.parse_drop_stat(resp[0]);
        if drop != self.drop {
            return Err(CommError::Parsing(format!(
                "drop address {} in response, expected {}",
                drop, self.drop
            )));
        }
        let status = ControllerStatus::from_code(stat)?;
        Ok((status, &resp[2..resp.len() - 1]))
    }
}

/// One request/response unit of the 170 protocol.
///
/// A property only populates its own result fields; device mutation happens
/// later, in operation cleanup.
pub trait MndotProperty: Send {
    fn encode_query(&self, framer: &Framer) -> Result<Vec<u8>> {
        let _ = framer;
        Err(CommError::Encoding("property is not readable".into()))
    }

    fn decode_query(&mut self, framer: &Framer, resp: &[u8]) -> Result<()> {
        let _ = (framer, resp);
        Err(CommError::Parsing("property is not readable".into()))
    }

    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        let _ = framer;
        Err(CommError::Encoding("property is not writable".into()))
    }

    /// Most writes are acknowledged with a trivial 3-byte frame.
    fn decode_store(&mut self, framer: &Framer, resp: &[u8]) -> Result<()> {
        let (status, payload) = framer.validate_response(resp)?;
        status.check()?;
        if !payload.is_empty() {
            return Err(CommError::Parsing(format!(
                "unexpected {}-byte payload in store acknowledgement",
                payload.len()
            )));
        }
        Ok(())
    }

    /// The shut-up broadcast is the only store with no response at all.
    fn expects_store_response(&self) -> bool {
        true
    }
}

/// Memory read/write at a fixed controller address.
#[derive(Debug)]
pub struct MemoryProperty {
    address: u16,
    payload: Vec<u8>,
}

impl MemoryProperty {
    /// A read of `len` bytes at `address`.
    pub fn query(address: u16, len: usize) -> Self {
        Self {
            address,
            payload: vec![0; len],
        }
    }

    /// A write of `data` at `address`.
    pub fn store(address: u16, data: Vec<u8>) -> Self {
        Self {
            address,
            payload: data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn address_bytes(&self) -> [u8; 2] {
        self.address.to_be_bytes()
    }
}

impl MndotProperty for MemoryProperty {
    fn encode_query(&self, framer: &Framer) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(CommError::Encoding(format!(
                "read of {} bytes exceeds maximum {}",
                self.payload.len(),
                MAX_PAYLOAD
            )));
        }
        let addr = self.address_bytes();
        let request = [addr[0], addr[1], self.payload.len() as u8];
        framer.frame(CategoryCode::ReadMemory, &request)
    }

    fn decode_query(&mut self, framer: &Framer, resp: &[u8]) -> Result<()> {
        let (status, payload) = framer.validate_response(resp)?;
        status.check()?;
        if payload.len() != self.payload.len() {
            return Err(CommError::Parsing(format!(
                "memory read returned {} bytes, expected {}",
                payload.len(),
                self.payload.len()
            )));
        }
        self.payload.copy_from_slice(payload);
        Ok(())
    }

    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        let addr = self.address_bytes();
        let mut request = Vec::with_capacity(2 + self.payload.len());
        request.extend_from_slice(&addr);
        request.extend_from_slice(&self.payload);
        framer.frame(CategoryCode::WriteMemory, &request)
    }
}

/// Synchronize the controller clock to ours (store only).
#[derive(Debug)]
pub struct SynchronizeClockProperty {
    stamp: DateTime<Local>,
}

impl SynchronizeClockProperty {
    pub fn new(stamp: DateTime<Local>) -> Self {
        Self { stamp }
    }
}

impl MndotProperty for SynchronizeClockProperty {
    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        let payload = [
            bcd::bcd2_encode(self.stamp.year() as u32 % 100)?,
            bcd::bcd2_encode(self.stamp.month())?,
            bcd::bcd2_encode(self.stamp.day())?,
            bcd::bcd2_encode(self.stamp.hour())?,
            bcd::bcd2_encode(self.stamp.minute())?,
            bcd::bcd2_encode(self.stamp.second())?,
        ];
        framer.frame(CategoryCode::SynchronizeClock, &payload)
    }
}

/// Level-1 restart command (store only).
#[derive(Debug, Default)]
pub struct Level1RestartProperty;

impl MndotProperty for Level1RestartProperty {
    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        framer.frame(CategoryCode::Level1Restart, &[])
    }
}

/// Silence command. Broadcast on a shared line; no drop can answer it.
#[derive(Debug, Default)]
pub struct ShutUpProperty;

impl MndotProperty for ShutUpProperty {
    fn encode_store(&self, framer: &Framer) -> Result<Vec<u8>> {
        framer.frame(CategoryCode::ShutUp, &[])
    }

    fn expects_store_response(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer() -> Framer {
        Framer::new(7, FrameFormat::CategoryBits3)
    }

    /// Build a valid response frame for tests.
    fn response(framer: &Framer, status: u8, payload: &[u8]) -> Vec<u8> {
        let byte0 = match framer.format {
            FrameFormat::CategoryBits3 => (framer.drop << 3) | status,
            FrameFormat::CategoryBits4 => (framer.drop << 4) | status,
        };
        let mut frame = vec![byte0, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(0);
        bcd::seal(&mut frame);
        frame
    }

    #[test]
    fn memory_read_request_layout() {
        let prop = MemoryProperty::query(0x00FE, 1);
        let frame = prop.encode_query(&framer()).expect("encode");
        assert_eq!(frame[0], 7 << 3 | 7);
        assert_eq!(frame[1], 3);
        assert_eq!(&frame[2..5], &[0x00, 0xFE, 0x01]);
        assert_eq!(frame.len(), 3 + FRAME_OVERHEAD);
        assert_eq!(frame.iter().fold(0u8, |acc, b| acc ^ b), 0);
    }

    #[test]
    fn memory_write_request_layout() {
        let prop = MemoryProperty::store(0x0140, vec![0x12, 0x00]);
        let frame = prop.encode_store(&framer()).expect("encode");
        assert_eq!(frame[0], 0x38);
        assert_eq!(frame[1], 4);
        assert_eq!(&frame[2..6], &[0x01, 0x40, 0x12, 0x00]);
        assert_eq!(bcd::checksum(&frame), frame[6]);
    }

    #[test]
    fn oversized_payload_is_rejected_before_sending() {
        let prop = MemoryProperty::store(0x0300, vec![0; MAX_PAYLOAD + 1]);
        assert!(matches!(
            prop.encode_store(&framer()),
            Err(CommError::Encoding(_))
        ));
    }

    #[test]
    fn short_and_long_responses_are_rejected_without_parsing() {
        let framer = framer();
        let mut prop = MemoryProperty::query(0x00FE, 1);
        let good = response(&framer, 0, &[0x42]);

        let mut short = good.clone();
        short.pop();
        assert!(matches!(
            prop.decode_query(&framer, &short),
            Err(CommError::Parsing(_))
        ));

        let mut long = good.clone();
        long.push(0x00);
        assert!(matches!(
            prop.decode_query(&framer, &long),
            Err(CommError::Parsing(_))
        ));

        prop.decode_query(&framer, &good).expect("valid frame");
        assert_eq!(prop.payload(), &[0x42]);
    }

    #[test]
    fn corrupt_checksum_is_detected() {
        let framer = framer();
        let mut prop = MemoryProperty::query(0x00FE, 1);
        let mut resp = response(&framer, 0, &[0x42]);
        let last = resp.len() - 1;
        resp[last] ^= 0xff;
        assert!(matches!(
            prop.decode_query(&framer, &resp),
            Err(CommError::Checksum { .. })
        ));
    }

    #[test]
    fn drop_address_mismatch_is_detected() {
        let framer = framer();
        let other = Framer::new(9, FrameFormat::CategoryBits3);
        let mut prop = MemoryProperty::query(0x00FE, 1);
        let resp = response(&other, 0, &[0x42]);
        assert!(matches!(
            prop.decode_query(&framer, &resp),
            Err(CommError::Parsing(_))
        ));
    }

    #[test]
    fn write_protect_status_maps_to_controller_error() {
        let framer = framer();
        let mut prop = MemoryProperty::store(0xFFF6, vec![0x01]);
        let resp = response(&framer, 4, &[]);
        match prop.decode_store(&framer, &resp) {
            Err(CommError::Controller(msg)) => assert_eq!(msg, "WRITE PROTECT"),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn clock_sync_payload_is_bcd() {
        use chrono::TimeZone;
        let stamp = Local.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap();
        let prop = SynchronizeClockProperty::new(stamp);
        let frame = prop.encode_store(&framer()).expect("encode");
        assert_eq!(frame[1], 6);
        assert_eq!(&frame[2..8], &[0x24, 0x03, 0x14, 0x09, 0x26, 0x53]);
    }
}
