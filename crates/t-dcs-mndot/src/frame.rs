//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "170 frame format variants and status codes."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use t_dcs_common::config::LinkProtocol;
use t_dcs_core::{CommError, Result};

/// Request categories of the 170 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CategoryCode {
    ShutUp = 0,
    Level1Restart = 1,
    SynchronizeClock = 2,
    QueryRecordCount = 3,
    SendNextRecord = 4,
    DeleteOldestRecord = 5,
    WriteMemory = 6,
    ReadMemory = 7,
}

/// Status nibble returned in the drop/category byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Ok,
    BadMessage,
    BadPollChecksum,
    DownloadRequest,
    WriteProtect,
    MessageSize,
    NoData,
    NoRam,
    DownloadRequest4,
}

impl ControllerStatus {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ControllerStatus::Ok,
            1 => ControllerStatus::BadMessage,
            2 => ControllerStatus::BadPollChecksum,
            3 => ControllerStatus::DownloadRequest,
            4 => ControllerStatus::WriteProtect,
            5 => ControllerStatus::MessageSize,
            6 => ControllerStatus::NoData,
            7 => ControllerStatus::NoRam,
            8 => ControllerStatus::DownloadRequest4,
            other => {
                return Err(CommError::Parsing(format!(
                    "unknown controller status {}",
                    other
                )))
            }
        })
    }

    /// Map a non-OK status to the failure it signals. Download requests get
    /// their own variant so the link can schedule a settings re-download.
    pub fn check(self) -> Result<()> {
        match self {
            ControllerStatus::Ok => Ok(()),
            ControllerStatus::DownloadRequest | ControllerStatus::DownloadRequest4 => {
                Err(CommError::DownloadRequest)
            }
            ControllerStatus::BadMessage => Err(CommError::Controller("BAD MESSAGE".into())),
            ControllerStatus::BadPollChecksum => {
                Err(CommError::Controller("BAD POLL CHECKSUM".into()))
            }
            ControllerStatus::WriteProtect => Err(CommError::Controller("WRITE PROTECT".into())),
            ControllerStatus::MessageSize => Err(CommError::Controller("MESSAGE SIZE".into())),
            ControllerStatus::NoData => Err(CommError::Controller("NO SAMPLE DATA".into())),
            ControllerStatus::NoRam => Err(CommError::Controller("NO RAM".into())),
        }
    }
}

/// Drop/category packing variant, fixed per link at configuration time.
///
/// Revision 5 packs a 3-bit category with a 5-bit drop (1-31); revision 4
/// packs a 4-bit category with a 4-bit drop (1-15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    CategoryBits3,
    CategoryBits4,
}

impl FrameFormat {
    pub fn for_protocol(protocol: LinkProtocol) -> Option<Self> {
        match protocol {
            LinkProtocol::Mndot4 => Some(FrameFormat::CategoryBits4),
            LinkProtocol::Mndot5 => Some(FrameFormat::CategoryBits3),
            LinkProtocol::DmsLite => None,
        }
    }

    pub fn max_drop(&self) -> u8 {
        match self {
            FrameFormat::CategoryBits3 => 31,
            FrameFormat::CategoryBits4 => 15,
        }
    }

    /// Pack the drop address and category into the frame's first byte.
    pub fn pack_drop_cat(&self, drop: u8, category: CategoryCode) -> Result<u8> {
        if drop < 1 || drop > self.max_drop() {
            return Err(CommError::InvalidAddress(drop));
        }
        Ok(match self {
            FrameFormat::CategoryBits3 => (drop << 3) | category as u8,
            FrameFormat::CategoryBits4 => (drop << 4) | category as u8,
        })
    }

    /// Split a response's first byte into drop address and status nibble.
    pub fn parse_drop_stat(&self, byte: u8) -> (u8, u8) {
        match self {
            FrameFormat::CategoryBits3 => (byte >> 3, byte & 0x07),
            FrameFormat::CategoryBits4 => (byte >> 4, byte & 0x0f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_bit_packing_matches_wire_layout() {
        let format = FrameFormat::CategoryBits3;
        let byte = format
            .pack_drop_cat(7, CategoryCode::WriteMemory)
            .expect("valid drop");
        assert_eq!(byte, 0x07 << 3 | 0x06);
        assert_eq!(format.parse_drop_stat(byte), (7, 6));
    }

    #[test]
    fn four_bit_packing_narrows_the_drop_range() {
        let format = FrameFormat::CategoryBits4;
        let byte = format
            .pack_drop_cat(15, CategoryCode::ReadMemory)
            .expect("valid drop");
        assert_eq!(byte, 15 << 4 | 7);
        assert!(matches!(
            format.pack_drop_cat(16, CategoryCode::ReadMemory),
            Err(CommError::InvalidAddress(16))
        ));
    }

    #[test]
    fn zero_drop_is_invalid_in_both_variants() {
        for format in [FrameFormat::CategoryBits3, FrameFormat::CategoryBits4] {
            assert!(matches!(
                format.pack_drop_cat(0, CategoryCode::ShutUp),
                Err(CommError::InvalidAddress(0))
            ));
        }
    }

    #[test]
    fn download_request_statuses_map_to_their_own_error() {
        assert!(matches!(
            ControllerStatus::from_code(3).unwrap().check(),
            Err(CommError::DownloadRequest)
        ));
        assert!(matches!(
            ControllerStatus::from_code(8).unwrap().check(),
            Err(CommError::DownloadRequest)
        ));
        assert!(matches!(
            ControllerStatus::from_code(4).unwrap().check(),
            Err(CommError::Controller(_))
        ));
        assert!(ControllerStatus::from_code(0).unwrap().check().is_ok());
    }
}
