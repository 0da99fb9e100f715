//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "MnDOT-170 protocol driver."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! MnDOT-170 communication protocol driver, revisions 4 and 5.
//!
//! The 170 is a multi-drop serial protocol with a one-byte drop/category
//! header, a length-prefixed payload, and an XOR checksum. Revision 4 packs
//! a 4-bit category with a 4-bit drop address; revision 5 packs a 3-bit
//! category with a 5-bit drop. Controller memory is addressed directly with
//! read/write categories; binned sample records drain through a
//! count/fetch/delete sequence. Numeric fields are BCD-encoded.

pub mod address;
pub mod bcd;
pub mod frame;
pub mod message;
pub mod meter;
pub mod ops;
pub mod poller;
pub mod property;
pub mod sample;

pub use frame::{CategoryCode, ControllerStatus, FrameFormat};
pub use message::Message;
pub use poller::MndotPoller;
pub use property::{MemoryProperty, MndotProperty};
