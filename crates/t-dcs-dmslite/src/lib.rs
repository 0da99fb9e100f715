//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "dmslite XML protocol driver."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! dmslite protocol driver for dynamic message signs.
//!
//! The wire format is a line of XML: an outer `<DmsLite>` document with one
//! message element (`StatusReqMsg`, `SetSnglPgReqMsg`, ...) whose children
//! are named request fields. Responses are scanned out of a bounded token
//! buffer by textual tag search; there is no general XML parser on either
//! end of this protocol, and none is needed.

pub mod message;
pub mod ops;
pub mod poller;
pub mod reqres;
pub mod token;
pub mod xml;

/// Fixed bitmap geometry for dmslite signs.
pub const BM_WIDTH: usize = 96;
pub const BM_HEIGHT: usize = 25;
/// Single-page bitmap length in bytes.
pub const BM_PGLEN_BYTES: usize = BM_WIDTH * BM_HEIGHT / 8;

pub use message::{Message, MsgIdSource};
pub use poller::DmsLitePoller;
pub use reqres::ReqRes;
