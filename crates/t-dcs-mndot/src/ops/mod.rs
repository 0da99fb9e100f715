//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "170 controller operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Multi-phase operations against 170 controllers. Each operation is a
//! struct with an explicit phase enum; one phase runs per scheduling turn
//! and selects the next, `None` terminating the chain.

pub mod alarms;
pub mod lcs;
pub mod meter;
pub mod reset;
pub mod samples;
pub mod settings;
pub mod warning;

pub use alarms::OpQueryAlarms;
pub use lcs::{OpQueryLcsStatus, OpSendLcsIndications};
pub use meter::{OpSendMeterRate, OpSendMeterRedTime};
pub use reset::{OpReset170, OpShutUp};
pub use samples::{OpQueryMeterStatus, OpQuerySamples30Sec, OpQuerySamples5Min};
pub use settings::{OpSendMeterSettings, OpSendSampleSettings, OpSendWarningSettings};
pub use warning::{OpQueryWarningStatus, OpSendWarningCommand};
