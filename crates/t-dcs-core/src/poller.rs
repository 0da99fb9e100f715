//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Device poller capability traits."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Capability traits implemented by protocol pollers. A poller maps an
//! abstract device request onto the concrete operation for its protocol and
//! submits it to the link queue; duplicate requests while one is in flight
//! are eliminated by the queue, not stacked.

use crate::devices::{LcsIndication, SignMessage};

/// Binned-sample collection intervals supported by field controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleInterval {
    ThirtySeconds,
    FiveMinutes,
}

impl SampleInterval {
    pub fn seconds(&self) -> u32 {
        match self {
            SampleInterval::ThirtySeconds => 30,
            SampleInterval::FiveMinutes => 300,
        }
    }
}

/// Abstract device requests issued by the dispatching layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    SendSettings,
    QueryStatus,
    QueryConfig,
    QueryMessage,
    ResetDevice,
    StartTesting,
}

/// Sample collection and controller-level maintenance.
pub trait SamplePoller: Send + Sync {
    /// Download settings to a controller.
    fn send_settings(&self, controller: &str);
    /// Perform a controller restart.
    fn reset_controller(&self, controller: &str);
    /// Query binned sample data for the given interval.
    fn query_samples(&self, controller: &str, interval: SampleInterval);
}

/// Ramp meter control.
pub trait MeterPoller: Send + Sync {
    fn send_meter_request(&self, meter: &str, request: DeviceRequest);
    /// Send a new release rate; `None` stops metering.
    fn send_release_rate(&self, meter: &str, rate: Option<u32>);
}

/// Lane-control signal arrays.
pub trait LcsPoller: Send + Sync {
    fn send_lcs_request(&self, lcs: &str, request: DeviceRequest);
    fn send_indications(&self, lcs: &str, indications: &[LcsIndication], owner: &str);
}

/// Warning signs.
pub trait WarningSignPoller: Send + Sync {
    fn send_warning_request(&self, sign: &str, request: DeviceRequest);
    fn set_deployed(&self, sign: &str, deployed: bool);
}

/// Alarm inputs.
pub trait AlarmPoller: Send + Sync {
    fn query_alarms(&self, controller: &str);
}

/// Dynamic message signs.
pub trait SignPoller: Send + Sync {
    fn send_sign_request(&self, dms: &str, request: DeviceRequest);
    /// Deploy a message; a blank message clears the sign.
    fn send_sign_message(&self, dms: &str, message: SignMessage, owner: &str);
}
