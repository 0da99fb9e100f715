//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "MnDOT-170 device poller."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use t_dcs_common::config::{LaneType, MeterTimingConfig};
use t_dcs_common::time::WallClock;
use t_dcs_core::devices::{Controller, DeviceRegistry, LcsIndication, RampMeter};
use t_dcs_core::link::{DownloadHandler, LinkHandle};
use t_dcs_core::operation::{Operation, PriorityLevel};
use t_dcs_core::poller::{
    AlarmPoller, DeviceRequest, LcsPoller, MeterPoller, SampleInterval, SamplePoller,
    WarningSignPoller,
};
use tracing::debug;

use crate::frame::FrameFormat;
use crate::meter::{red_tenths, red_time_from_rate, MeterRateCode};
use crate::ops::{
    OpQueryAlarms, OpQueryLcsStatus, OpQueryMeterStatus, OpQuerySamples30Sec, OpQuerySamples5Min,
    OpQueryWarningStatus, OpReset170, OpSendLcsIndications, OpSendMeterRate, OpSendMeterRedTime,
    OpSendMeterSettings, OpSendSampleSettings, OpSendWarningCommand, OpSendWarningSettings,
};

/// Maps abstract device requests onto 170 operations and submits them to
/// the link queue.
pub struct MndotPoller {
    link: LinkHandle,
    format: FrameFormat,
    registry: Arc<DeviceRegistry>,
    timing: MeterTimingConfig,
    clock: Arc<dyn WallClock>,
}

impl MndotPoller {
    pub fn new(
        link: LinkHandle,
        format: FrameFormat,
        registry: Arc<DeviceRegistry>,
        timing: MeterTimingConfig,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            link,
            format,
            registry,
            timing,
            clock,
        }
    }

    /// Check a drop address against the link's packing variant.
    pub fn is_address_valid(&self, drop: u8) -> bool {
        drop >= 1 && drop <= self.format.max_drop()
    }

    fn settings_ops(
        &self,
        controller: &Arc<Controller>,
        priority: PriorityLevel,
    ) -> Vec<Box<dyn Operation>> {
        build_settings_ops(
            self.format,
            &self.registry,
            &self.timing,
            &self.clock,
            controller,
            priority,
        )
    }

    /// Build the handler the link worker calls when a controller answers
    /// with a download-request status.
    pub fn download_handler(&self) -> DownloadHandler {
        download_handler(
            self.format,
            self.registry.clone(),
            self.timing.clone(),
            self.clock.clone(),
        )
    }

    fn meter_context(&self, meter: &str) -> Option<(Arc<Controller>, Arc<RampMeter>, u8)> {
        let meter = self.registry.meter(meter)?;
        let controller = self.registry.controller_of(meter.name())?;
        if !self.is_address_valid(controller.drop_address()) {
            return None;
        }
        let number = crate::address::meter_number(meter.pin())?;
        Some((controller, meter, number))
    }

    fn stop_metering(&self, controller: Arc<Controller>, meter: Arc<RampMeter>, number: u8) {
        self.link.submit(Box::new(OpSendMeterRate::new(
            controller,
            self.format,
            meter,
            number,
            MeterRateCode::ForcedFlash,
        )));
    }
}

impl SamplePoller for MndotPoller {
    fn send_settings(&self, controller: &str) {
        let Some(controller) = self.registry.controller(controller) else {
            return;
        };
        for op in self.settings_ops(&controller, PriorityLevel::Download) {
            self.link.submit(op);
        }
    }

    fn reset_controller(&self, controller: &str) {
        if let Some(controller) = self.registry.controller(controller) {
            self.link
                .submit(Box::new(OpReset170::new(controller, self.format)));
        }
    }

    fn query_samples(&self, controller: &str, interval: SampleInterval) {
        let Some(target) = self.registry.controller(controller) else {
            return;
        };
        if !self.is_address_valid(target.drop_address()) {
            return;
        }
        let detectors = self.registry.detectors_on(controller);
        let meters = self.registry.meters_on(controller);
        match interval {
            SampleInterval::ThirtySeconds => {
                if !detectors.is_empty() {
                    self.link.submit(Box::new(OpQuerySamples30Sec::new(
                        target.clone(),
                        self.format,
                        detectors,
                        self.clock.clone(),
                    )));
                }
                // Green counts ride along with the meter status block.
                if !meters.is_empty() {
                    self.link.submit(Box::new(OpQueryMeterStatus::new(
                        target,
                        self.format,
                        meters,
                    )));
                }
            }
            SampleInterval::FiveMinutes => {
                if !detectors.is_empty() || !meters.is_empty() {
                    self.link.submit(Box::new(OpQuerySamples5Min::new(
                        target,
                        self.format,
                        detectors,
                        self.clock.clone(),
                    )));
                }
            }
        }
    }
}

impl MeterPoller for MndotPoller {
    fn send_meter_request(&self, meter: &str, request: DeviceRequest) {
        match request {
            DeviceRequest::SendSettings => {
                if let Some((controller, meter, _)) = self.meter_context(meter) {
                    self.link.submit(Box::new(OpSendMeterSettings::new(
                        controller,
                        self.format,
                        meter,
                        self.timing.clone(),
                    )));
                }
            }
            other => {
                debug!(meter, request = ?other, "ignoring unsupported meter request");
            }
        }
    }

    fn send_release_rate(&self, meter: &str, rate: Option<u32>) {
        let Some((controller, meter, number)) = self.meter_context(meter) else {
            return;
        };
        match rate {
            None | Some(0) => self.stop_metering(controller, meter, number),
            Some(rate) => {
                let red = red_time_from_rate(&self.timing, meter.meter_type(), rate);
                let was_metering = meter.is_metering();
                self.link.submit(Box::new(OpSendMeterRedTime::new(
                    controller.clone(),
                    self.format,
                    meter.clone(),
                    number,
                    red_tenths(red),
                    rate,
                )));
                if !was_metering {
                    self.link.submit(Box::new(OpSendMeterRate::new(
                        controller,
                        self.format,
                        meter,
                        number,
                        MeterRateCode::Central,
                    )));
                }
            }
        }
    }
}

impl LcsPoller for MndotPoller {
    fn send_lcs_request(&self, lcs: &str, request: DeviceRequest) {
        if request != DeviceRequest::QueryStatus {
            return;
        }
        let Some(array) = self.registry.lcs(lcs) else {
            return;
        };
        if let Some(controller) = self.registry.controller_of(lcs) {
            self.link.submit(Box::new(OpQueryLcsStatus::new(
                controller,
                self.format,
                array,
            )));
        }
    }

    fn send_indications(&self, lcs: &str, indications: &[LcsIndication], owner: &str) {
        let Some(array) = self.registry.lcs(lcs) else {
            return;
        };
        if let Some(controller) = self.registry.controller_of(lcs) {
            self.link.submit(Box::new(OpSendLcsIndications::new(
                controller,
                self.format,
                array,
                indications.to_vec(),
                owner,
            )));
        }
    }
}

impl WarningSignPoller for MndotPoller {
    fn send_warning_request(&self, sign: &str, request: DeviceRequest) {
        let Some(warning) = self.registry.warning_sign(sign) else {
            return;
        };
        let Some(controller) = self.registry.controller_of(sign) else {
            return;
        };
        match request {
            DeviceRequest::SendSettings => {
                self.link.submit(Box::new(OpSendWarningSettings::new(
                    controller,
                    self.format,
                    warning,
                    self.timing.clone(),
                )));
            }
            DeviceRequest::QueryStatus => {
                self.link.submit(Box::new(OpQueryWarningStatus::new(
                    controller,
                    self.format,
                    warning,
                )));
            }
            other => {
                debug!(sign, request = ?other, "ignoring unsupported warning sign request");
            }
        }
    }

    fn set_deployed(&self, sign: &str, deployed: bool) {
        let Some(warning) = self.registry.warning_sign(sign) else {
            return;
        };
        if let Some(controller) = self.registry.controller_of(sign) {
            self.link.submit(Box::new(OpSendWarningCommand::new(
                controller,
                self.format,
                warning,
                deployed,
            )));
        }
    }
}

impl AlarmPoller for MndotPoller {
    fn query_alarms(&self, controller: &str) {
        let alarms = self.registry.alarms_on(controller);
        if alarms.is_empty() {
            return;
        }
        if let Some(controller) = self.registry.controller(controller) {
            self.link.submit(Box::new(OpQueryAlarms::new(
                controller,
                self.format,
                alarms,
            )));
        }
    }
}

/// Standalone download handler, for wiring a link worker before its poller
/// exists.
pub fn download_handler(
    format: FrameFormat,
    registry: Arc<DeviceRegistry>,
    timing: MeterTimingConfig,
    clock: Arc<dyn WallClock>,
) -> DownloadHandler {
    Box::new(move |controller, priority| {
        build_settings_ops(format, &registry, &timing, &clock, controller, priority)
    })
}

/// The full settings fan-out for one controller: sample settings first,
/// then warning sign and meter timing tables.
fn build_settings_ops(
    format: FrameFormat,
    registry: &DeviceRegistry,
    timing: &MeterTimingConfig,
    clock: &Arc<dyn WallClock>,
    controller: &Arc<Controller>,
    priority: PriorityLevel,
) -> Vec<Box<dyn Operation>> {
    let queue_pins: Vec<u8> = registry
        .detectors_on(controller.name())
        .iter()
        .filter(|d| d.lane_type() == LaneType::Queue)
        .map(|d| d.pin())
        .collect();
    let mut ops: Vec<Box<dyn Operation>> = Vec::new();
    let mut settings =
        OpSendSampleSettings::new(controller.clone(), format, clock.clone(), &queue_pins, false);
    settings.set_priority(priority);
    ops.push(Box::new(settings));

    for sign in registry.warning_signs_on(controller.name()) {
        let mut op = OpSendWarningSettings::new(controller.clone(), format, sign, timing.clone());
        op.set_priority(priority);
        ops.push(Box::new(op));
    }
    for meter in registry.meters_on(controller.name()) {
        let mut op = OpSendMeterSettings::new(controller.clone(), format, meter, timing.clone());
        op.set_priority(priority);
        ops.push(Box::new(op));
    }
    ops
}

/// Whether a controller carries devices worth routine polling.
pub fn has_pollable_devices(registry: &DeviceRegistry, controller: &str) -> bool {
    !registry.detectors_on(controller).is_empty()
        || !registry.meters_on(controller).is_empty()
        || !registry.alarms_on(controller).is_empty()
}
