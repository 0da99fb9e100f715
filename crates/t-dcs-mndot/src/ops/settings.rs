//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Settings download operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use t_dcs_common::config::MeterTimingConfig;
use t_dcs_common::time::WallClock;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, RampMeter, StatusCommit, WarningSign};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;

use crate::address;
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::meter::TimingTable;
use crate::property::{Level1RestartProperty, MemoryProperty, SynchronizeClockProperty};

/// Send meter settings: watchdog reset, comm-fail time, timing table,
/// verify clear.
pub struct OpSendMeterSettings {
    header: OpHeader,
    format: FrameFormat,
    meter: Arc<RampMeter>,
    meter_number: u8,
    table: TimingTable,
    timing: MeterTimingConfig,
    phase: Option<MeterSettingsPhase>,
}

#[derive(Debug, Clone, Copy)]
enum MeterSettingsPhase {
    ResetWatchdogMonitor,
    ClearWatchdogMonitor,
    SetCommFail,
    SetTimingTable,
    ClearVerifies,
}

impl OpSendMeterSettings {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        meter: Arc<RampMeter>,
        timing: MeterTimingConfig,
    ) -> Self {
        let meter_number = address::meter_number(meter.pin()).unwrap_or(1);
        let table = TimingTable::for_targets(
            &timing,
            meter.meter_type(),
            meter.am_target(),
            meter.pm_target(),
        );
        Self {
            header: OpHeader::new(controller, PriorityLevel::Download),
            format,
            meter,
            meter_number,
            table,
            timing,
            phase: Some(MeterSettingsPhase::ResetWatchdogMonitor),
        }
    }
}

#[async_trait]
impl Operation for OpSendMeterSettings {
    fn name(&self) -> &'static str {
        "meter settings"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.header.controller.name(), self.name(), self.meter.name())
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        let Some(phase) = self.phase else {
            return Ok(OpStep::Done);
        };
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let next = match phase {
            MeterSettingsPhase::ResetWatchdogMonitor => {
                let mut prop = MemoryProperty::store(
                    address::SPECIAL_FUNCTION_OUTPUTS + 2,
                    vec![address::WATCHDOG_BITS],
                );
                message.store_prop(&mut prop).await?;
                Some(MeterSettingsPhase::ClearWatchdogMonitor)
            }
            MeterSettingsPhase::ClearWatchdogMonitor => {
                let mut prop =
                    MemoryProperty::store(address::SPECIAL_FUNCTION_OUTPUTS + 2, vec![0]);
                message.store_prop(&mut prop).await?;
                Some(MeterSettingsPhase::SetCommFail)
            }
            MeterSettingsPhase::SetCommFail => {
                let mut prop = MemoryProperty::store(
                    address::COMM_FAIL,
                    vec![address::COMM_FAIL_THRESHOLD],
                );
                message.store_prop(&mut prop).await?;
                Some(MeterSettingsPhase::SetTimingTable)
            }
            MeterSettingsPhase::SetTimingTable => {
                let table = self.table.encode(&self.timing)?;
                let mut prop =
                    MemoryProperty::store(address::timing_table(self.meter_number), table);
                message.store_prop(&mut prop).await?;
                Some(MeterSettingsPhase::ClearVerifies)
            }
            MeterSettingsPhase::ClearVerifies => {
                let verify_address =
                    address::meter_data(self.meter_number) + address::OFF_POLICE_PANEL;
                let mut prop = MemoryProperty::store(verify_address, vec![0]);
                message.store_prop(&mut prop).await?;
                None
            }
        };
        self.phase = next;
        Ok(if self.phase.is_some() {
            OpStep::Continue
        } else {
            OpStep::Done
        })
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        self.header.commit_outcome(commit);
    }
}

/// Per-controller settings download: optional restart, clock sync, cabinet
/// check, PROM version, detector reset, queue detector bitmap.
pub struct OpSendSampleSettings {
    header: OpHeader,
    format: FrameFormat,
    clock: Arc<dyn WallClock>,
    restart: bool,
    /// Bit set for each detector input wired to a queue-lane detector.
    queue_bitmap: Vec<u8>,
    version: Option<String>,
    phase: Option<SampleSettingsPhase>,
}

#[derive(Debug, Clone, Copy)]
enum SampleSettingsPhase {
    Level1Restart,
    SynchronizeClock,
    CheckCabinetType,
    QueryPromVersion,
    ResetDetectors,
    ClearDetectors,
    QueueBitmap,
}

impl OpSendSampleSettings {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        clock: Arc<dyn WallClock>,
        queue_detector_pins: &[u8],
        restart: bool,
    ) -> Self {
        let mut queue_bitmap = vec![0u8; (address::DETECTOR_INPUTS as usize).div_ceil(8)];
        for pin in queue_detector_pins {
            if let Some(input) = pin.checked_sub(address::FIRST_DETECTOR_PIN) {
                if input < address::DETECTOR_INPUTS {
                    queue_bitmap[input as usize / 8] |= 1 << (input % 8);
                }
            }
        }
        let first = if restart {
            SampleSettingsPhase::Level1Restart
        } else {
            SampleSettingsPhase::SynchronizeClock
        };
        Self {
            header: OpHeader::new(controller, PriorityLevel::Download),
            format,
            clock,
            restart,
            queue_bitmap,
            version: None,
            phase: Some(first),
        }
    }

    fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }
}

#[async_trait]
impl Operation for OpSendSampleSettings {
    fn name(&self) -> &'static str {
        "sample settings"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.header.controller.name(),
            self.name(),
            self.restart
        )
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        let Some(phase) = self.phase else {
            return Ok(OpStep::Done);
        };
        let drop = self.header.controller.drop_address();
        let next = match phase {
            SampleSettingsPhase::Level1Restart => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop = Level1RestartProperty;
                message.store_prop(&mut prop).await?;
                Some(SampleSettingsPhase::SynchronizeClock)
            }
            SampleSettingsPhase::SynchronizeClock => {
                let stamp = self.now();
                let mut message = Message::new(channel, drop, self.format);
                let mut prop = SynchronizeClockProperty::new(stamp);
                message.store_prop(&mut prop).await?;
                Some(SampleSettingsPhase::CheckCabinetType)
            }
            SampleSettingsPhase::CheckCabinetType => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop = MemoryProperty::query(address::CABINET_TYPE, 1);
                message.query_prop(&mut prop).await?;
                let dips = prop.payload()[0];
                if let Some(expected) = self.header.controller.cabinet_dip() {
                    if expected != dips {
                        self.header.fail(format!("CABINET STYLE {}", dips));
                    }
                }
                Some(SampleSettingsPhase::QueryPromVersion)
            }
            SampleSettingsPhase::QueryPromVersion => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop = MemoryProperty::query(address::PROM_VERSION, 2);
                message.query_prop(&mut prop).await?;
                let (major, minor) = (prop.payload()[0], prop.payload()[1]);
                self.version = Some(format!("{}.{}", major, minor));
                // Older firmware cannot handle the detector reset outputs.
                if major > 4 || minor > 0 {
                    Some(SampleSettingsPhase::ResetDetectors)
                } else {
                    Some(SampleSettingsPhase::QueueBitmap)
                }
            }
            SampleSettingsPhase::ResetDetectors => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop = MemoryProperty::store(
                    address::SPECIAL_FUNCTION_OUTPUTS - 1,
                    vec![address::DETECTOR_RESET],
                );
                message.store_prop(&mut prop).await?;
                Some(SampleSettingsPhase::ClearDetectors)
            }
            SampleSettingsPhase::ClearDetectors => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop =
                    MemoryProperty::store(address::SPECIAL_FUNCTION_OUTPUTS - 1, vec![0]);
                message.store_prop(&mut prop).await?;
                Some(SampleSettingsPhase::QueueBitmap)
            }
            SampleSettingsPhase::QueueBitmap => {
                let mut message = Message::new(channel, drop, self.format);
                let mut prop =
                    MemoryProperty::store(address::QUEUE_BITMAP, self.queue_bitmap.clone());
                message.store_prop(&mut prop).await?;
                None
            }
        };
        self.phase = next;
        Ok(if self.phase.is_some() {
            OpStep::Continue
        } else {
            OpStep::Done
        })
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            if let Some(version) = &self.version {
                self.header.controller.set_version(commit, version);
            }
        }
        self.header.commit_outcome(commit);
    }
}

/// Program the flash-only timing table used by warning signs.
pub struct OpSendWarningSettings {
    header: OpHeader,
    format: FrameFormat,
    sign: Arc<WarningSign>,
    timing: MeterTimingConfig,
    done: bool,
}

impl OpSendWarningSettings {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        sign: Arc<WarningSign>,
        timing: MeterTimingConfig,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Download),
            format,
            sign,
            timing,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpSendWarningSettings {
    fn name(&self) -> &'static str {
        "warning settings"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.header.controller.name(), self.name(), self.sign.name())
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let table = TimingTable::warning_sign().encode(&self.timing)?;
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let mut prop = MemoryProperty::store(address::METER_1_TIMING_TABLE, table);
        message.store_prop(&mut prop).await?;
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        self.header.commit_outcome(commit);
    }
}
