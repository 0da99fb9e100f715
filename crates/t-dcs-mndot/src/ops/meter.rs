//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Ramp meter command operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, RampMeter, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;

use crate::address;
use crate::bcd;
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::meter::MeterRateCode;
use crate::property::MemoryProperty;

/// Write a remote red time (tenths of a second, BCD) into the meter's data
/// block. The meter's committed release rate is updated only in cleanup.
pub struct OpSendMeterRedTime {
    header: OpHeader,
    format: FrameFormat,
    meter: Arc<RampMeter>,
    meter_number: u8,
    red_tenths: u32,
    /// Release rate the red time was derived from, committed on success.
    rate: u32,
    done: bool,
}

impl OpSendMeterRedTime {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        meter: Arc<RampMeter>,
        meter_number: u8,
        red_tenths: u32,
        rate: u32,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Command),
            format,
            meter,
            meter_number,
            red_tenths,
            rate,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpSendMeterRedTime {
    fn name(&self) -> &'static str {
        "send red time"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.header.controller.name(),
            self.name(),
            self.meter.name(),
            self.red_tenths
        )
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let red = bcd::bcd4_encode(self.red_tenths)?;
        let address =
            address::meter_data(self.meter_number) + address::OFF_REMOTE_RED_TIME;
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let mut prop = MemoryProperty::store(address, red.to_vec());
        message.store_prop(&mut prop).await?;
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.meter.set_rate(commit, Some(self.rate));
        }
        self.header.commit_outcome(commit);
    }
}

/// Write a metering rate code (central, time-of-day, flash) into the
/// meter's data block.
pub struct OpSendMeterRate {
    header: OpHeader,
    format: FrameFormat,
    meter: Arc<RampMeter>,
    meter_number: u8,
    code: MeterRateCode,
    done: bool,
}

impl OpSendMeterRate {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        meter: Arc<RampMeter>,
        meter_number: u8,
        code: MeterRateCode,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Command),
            format,
            meter,
            meter_number,
            code,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpSendMeterRate {
    fn name(&self) -> &'static str {
        "send meter rate"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!(
            "{}:{}:{}:{:?}",
            self.header.controller.name(),
            self.name(),
            self.meter.name(),
            self.code
        )
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let address = address::meter_data(self.meter_number) + address::OFF_REMOTE_RATE;
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let mut prop = MemoryProperty::store(address, vec![self.code as u8]);
        message.store_prop(&mut prop).await?;
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.meter.set_metering(commit, self.code.is_metering());
            if self.code == MeterRateCode::ForcedFlash {
                self.meter.set_rate(commit, None);
            }
        }
        self.header.commit_outcome(commit);
    }
}
