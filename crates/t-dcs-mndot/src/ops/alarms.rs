//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Alarm input operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Alarm, Controller, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;

use crate::address;
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::property::MemoryProperty;

/// Read the alarm input bitmap and commit triggered flags.
pub struct OpQueryAlarms {
    header: OpHeader,
    format: FrameFormat,
    alarms: Vec<Arc<Alarm>>,
    inputs: [u8; 2],
    done: bool,
}

impl OpQueryAlarms {
    pub fn new(controller: Arc<Controller>, format: FrameFormat, alarms: Vec<Arc<Alarm>>) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            alarms,
            inputs: [0; 2],
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryAlarms {
    fn name(&self) -> &'static str {
        "query alarms"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let mut prop = MemoryProperty::query(address::ALARM_INPUTS, 2);
        message.query_prop(&mut prop).await?;
        self.inputs.copy_from_slice(prop.payload());
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            for alarm in &self.alarms {
                if let Some(index) = alarm.pin().checked_sub(address::FIRST_ALARM_PIN) {
                    if index < address::ALARM_INPUT_COUNT {
                        let triggered =
                            self.inputs[index as usize / 8] & (1 << (index % 8)) != 0;
                        alarm.set_triggered(commit, triggered);
                    }
                }
            }
        }
        self.header.commit_outcome(commit);
    }
}

#[cfg(test)]
mod tests {
    use t_dcs_common::config::AppConfig;
    use t_dcs_core::channel::ScriptedChannel;
    use t_dcs_core::devices::DeviceRegistry;

    use super::*;
    use crate::bcd;

    #[tokio::test]
    async fn alarm_bitmap_maps_pins_to_triggered_flags() {
        let config: AppConfig = r#"
            [links.west-170]
            uri = "x:1"
            protocol = "mndot-5"
            [links.west-170.controllers.c101]
            drop = 7
            devices = [
                { name = "A-DOOR", pin = 70, kind = { type = "alarm" } },
                { name = "A-POWER", pin = 73, kind = { type = "alarm" } },
            ]
        "#
        .parse()
        .expect("config");
        let registry = DeviceRegistry::from_config(&config);
        let controller = registry.controller("c101").expect("controller");

        let mut frame = vec![7 << 3, 2, 0b0000_1001, 0, 0];
        bcd::seal(&mut frame);
        let script = ScriptedChannel::new();
        script.push_read(&frame);

        let mut op = OpQueryAlarms::new(
            controller,
            FrameFormat::CategoryBits3,
            registry.alarms_on("c101"),
        );
        let mut channel: Box<dyn Channel> = Box::new(script);
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        let commit = registry.commit_handle();
        op.cleanup(&commit);

        let alarms = registry.alarms_on("c101");
        assert!(alarms[0].triggered()); // pin 70 -> bit 0
        assert!(alarms[1].triggered()); // pin 73 -> bit 3
    }
}
