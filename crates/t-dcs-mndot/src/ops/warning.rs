//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Warning sign operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, StatusCommit, WarningSign};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;

use crate::address::{self, clear_spec_func_output, get_spec_func_output, set_spec_func_output};
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::property::MemoryProperty;

/// Deploy or undeploy a warning sign by flipping its special function
/// output: read the buffer, set or clear the sign's bit, write it back.
pub struct OpSendWarningCommand {
    header: OpHeader,
    format: FrameFormat,
    sign: Arc<WarningSign>,
    deploy: bool,
    outputs: [u8; 2],
    phase: Option<CommandPhase>,
}

#[derive(Debug, Clone, Copy)]
enum CommandPhase {
    QueryOutputs,
    SetOutputs,
}

impl OpSendWarningCommand {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        sign: Arc<WarningSign>,
        deploy: bool,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Command),
            format,
            sign,
            deploy,
            outputs: [0; 2],
            phase: Some(CommandPhase::QueryOutputs),
        }
    }
}

#[async_trait]
impl Operation for OpSendWarningCommand {
    fn name(&self) -> &'static str {
        "send warning command"
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
            self.sign.name(),
            self.deploy
        )
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
            CommandPhase::QueryOutputs => {
                let mut prop = MemoryProperty::query(address::SPECIAL_FUNCTION_OUTPUTS, 2);
                message.query_prop(&mut prop).await?;
                self.outputs.copy_from_slice(prop.payload());
                if self.deploy {
                    set_spec_func_output(&mut self.outputs, self.sign.pin());
                } else {
                    clear_spec_func_output(&mut self.outputs, self.sign.pin());
                }
                Some(CommandPhase::SetOutputs)
            }
            CommandPhase::SetOutputs => {
                let mut prop = MemoryProperty::store(
                    address::SPECIAL_FUNCTION_OUTPUTS,
                    self.outputs.to_vec(),
                );
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
            self.sign.set_deployed(commit, self.deploy);
        }
        self.header.commit_outcome(commit);
    }
}

/// Read the deployed state of a warning sign from the output buffer.
pub struct OpQueryWarningStatus {
    header: OpHeader,
    format: FrameFormat,
    sign: Arc<WarningSign>,
    deployed: bool,
    done: bool,
}

impl OpQueryWarningStatus {
    pub fn new(controller: Arc<Controller>, format: FrameFormat, sign: Arc<WarningSign>) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            sign,
            deployed: false,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryWarningStatus {
    fn name(&self) -> &'static str {
        "query warning status"
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
            self.sign.name()
        )
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
        let mut prop = MemoryProperty::query(address::SPECIAL_FUNCTION_OUTPUTS, 2);
        message.query_prop(&mut prop).await?;
        let mut outputs = [0u8; 2];
        outputs.copy_from_slice(prop.payload());
        self.deployed = get_spec_func_output(&outputs, self.sign.pin());
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.sign.set_deployed(commit, self.deployed);
        }
        self.header.commit_outcome(commit);
    }
}

#[cfg(test)]
mod tests {
    use t_dcs_common::config::AppConfig;
    use t_dcs_core::channel::ScriptedChannel;
    use t_dcs_core::devices::DeviceRegistry;
    use t_dcs_core::operation::Operation as _;

    use super::*;
    use crate::bcd;

    fn registry() -> DeviceRegistry {
        let config: AppConfig = r#"
            [links.west-170]
            uri = "x:1"
            protocol = "mndot-5"
            [links.west-170.controllers.c101]
            drop = 7
            devices = [
                { name = "W35W25", pin = 21, kind = { type = "warning-sign" } },
            ]
        "#
        .parse()
        .expect("config");
        DeviceRegistry::from_config(&config)
    }

    fn frame(drop: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![drop << 3, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(0);
        bcd::seal(&mut frame);
        frame
    }

    #[tokio::test]
    async fn deploy_sets_the_sign_bit_and_commits() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let sign = registry.warning_sign("W35W25").expect("sign");

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, &[0, 0]));
        script.push_read(&frame(7, &[]));

        let mut op = OpSendWarningCommand::new(
            controller,
            FrameFormat::CategoryBits3,
            sign.clone(),
            true,
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Continue)));
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));

        // Pin 21 is bit 2 of the first output byte.
        assert_eq!(&script.writes()[1][4..6], &[0b0000_0100, 0]);
        assert!(!sign.deployed());
        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert!(sign.deployed());
    }

    #[tokio::test]
    async fn status_query_reads_the_sign_bit() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let sign = registry.warning_sign("W35W25").expect("sign");

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, &[0b0000_0100, 0]));
        let mut op =
            OpQueryWarningStatus::new(controller, FrameFormat::CategoryBits3, sign.clone());
        let mut channel: Box<dyn Channel> = Box::new(script);
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert!(sign.deployed());
    }
}
