//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Lane-control signal operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, LcsArray, LcsIndication, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::{CommError, Result};

use crate::address::{self, clear_spec_func_output, get_spec_func_output, set_spec_func_output};
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::property::MemoryProperty;

/// Pin driving the lane-open head for a lane; the lane-closed head sits on
/// the next pin.
fn lane_pins(array: &LcsArray, lane: usize) -> (u8, u8) {
    let open = array.pin() + 2 * lane as u8;
    (open, open + 1)
}

/// Deploy new indications: snapshot the special function outputs, set the
/// lane bits, write the buffer back, and verify by re-reading.
///
/// Indications are correlated to hardware pins only through the pin/bit
/// mapping; a lane whose pins fall outside the 2-byte buffer is ignored.
pub struct OpSendLcsIndications {
    header: OpHeader,
    format: FrameFormat,
    array: Arc<LcsArray>,
    indications: Vec<LcsIndication>,
    owner: String,
    outputs: [u8; 2],
    phase: Option<IndicationsPhase>,
}

#[derive(Debug, Clone, Copy)]
enum IndicationsPhase {
    QueryOutputs,
    SetOutputs,
    VerifyOutputs,
}

impl OpSendLcsIndications {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        array: Arc<LcsArray>,
        indications: Vec<LcsIndication>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Command),
            format,
            array,
            indications,
            owner: owner.into(),
            outputs: [0; 2],
            phase: Some(IndicationsPhase::QueryOutputs),
        }
    }

    fn apply_indications(&mut self) {
        for (lane, indication) in self.indications.iter().enumerate() {
            let (open_pin, closed_pin) = lane_pins(&self.array, lane);
            clear_spec_func_output(&mut self.outputs, open_pin);
            clear_spec_func_output(&mut self.outputs, closed_pin);
            match indication {
                LcsIndication::Dark => {}
                LcsIndication::LaneOpen => set_spec_func_output(&mut self.outputs, open_pin),
                LcsIndication::LaneClosed => set_spec_func_output(&mut self.outputs, closed_pin),
            }
        }
    }
}

#[async_trait]
impl Operation for OpSendLcsIndications {
    fn name(&self) -> &'static str {
        "send lcs indications"
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
            self.array.name(),
            self.indications
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
            IndicationsPhase::QueryOutputs => {
                let mut prop = MemoryProperty::query(address::SPECIAL_FUNCTION_OUTPUTS, 2);
                message.query_prop(&mut prop).await?;
                self.outputs.copy_from_slice(prop.payload());
                self.apply_indications();
                Some(IndicationsPhase::SetOutputs)
            }
            IndicationsPhase::SetOutputs => {
                let mut prop = MemoryProperty::store(
                    address::SPECIAL_FUNCTION_OUTPUTS,
                    self.outputs.to_vec(),
                );
                message.store_prop(&mut prop).await?;
                Some(IndicationsPhase::VerifyOutputs)
            }
            IndicationsPhase::VerifyOutputs => {
                let mut prop = MemoryProperty::query(address::SPECIAL_FUNCTION_OUTPUTS, 2);
                message.query_prop(&mut prop).await?;
                if prop.payload() != &self.outputs[..] {
                    return Err(CommError::Controller("INDICATION VERIFY".into()));
                }
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
            self.array.set_indications(commit, self.indications.clone());
            tracing::info!(lcs = self.array.name(), owner = %self.owner,
                "indications deployed");
        }
        self.header.commit_outcome(commit);
    }
}

/// Read the special function outputs and decode the indication array.
pub struct OpQueryLcsStatus {
    header: OpHeader,
    format: FrameFormat,
    array: Arc<LcsArray>,
    decoded: Vec<LcsIndication>,
    done: bool,
}

impl OpQueryLcsStatus {
    pub fn new(controller: Arc<Controller>, format: FrameFormat, array: Arc<LcsArray>) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            array,
            decoded: Vec::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryLcsStatus {
    fn name(&self) -> &'static str {
        "query lcs status"
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
            self.array.name()
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
        self.decoded = (0..self.array.lanes() as usize)
            .map(|lane| {
                let (open_pin, closed_pin) = lane_pins(&self.array, lane);
                // A head reporting both states is treated as closed.
                if get_spec_func_output(&outputs, closed_pin) {
                    LcsIndication::LaneClosed
                } else if get_spec_func_output(&outputs, open_pin) {
                    LcsIndication::LaneOpen
                } else {
                    LcsIndication::Dark
                }
            })
            .collect();
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.array.set_indications(commit, self.decoded.clone());
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
                { name = "L94W30", pin = 19, kind = { type = "lcs-array", lanes = 3 } },
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
    async fn indications_deploy_with_verify() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let array = registry.lcs("L94W30").expect("lcs");
        let indications = vec![
            LcsIndication::LaneOpen,
            LcsIndication::LaneClosed,
            LcsIndication::Dark,
        ];

        // lane 0 open -> pin 19 (bit 0), lane 1 closed -> pin 22 (bit 3);
        // bits above the lane pins (6, 7 and byte 1) keep their stale state.
        let expected = [0b1100_1001u8, 0x03];

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, &[0xff, 0x03])); // stale outputs
        script.push_read(&frame(7, &[])); // write ack
        script.push_read(&frame(7, &expected)); // verify read

        let mut op = OpSendLcsIndications::new(
            controller,
            FrameFormat::CategoryBits3,
            array.clone(),
            indications.clone(),
            "operator",
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let mut steps = 0;
        loop {
            steps += 1;
            match op.poll(channel.as_mut()).await.expect("poll") {
                OpStep::Continue => continue,
                OpStep::Done => break,
            }
        }
        assert_eq!(steps, 3);

        // Lane bits were rewritten; pins outside the lanes kept their state.
        let write = &script.writes()[1];
        assert_eq!(&write[4..6], &expected);

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert_eq!(array.indications(), indications);
    }

    #[tokio::test]
    async fn verify_mismatch_fails_the_operation() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let array = registry.lcs("L94W30").expect("lcs");

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, &[0, 0]));
        script.push_read(&frame(7, &[]));
        script.push_read(&frame(7, &[0, 0])); // verify disagrees

        let mut op = OpSendLcsIndications::new(
            controller,
            FrameFormat::CategoryBits3,
            array.clone(),
            vec![LcsIndication::LaneOpen],
            "operator",
        );
        let mut channel: Box<dyn Channel> = Box::new(script);
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Continue)));
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Continue)));
        let err = op.poll(channel.as_mut()).await.expect_err("verify fails");
        assert!(matches!(err, CommError::Controller(_)));

        op.header_mut().fail_on(&err);
        let commit = registry.commit_handle();
        op.cleanup(&commit);
        // Failed deploys leave the indication array untouched.
        assert_eq!(array.indications(), vec![LcsIndication::Dark; 3]);
    }

    #[tokio::test]
    async fn status_query_decodes_lanes() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let array = registry.lcs("L94W30").expect("lcs");

        // lane 0 open (bit 0), lane 1 closed (bit 3), lane 2 dark.
        let script = ScriptedChannel::new();
        script.push_read(&frame(7, &[0b0000_1001, 0]));

        let mut op = OpQueryLcsStatus::new(controller, FrameFormat::CategoryBits3, array.clone());
        let mut channel: Box<dyn Channel> = Box::new(script);
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert_eq!(
            array.indications(),
            vec![
                LcsIndication::LaneOpen,
                LcsIndication::LaneClosed,
                LcsIndication::Dark
            ]
        );
    }
}
