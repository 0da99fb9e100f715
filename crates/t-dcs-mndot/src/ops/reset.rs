//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Controller restart and line-silence operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;

use crate::frame::FrameFormat;
use crate::message::Message;
use crate::property::{Level1RestartProperty, ShutUpProperty};

/// Perform a level-1 restart of a 170 controller.
pub struct OpReset170 {
    header: OpHeader,
    format: FrameFormat,
    done: bool,
}

impl OpReset170 {
    pub fn new(controller: Arc<Controller>, format: FrameFormat) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Diagnostic),
            format,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpReset170 {
    fn name(&self) -> &'static str {
        "level-1 restart"
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
        let mut prop = Level1RestartProperty;
        message.store_prop(&mut prop).await?;
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        self.header.commit_outcome(commit);
    }
}

/// Silence every drop on the line. Used before address probing so a noisy
/// controller cannot answer on another drop's behalf; no response follows.
pub struct OpShutUp {
    header: OpHeader,
    format: FrameFormat,
    done: bool,
}

impl OpShutUp {
    pub fn new(controller: Arc<Controller>, format: FrameFormat) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Diagnostic),
            format,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpShutUp {
    fn name(&self) -> &'static str {
        "shut up"
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
        let mut prop = ShutUpProperty;
        message.store_prop(&mut prop).await?;
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        self.header.commit_outcome(commit);
    }
}

#[cfg(test)]
mod tests {
    use t_dcs_core::channel::ScriptedChannel;
    use t_dcs_core::operation::Operation as _;

    use super::*;

    #[tokio::test]
    async fn shut_up_writes_without_reading_a_response() {
        let controller = Arc::new(Controller::new("c101", "west-170", 7, 3, None));
        let script = ScriptedChannel::new();
        let mut op = OpShutUp::new(controller, FrameFormat::CategoryBits3);
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        assert!(op.success());
        assert_eq!(script.writes().len(), 1);
        assert_eq!(script.writes()[0][0], 7 << 3);
    }
}
