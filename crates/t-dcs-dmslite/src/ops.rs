//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Dynamic message sign operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Sign operations. Every exchange answers with an `IsValid` flag; a false
//! answer with an error message is a recoverable condition, retried within
//! the controller's budget before the error text becomes the operation's
//! terminal status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, Dms, SignConfig, SignMessage, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::{CommError, Result};
use tracing::debug;

use crate::message::{Message, MsgIdSource};
use crate::reqres::ReqRes;
use crate::BM_PGLEN_BYTES;

/// Page separator used when a multi-page deployment is flattened to text.
const PAGE_SEPARATOR: &str = "[np]";

/// Outcome of an exchange that answered with `IsValid`.
enum SignResponse {
    Valid,
    Invalid(String),
}

fn check_valid(message: &Message<'_>) -> SignResponse {
    match message.search("IsValid") {
        Some(v) if v.eq_ignore_ascii_case("true") => SignResponse::Valid,
        _ => SignResponse::Invalid(
            message
                .search("ErrMsg")
                .filter(|msg| !msg.is_empty())
                .unwrap_or("unknown sign error")
                .to_owned(),
        ),
    }
}

fn parse_u32(message: &Message<'_>, name: &str) -> Result<u32> {
    let raw = message
        .search(name)
        .ok_or_else(|| CommError::Parsing(format!("response field {} missing", name)))?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| CommError::Parsing(format!("field {} is not numeric: {}", name, raw)))
}

/// Shared retry bookkeeping: count an invalid answer against the
/// controller's budget and decide whether to run the phase again.
struct RetryBudget {
    attempts: u8,
}

impl RetryBudget {
    fn new() -> Self {
        Self { attempts: 0 }
    }

    fn should_retry(&mut self, controller: &Controller) -> bool {
        self.attempts += 1;
        controller.should_retry(self.attempts)
    }
}

/// Query sign identification and geometry.
pub struct OpQueryConfig {
    header: OpHeader,
    dms: Arc<Dms>,
    ids: Arc<MsgIdSource>,
    timeout: Duration,
    retry: RetryBudget,
    config: Option<SignConfig>,
    done: bool,
}

impl OpQueryConfig {
    pub fn new(
        controller: Arc<Controller>,
        dms: Arc<Dms>,
        ids: Arc<MsgIdSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Download),
            dms,
            ids,
            timeout,
            retry: RetryBudget::new(),
            config: None,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryConfig {
    fn name(&self) -> &'static str {
        "query sign config"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.header.controller.name(), self.name(), self.dms.name())
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let mut message = Message::new(
            channel,
            "GetDmsConfigReqMsg",
            "GetDmsConfigRespMsg",
            self.timeout,
        );
        message.add(ReqRes::with_responses(
            "Id",
            self.ids.next_id(),
            &[
                "IsValid",
                "ErrMsg",
                "make",
                "model",
                "version",
                "signAccess",
                "type",
                "horizBorder",
                "vertBorder",
                "horizPitch",
                "vertPitch",
                "characterHeightPixels",
                "characterWidthPixels",
                "signHeightPixels",
                "signWidthPixels",
            ],
        ));
        message.add(ReqRes::new(
            "Address",
            self.header.controller.drop_address().to_string(),
        ));
        message.exchange().await?;

        match check_valid(&message) {
            SignResponse::Valid => {
                self.config = Some(SignConfig {
                    make: message.search("make").unwrap_or_default().to_owned(),
                    model: message.search("model").unwrap_or_default().to_owned(),
                    version: message.search("version").unwrap_or_default().to_owned(),
                    sign_access: message.search("signAccess").unwrap_or_default().to_owned(),
                    sign_type: message.search("type").unwrap_or_default().to_owned(),
                    horiz_border: parse_u32(&message, "horizBorder")?,
                    vert_border: parse_u32(&message, "vertBorder")?,
                    horiz_pitch: parse_u32(&message, "horizPitch")?,
                    vert_pitch: parse_u32(&message, "vertPitch")?,
                    char_width_px: parse_u32(&message, "characterWidthPixels")?,
                    char_height_px: parse_u32(&message, "characterHeightPixels")?,
                    sign_width_px: parse_u32(&message, "signWidthPixels")?,
                    sign_height_px: parse_u32(&message, "signHeightPixels")?,
                });
                self.done = true;
                Ok(OpStep::Done)
            }
            SignResponse::Invalid(errmsg) => {
                if self.retry.should_retry(&self.header.controller) {
                    debug!(dms = self.dms.name(), attempts = self.retry.attempts,
                        error = %errmsg, "retrying config query");
                    Ok(OpStep::Continue)
                } else {
                    self.header.fail(errmsg);
                    self.done = true;
                    Ok(OpStep::Done)
                }
            }
        }
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            if let Some(config) = self.config.take() {
                self.dms.set_config(commit, config);
                self.dms.set_configured(commit, true);
            }
        } else {
            self.dms.set_configured(commit, false);
        }
        self.header.commit_outcome(commit);
    }
}

/// Query the message currently displayed on the sign face.
pub struct OpQueryMsg {
    header: OpHeader,
    dms: Arc<Dms>,
    ids: Arc<MsgIdSource>,
    timeout: Duration,
    retry: RetryBudget,
    text: String,
    owner: String,
    done: bool,
}

impl OpQueryMsg {
    pub fn new(
        controller: Arc<Controller>,
        dms: Arc<Dms>,
        ids: Arc<MsgIdSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            dms,
            ids,
            timeout,
            retry: RetryBudget::new(),
            text: String::new(),
            owner: String::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryMsg {
    fn name(&self) -> &'static str {
        "query sign message"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.header.controller.name(), self.name(), self.dms.name())
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let mut message = Message::new(channel, "StatusReqMsg", "StatusRespMsg", self.timeout);
        message.add(ReqRes::with_responses(
            "Id",
            self.ids.next_id(),
            &["IsValid", "ErrMsg", "MsgTextAvailable", "MsgText", "Owner"],
        ));
        message.add(ReqRes::new(
            "Address",
            self.header.controller.drop_address().to_string(),
        ));
        message.exchange().await?;

        match check_valid(&message) {
            SignResponse::Valid => {
                let available = message
                    .search("MsgTextAvailable")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                if available {
                    self.text = message.search("MsgText").unwrap_or_default().to_owned();
                    self.owner = message.search("Owner").unwrap_or_default().to_owned();
                }
                self.done = true;
                Ok(OpStep::Done)
            }
            SignResponse::Invalid(errmsg) => {
                if self.retry.should_retry(&self.header.controller) {
                    Ok(OpStep::Continue)
                } else {
                    self.header.fail(errmsg);
                    self.done = true;
                    Ok(OpStep::Done)
                }
            }
        }
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.dms.set_message(commit, &self.text, &self.owner);
        }
        self.header.commit_outcome(commit);
    }
}

/// Query sign temperatures.
pub struct OpQueryStatus {
    header: OpHeader,
    dms: Arc<Dms>,
    ids: Arc<MsgIdSource>,
    timeout: Duration,
    retry: RetryBudget,
    temps: Option<(i32, i32)>,
    done: bool,
}

impl OpQueryStatus {
    pub fn new(
        controller: Arc<Controller>,
        dms: Arc<Dms>,
        ids: Arc<MsgIdSource>,
        timeout: Duration,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Diagnostic),
            dms,
            ids,
            timeout,
            retry: RetryBudget::new(),
            temps: None,
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryStatus {
    fn name(&self) -> &'static str {
        "query sign status"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    fn key(&self) -> String {
        format!("{}:{}:{}", self.header.controller.name(), self.name(), self.dms.name())
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let mut message = Message::new(channel, "StatusReqMsg", "StatusRespMsg", self.timeout);
        message.add(ReqRes::with_responses(
            "Id",
            self.ids.next_id(),
            &["IsValid", "ErrMsg", "MinTemp", "MaxTemp"],
        ));
        message.add(ReqRes::new(
            "Address",
            self.header.controller.drop_address().to_string(),
        ));
        message.exchange().await?;

        match check_valid(&message) {
            SignResponse::Valid => {
                let min = message
                    .search("MinTemp")
                    .and_then(|v| v.trim().parse::<i32>().ok());
                let max = message
                    .search("MaxTemp")
                    .and_then(|v| v.trim().parse::<i32>().ok());
                if let (Some(min), Some(max)) = (min, max) {
                    self.temps = Some((min, max));
                }
                self.done = true;
                Ok(OpStep::Done)
            }
            SignResponse::Invalid(errmsg) => {
                if self.retry.should_retry(&self.header.controller) {
                    Ok(OpStep::Continue)
                } else {
                    self.header.fail(errmsg);
                    self.done = true;
                    Ok(OpStep::Done)
                }
            }
        }
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            if let Some((min, max)) = self.temps {
                self.dms.set_temperatures(commit, Some(min), Some(max));
            }
        }
        self.header.commit_outcome(commit);
    }
}

/// Deploy a message to the sign face. A blank single page clears the sign.
pub struct OpSendMessage {
    header: OpHeader,
    dms: Arc<Dms>,
    ids: Arc<MsgIdSource>,
    message: SignMessage,
    timeout: Duration,
    retry: RetryBudget,
    done: bool,
}

impl OpSendMessage {
    pub fn new(
        controller: Arc<Controller>,
        dms: Arc<Dms>,
        ids: Arc<MsgIdSource>,
        message: SignMessage,
        timeout: Duration,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Command),
            dms,
            ids,
            message,
            timeout,
            retry: RetryBudget::new(),
            done: false,
        }
    }

    fn flattened_text(&self) -> String {
        self.message
            .pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR)
    }

    fn bitmap_hex(&self) -> Result<String> {
        let mut bitmap = Vec::with_capacity(BM_PGLEN_BYTES * self.message.pages.len());
        for page in &self.message.pages {
            if page.bitmap.len() != BM_PGLEN_BYTES {
                return Err(CommError::Encoding(format!(
                    "page bitmap of {} bytes, expected {}",
                    page.bitmap.len(),
                    BM_PGLEN_BYTES
                )));
            }
            bitmap.extend_from_slice(&page.bitmap);
        }
        Ok(hex::encode_upper(bitmap))
    }

    fn msg_names(&self) -> (&'static str, &'static str) {
        if self.message.pages.len() > 1 {
            ("SetMultPgReqMsg", "SetMultPgRespMsg")
        } else {
            ("SetSnglPgReqMsg", "SetSnglPgRespMsg")
        }
    }
}

#[async_trait]
impl Operation for OpSendMessage {
    fn name(&self) -> &'static str {
        "send sign message"
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
            self.dms.name(),
            self.flattened_text()
        )
    }

    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        let bitmap = self.bitmap_hex()?;
        let (req_name, resp_name) = self.msg_names();
        let multi_page = self.message.pages.len() > 1;

        let mut message = Message::new(channel, req_name, resp_name, self.timeout);
        message.add(ReqRes::with_responses(
            "Id",
            self.ids.next_id(),
            &["IsValid", "ErrMsg"],
        ));
        message.add(ReqRes::new(
            "Address",
            self.header.controller.drop_address().to_string(),
        ));
        message.add(ReqRes::new("MsgText", self.flattened_text()));
        match self.message.on_time {
            Some(on_time) => {
                message.add(ReqRes::new("UseOnTime", "true"));
                message.add(ReqRes::new("OnTime", on_time.to_rfc3339()));
            }
            None => {
                message.add(ReqRes::new("UseOnTime", "false"));
                message.add(ReqRes::new("OnTime", ""));
            }
        }
        match self.message.off_time {
            Some(off_time) => {
                message.add(ReqRes::new("UseOffTime", "true"));
                message.add(ReqRes::new("OffTime", off_time.to_rfc3339()));
            }
            None => {
                message.add(ReqRes::new("UseOffTime", "false"));
                message.add(ReqRes::new("OffTime", ""));
            }
        }
        if multi_page {
            let display_ms = self
                .message
                .pages
                .first()
                .and_then(|p| p.display_time)
                .unwrap_or(Duration::from_millis(2000))
                .as_millis();
            message.add(ReqRes::new("DisplayTimeMS", display_ms.to_string()));
        }
        message.add(ReqRes::new(
            "ActPriority",
            self.message.activation_priority.to_string(),
        ));
        message.add(ReqRes::new(
            "RunPriority",
            self.message.run_priority.to_string(),
        ));
        message.add(ReqRes::new("Owner", self.message.owner.clone()));
        message.add(ReqRes::new("Bitmap", bitmap));
        message.exchange().await?;

        match check_valid(&message) {
            SignResponse::Valid => {
                self.done = true;
                Ok(OpStep::Done)
            }
            SignResponse::Invalid(errmsg) => {
                if self.retry.should_retry(&self.header.controller) {
                    debug!(dms = self.dms.name(), attempts = self.retry.attempts,
                        error = %errmsg, "retrying message deployment");
                    Ok(OpStep::Continue)
                } else {
                    self.header.fail(errmsg);
                    self.done = true;
                    Ok(OpStep::Done)
                }
            }
        }
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            self.dms
                .set_message(commit, &self.flattened_text(), &self.message.owner);
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

    fn registry() -> DeviceRegistry {
        let config: AppConfig = r#"
            [links.cms-east]
            uri = "x:1"
            protocol = "dms-lite"
            [links.cms-east.controllers.v94e22]
            drop = 22
            retry_threshold = 3
            devices = [
                { name = "V94E22", pin = 1, kind = { type = "dms", sign_access = "wizard" } },
            ]
        "#
        .parse()
        .expect("config");
        DeviceRegistry::from_config(&config)
    }

    fn valid_status_resp(text: &str) -> String {
        format!(
            "<DmsLite><StatusRespMsg><IsValid>true</IsValid><ErrMsg></ErrMsg>\
             <MsgTextAvailable>true</MsgTextAvailable><MsgText>{}</MsgText>\
             <Owner>aws</Owner></StatusRespMsg></DmsLite>",
            text
        )
    }

    fn invalid_resp(msg_name: &str, errmsg: &str) -> String {
        format!(
            "<DmsLite><{0}><IsValid>false</IsValid><ErrMsg>{1}</ErrMsg>\
             <MsgTextAvailable>false</MsgTextAvailable><MsgText></MsgText>\
             <Owner></Owner></{0}></DmsLite>",
            msg_name, errmsg
        )
    }

    fn sngl_page_resp(valid: bool, errmsg: &str) -> String {
        format!(
            "<DmsLite><SetSnglPgRespMsg><IsValid>{}</IsValid><ErrMsg>{}</ErrMsg>\
             </SetSnglPgRespMsg></DmsLite>",
            valid, errmsg
        )
    }

    #[tokio::test]
    async fn query_msg_commits_text_in_cleanup() {
        let registry = registry();
        let controller = registry.controller("v94e22").expect("controller");
        let dms = registry.dms("V94E22").expect("dms");

        let script = ScriptedChannel::new();
        script.push_read(valid_status_resp("I-94 EB CLOSED").as_bytes());

        let mut op = OpQueryMsg::new(
            controller,
            dms.clone(),
            Arc::new(MsgIdSource::new(1)),
            Duration::from_secs(1),
        );
        let mut channel: Box<dyn Channel> = Box::new(script);
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        assert_eq!(dms.message_text(), "");

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert_eq!(dms.message_text(), "I-94 EB CLOSED");
        assert_eq!(dms.message_owner(), "aws");
    }

    #[tokio::test]
    async fn invalid_answers_retry_until_the_budget_is_spent() {
        let registry = registry();
        let controller = registry.controller("v94e22").expect("controller");
        let dms = registry.dms("V94E22").expect("dms");

        let script = ScriptedChannel::new();
        for _ in 0..3 {
            script.push_read(invalid_resp("StatusRespMsg", "SIGN OFFLINE").as_bytes());
        }

        let mut op = OpQueryMsg::new(
            controller,
            dms.clone(),
            Arc::new(MsgIdSource::new(1)),
            Duration::from_secs(1),
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Continue)));
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Continue)));
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));
        assert!(!op.success());
        assert_eq!(op.header().error_status(), Some("SIGN OFFLINE"));
        assert_eq!(script.writes().len(), 3);
    }

    #[tokio::test]
    async fn send_message_deploys_a_single_page() {
        let registry = registry();
        let controller = registry.controller("v94e22").expect("controller");
        let dms = registry.dms("V94E22").expect("dms");

        let script = ScriptedChannel::new();
        script.push_read(sngl_page_resp(true, "").as_bytes());

        let mut deployment = SignMessage::blank("operator", BM_PGLEN_BYTES);
        deployment.pages[0].text = "CRASH AHEAD".to_owned();
        let mut op = OpSendMessage::new(
            controller,
            dms.clone(),
            Arc::new(MsgIdSource::new(77)),
            deployment,
            Duration::from_secs(1),
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        assert!(matches!(op.poll(channel.as_mut()).await, Ok(OpStep::Done)));

        let sent = String::from_utf8(script.writes()[0].clone()).expect("utf8");
        assert!(sent.starts_with("<DmsLite><SetSnglPgReqMsg>"));
        assert!(sent.contains("<Id>77</Id>"));
        assert!(sent.contains("<Address>22</Address>"));
        assert!(sent.contains("<MsgText>CRASH AHEAD</MsgText>"));
        assert!(sent.contains("<UseOnTime>false</UseOnTime>"));
        assert!(sent.contains(&format!("<Bitmap>{}</Bitmap>", "0".repeat(600))));

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert_eq!(dms.message_text(), "CRASH AHEAD");
        assert_eq!(dms.message_owner(), "operator");
    }

    #[tokio::test]
    async fn wrong_bitmap_length_is_rejected_before_sending() {
        let registry = registry();
        let controller = registry.controller("v94e22").expect("controller");
        let dms = registry.dms("V94E22").expect("dms");

        let mut deployment = SignMessage::blank("operator", BM_PGLEN_BYTES - 1);
        deployment.pages[0].text = "X".to_owned();
        let mut op = OpSendMessage::new(
            controller,
            dms,
            Arc::new(MsgIdSource::new(1)),
            deployment,
            Duration::from_secs(1),
        );
        let script = ScriptedChannel::new();
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let err = op.poll(channel.as_mut()).await.expect_err("bad bitmap");
        assert!(matches!(err, CommError::Encoding(_)));
        assert!(script.writes().is_empty());
    }
}
