//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "dmslite transport adapter over a link channel."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use t_dcs_core::channel::Channel;
use t_dcs_core::Result;
use tracing::trace;

use crate::reqres::ReqRes;
use crate::token::TokenStreamReader;
use crate::xml;

/// Outer document tag of every dmslite exchange.
pub const DMSLITE_TAG: &str = "DmsLite";

/// Source of unique message ids.
///
/// One owned counter per poller, seeded from the wall clock at startup so
/// ids stay unique across restarts; no process-global random state.
#[derive(Debug)]
pub struct MsgIdSource(AtomicU64);

impl MsgIdSource {
    pub fn new(seed: u64) -> Self {
        Self(AtomicU64::new(seed))
    }

    pub fn next_id(&self) -> String {
        self.0.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Transport adapter for one sign exchange: builds the request document,
/// reads one bounded reply token, and fills in each [`ReqRes`].
pub struct Message<'a> {
    channel: &'a mut dyn Channel,
    reader: TokenStreamReader,
    req_msg_name: String,
    resp_msg_name: String,
    timeout: Duration,
    completion_time: Option<Duration>,
    objects: Vec<ReqRes>,
}

impl<'a> Message<'a> {
    pub fn new(
        channel: &'a mut dyn Channel,
        req_msg_name: impl Into<String>,
        resp_msg_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            reader: TokenStreamReader::default(),
            req_msg_name: req_msg_name.into(),
            resp_msg_name: resp_msg_name.into(),
            timeout,
            completion_time: None,
            objects: Vec::new(),
        }
    }

    /// Add a request/response unit to this message.
    pub fn add(&mut self, rr: ReqRes) {
        self.objects.push(rr);
    }

    /// Time the last exchange took, for completion notes.
    pub fn completion_time(&self) -> Option<Duration> {
        self.completion_time
    }

    /// Build the request document:
    /// `<DmsLite><ReqMsg><field>value</field>...</ReqMsg></DmsLite>`.
    pub fn build_request(&self) -> String {
        let mut children = String::with_capacity(256);
        for rr in &self.objects {
            xml::add_tag(&mut children, rr.req_name(), rr.req_val());
        }
        let mut msg = String::with_capacity(384);
        xml::add_tag(&mut msg, &self.req_msg_name, &children);
        let mut doc = String::with_capacity(384);
        xml::add_tag(&mut doc, DMSLITE_TAG, &msg);
        doc
    }

    /// Execute the exchange and parse every response field.
    pub async fn exchange(&mut self) -> Result<()> {
        let doc = self.build_request();
        trace!(msg = %self.req_msg_name, bytes = doc.len(), "sending request");
        let started = Instant::now();
        self.reader.reset();
        self.channel.write_all(doc.as_bytes()).await?;

        let start_tag = format!("<{}>", DMSLITE_TAG);
        let end_tag = format!("</{}>", DMSLITE_TAG);
        let token = self
            .reader
            .read_token(&mut *self.channel, &start_tag, &end_tag, self.timeout)
            .await?;
        self.completion_time = Some(started.elapsed());
        trace!(msg = %self.resp_msg_name, ms = started.elapsed().as_millis() as u64,
            "response received");

        for rr in &mut self.objects {
            rr.parse_res(&self.resp_msg_name, &token)?;
        }
        Ok(())
    }

    /// Search every unit for a request or response value by name.
    pub fn search(&self, name: &str) -> Option<&str> {
        self.objects.iter().find_map(|rr| rr.search(name))
    }
}

#[cfg(test)]
mod tests {
    use t_dcs_core::channel::ScriptedChannel;
    use t_dcs_core::CommError;

    use super::*;

    #[tokio::test]
    async fn exchange_round_trips_request_and_response() {
        let script = ScriptedChannel::new();
        script.push_read(
            b"<DmsLite><StatusRespMsg><IsValid>true</IsValid>\
              <MsgText>RAMP CLOSED</MsgText></StatusRespMsg></DmsLite>",
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let mut message = Message::new(
            channel.as_mut(),
            "StatusReqMsg",
            "StatusRespMsg",
            Duration::from_secs(1),
        );
        message.add(ReqRes::with_responses(
            "Address",
            "22",
            &["IsValid", "MsgText"],
        ));
        message.exchange().await.expect("exchange");

        assert_eq!(message.search("IsValid"), Some("true"));
        assert_eq!(message.search("MsgText"), Some("RAMP CLOSED"));
        assert_eq!(message.search("Address"), Some("22"));

        let sent = String::from_utf8(script.writes()[0].clone()).expect("utf8");
        assert_eq!(
            sent,
            "<DmsLite><StatusReqMsg><Address>22</Address></StatusReqMsg></DmsLite>"
        );
    }

    #[tokio::test]
    async fn silent_sign_times_out() {
        let script = ScriptedChannel::new();
        let mut channel: Box<dyn Channel> = Box::new(script);
        let mut message = Message::new(
            channel.as_mut(),
            "StatusReqMsg",
            "StatusRespMsg",
            Duration::from_millis(50),
        );
        message.add(ReqRes::with_responses("Address", "22", &["IsValid"]));
        let err = message.exchange().await.expect_err("timeout");
        assert!(matches!(err, CommError::Timeout));
    }

    #[test]
    fn id_source_is_monotonic() {
        let ids = MsgIdSource::new(1000);
        assert_eq!(ids.next_id(), "1000");
        assert_eq!(ids.next_id(), "1001");
    }
}
