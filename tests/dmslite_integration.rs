//! ---
//! tdcs_section: "15-testing-qa-runbook"
//! tdcs_subsection: "integration"
//! tdcs_type: "source"
//! tdcs_scope: "test"
//! tdcs_description: "End-to-end dmslite scenarios over a scripted channel."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use t_dcs_common::config::AppConfig;
use t_dcs_common::time::SystemClock;
use t_dcs_core::channel::ScriptedChannel;
use t_dcs_core::devices::{DeviceEvent, DeviceRegistry, SignMessage};
use t_dcs_core::link::CommLink;
use t_dcs_core::poller::{DeviceRequest, SignPoller};
use t_dcs_dmslite::{DmsLitePoller, BM_PGLEN_BYTES};
use tokio::sync::broadcast;

fn test_config() -> AppConfig {
    r#"
        [links.cms-east]
        uri = "10.1.9.3:9001"
        protocol = "dms-lite"

        [links.cms-east.controllers.v94e22]
        drop = 22
        retry_threshold = 3
        devices = [
            { name = "V94E22", pin = 1, kind = { type = "dms", sign_access = "wizard" } },
        ]
    "#
    .parse()
    .expect("test config")
}

async fn wait_for_field(
    events: &mut broadcast::Receiver<DeviceEvent>,
    device: &str,
    field: &str,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open");
        if event.device == device && event.field == field {
            return;
        }
    }
}

#[tokio::test]
async fn query_message_updates_the_sign_after_cleanup() {
    let config = test_config();
    let registry = Arc::new(DeviceRegistry::from_config(&config));
    let dms = registry.dms("V94E22").expect("dms");
    let mut events = registry.subscribe();

    let script = ScriptedChannel::new();
    script.push_read(
        b"<DmsLite><StatusRespMsg><IsValid>true</IsValid><ErrMsg></ErrMsg>\
          <MsgTextAvailable>true</MsgTextAvailable><MsgText>I-94 EB CLOSED</MsgText>\
          <Owner>aws</Owner></StatusRespMsg></DmsLite>",
    );

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let link = CommLink::spawn(
        "cms-east",
        Arc::new(script.clone()),
        registry.clone(),
        None,
        None,
        shutdown_rx,
    );
    let poller = DmsLitePoller::new(
        link.handle(),
        registry.clone(),
        config.dmslite.clone(),
        Arc::new(SystemClock),
    );

    poller.send_sign_request("V94E22", DeviceRequest::QueryMessage);
    wait_for_field(&mut events, "V94E22", "message").await;
    assert_eq!(dms.message_text(), "I-94 EB CLOSED");
    assert_eq!(dms.message_owner(), "aws");

    link.shutdown().await;
}

#[tokio::test]
async fn invalid_responses_exhaust_the_retry_budget() {
    let config = test_config();
    let registry = Arc::new(DeviceRegistry::from_config(&config));
    let controller = registry.controller("v94e22").expect("controller");
    let mut events = registry.subscribe();

    let script = ScriptedChannel::new();
    for _ in 0..3 {
        script.push_read(
            b"<DmsLite><SetSnglPgRespMsg><IsValid>false</IsValid>\
              <ErrMsg>SIGN OFFLINE</ErrMsg></SetSnglPgRespMsg></DmsLite>",
        );
    }

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let link = CommLink::spawn(
        "cms-east",
        Arc::new(script.clone()),
        registry.clone(),
        None,
        None,
        shutdown_rx,
    );
    let poller = DmsLitePoller::new(
        link.handle(),
        registry.clone(),
        config.dmslite.clone(),
        Arc::new(SystemClock),
    );

    let mut message = SignMessage::blank("operator", BM_PGLEN_BYTES);
    message.pages[0].text = "CRASH AHEAD".to_owned();
    poller.send_sign_message("V94E22", message, "operator");

    wait_for_field(&mut events, "v94e22", "error_status").await;
    assert!(controller.failed());
    assert_eq!(controller.error_status(), "SIGN OFFLINE");
    // One exchange per retry attempt, three in total.
    assert_eq!(script.writes().len(), 3);

    // The failed deployment never touched the committed message.
    let dms = registry.dms("V94E22").expect("dms");
    assert_eq!(dms.message_text(), "");

    link.shutdown().await;
}
