//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "dmslite device poller."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use t_dcs_common::config::DmsLiteConfig;
use t_dcs_common::time::WallClock;
use t_dcs_core::devices::{DeviceRegistry, Dms, SignMessage};
use t_dcs_core::link::LinkHandle;
use t_dcs_core::poller::{DeviceRequest, SignPoller};
use tracing::debug;

use crate::message::MsgIdSource;
use crate::ops::{OpQueryConfig, OpQueryMsg, OpQueryStatus, OpSendMessage};
use crate::BM_PGLEN_BYTES;

/// Maps abstract sign requests onto dmslite operations and submits them to
/// the link queue.
pub struct DmsLitePoller {
    link: LinkHandle,
    registry: Arc<DeviceRegistry>,
    timeouts: DmsLiteConfig,
    ids: Arc<MsgIdSource>,
}

impl DmsLitePoller {
    pub fn new(
        link: LinkHandle,
        registry: Arc<DeviceRegistry>,
        timeouts: DmsLiteConfig,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let seed = clock.now().timestamp_millis().max(0) as u64;
        Self {
            link,
            registry,
            timeouts,
            ids: Arc::new(MsgIdSource::new(seed)),
        }
    }

    /// Operation timeout by sign access type: dial-up modems get the long
    /// budget, everything else the standard one.
    fn op_timeout(&self, dms: &Dms) -> Duration {
        if dms.sign_access().to_lowercase().contains("modem") {
            self.timeouts.modem_op_timeout
        } else {
            self.timeouts.op_timeout
        }
    }

    fn sign_context(&self, dms: &str) -> Option<(Arc<t_dcs_core::devices::Controller>, Arc<Dms>)> {
        let dms = self.registry.dms(dms)?;
        let controller = self.registry.controller_of(dms.name())?;
        Some((controller, dms))
    }
}

impl SignPoller for DmsLitePoller {
    fn send_sign_request(&self, dms: &str, request: DeviceRequest) {
        let Some((controller, dms)) = self.sign_context(dms) else {
            return;
        };
        let timeout = self.op_timeout(&dms);
        match request {
            DeviceRequest::QueryConfig => {
                self.link.submit(Box::new(OpQueryConfig::new(
                    controller,
                    dms,
                    self.ids.clone(),
                    timeout,
                )));
            }
            DeviceRequest::QueryMessage => {
                self.link.submit(Box::new(OpQueryMsg::new(
                    controller,
                    dms,
                    self.ids.clone(),
                    timeout,
                )));
            }
            DeviceRequest::QueryStatus => {
                self.link.submit(Box::new(OpQueryStatus::new(
                    controller,
                    dms,
                    self.ids.clone(),
                    timeout,
                )));
            }
            other => {
                debug!(dms = dms.name(), request = ?other,
                    "ignoring unsupported sign request");
            }
        }
    }

    fn send_sign_message(&self, dms: &str, message: SignMessage, owner: &str) {
        let Some((controller, dms)) = self.sign_context(dms) else {
            return;
        };
        let timeout = self.op_timeout(&dms);
        let mut message = message;
        if message.pages.is_empty() {
            message = SignMessage::blank(owner, BM_PGLEN_BYTES);
        }
        if message.owner.is_empty() {
            message.owner = owner.to_owned();
        }
        self.link.submit(Box::new(OpSendMessage::new(
            controller,
            dms,
            self.ids.clone(),
            message,
            timeout,
        )));
    }
}
