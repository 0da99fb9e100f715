//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Field controller and device state model."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use parking_lot::RwLock;
use t_dcs_common::config::{AppConfig, DeviceKind, LaneType, MeterType};
use tokio::sync::broadcast;

/// Notification that a device status field was committed.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub device: String,
    pub field: &'static str,
}

/// Capability handle required by every device status setter.
///
/// The engine hands one to [`Operation::cleanup`](crate::operation::Operation::cleanup)
/// and nowhere else, so persisted device state can only change when an
/// operation has run to its terminal phase. Observers therefore never see a
/// device mid-update during a multi-phase exchange.
pub struct StatusCommit {
    events: broadcast::Sender<DeviceEvent>,
}

impl StatusCommit {
    pub(crate) fn new(events: broadcast::Sender<DeviceEvent>) -> Self {
        Self { events }
    }

    fn notify(&self, device: &str, field: &'static str) {
        let _ = self.events.send(DeviceEvent {
            device: device.to_owned(),
            field,
        });
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    failed: bool,
    error_status: String,
    version: String,
}

/// One field cabinet on a multi-drop line.
#[derive(Debug)]
pub struct Controller {
    name: String,
    link: String,
    drop: u8,
    retry_threshold: u8,
    cabinet_dip: Option<u8>,
    state: RwLock<ControllerState>,
}

impl Controller {
    pub fn new(
        name: impl Into<String>,
        link: impl Into<String>,
        drop: u8,
        retry_threshold: u8,
        cabinet_dip: Option<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            drop,
            retry_threshold,
            cabinet_dip,
            state: RwLock::new(ControllerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn drop_address(&self) -> u8 {
        self.drop
    }

    pub fn cabinet_dip(&self) -> Option<u8> {
        self.cabinet_dip
    }

    /// Retry budget for recoverable protocol errors.
    pub fn retry_threshold(&self) -> u8 {
        self.retry_threshold
    }

    /// Whether `attempts` retries are still within the budget.
    pub fn should_retry(&self, attempts: u8) -> bool {
        attempts < self.retry_threshold
    }

    pub fn failed(&self) -> bool {
        self.state.read().failed
    }

    pub fn version(&self) -> String {
        self.state.read().version.clone()
    }

    pub fn error_status(&self) -> String {
        self.state.read().error_status.clone()
    }

    pub fn set_failed(&self, commit: &StatusCommit, failed: bool) {
        self.state.write().failed = failed;
        commit.notify(&self.name, "failed");
    }

    pub fn set_error_status(&self, commit: &StatusCommit, status: &str) {
        self.state.write().error_status = status.to_owned();
        commit.notify(&self.name, "error_status");
    }

    pub fn set_version(&self, commit: &StatusCommit, version: &str) {
        self.state.write().version = version.to_owned();
        commit.notify(&self.name, "version");
    }
}

#[derive(Debug, Default)]
struct MeterState {
    rate: Option<u32>,
    metering: bool,
    police_panel: bool,
    green_count: u32,
}

/// Ramp meter attached to a controller pin.
#[derive(Debug)]
pub struct RampMeter {
    name: String,
    pin: u8,
    meter_type: MeterType,
    am_target: u32,
    pm_target: u32,
    state: RwLock<MeterState>,
}

impl RampMeter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn meter_type(&self) -> MeterType {
        self.meter_type
    }

    pub fn am_target(&self) -> u32 {
        self.am_target
    }

    pub fn pm_target(&self) -> u32 {
        self.pm_target
    }

    pub fn rate(&self) -> Option<u32> {
        self.state.read().rate
    }

    pub fn is_metering(&self) -> bool {
        self.state.read().metering
    }

    pub fn police_panel(&self) -> bool {
        self.state.read().police_panel
    }

    pub fn green_count(&self) -> u32 {
        self.state.read().green_count
    }

    pub fn set_rate(&self, commit: &StatusCommit, rate: Option<u32>) {
        self.state.write().rate = rate;
        commit.notify(&self.name, "rate");
    }

    pub fn set_metering(&self, commit: &StatusCommit, metering: bool) {
        self.state.write().metering = metering;
        commit.notify(&self.name, "metering");
    }

    pub fn set_police_panel(&self, commit: &StatusCommit, on: bool) {
        self.state.write().police_panel = on;
        commit.notify(&self.name, "police_panel");
    }

    pub fn set_green_count(&self, commit: &StatusCommit, count: u32) {
        self.state.write().green_count = count;
        commit.notify(&self.name, "green_count");
    }
}

/// Static geometry and identification reported by a dynamic message sign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignConfig {
    pub make: String,
    pub model: String,
    pub version: String,
    pub sign_access: String,
    pub sign_type: String,
    pub horiz_border: u32,
    pub vert_border: u32,
    pub horiz_pitch: u32,
    pub vert_pitch: u32,
    pub char_width_px: u32,
    pub char_height_px: u32,
    pub sign_width_px: u32,
    pub sign_height_px: u32,
}

/// One page of a sign message: rendered text plus its pixel bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignPage {
    pub text: String,
    pub bitmap: Vec<u8>,
    pub display_time: Option<Duration>,
}

/// A message deployed to a sign, as handed over by the dispatching layer.
#[derive(Debug, Clone)]
pub struct SignMessage {
    pub owner: String,
    pub pages: Vec<SignPage>,
    pub on_time: Option<DateTime<Local>>,
    pub off_time: Option<DateTime<Local>>,
    pub activation_priority: u8,
    pub run_priority: u8,
}

impl SignMessage {
    /// A blank deployment: one empty page, which clears the sign face.
    pub fn blank(owner: impl Into<String>, bitmap_len: usize) -> Self {
        Self {
            owner: owner.into(),
            pages: vec![SignPage {
                text: String::new(),
                bitmap: vec![0; bitmap_len],
                display_time: None,
            }],
            on_time: None,
            off_time: None,
            activation_priority: 1,
            run_priority: 1,
        }
    }
}

#[derive(Debug, Default)]
struct DmsState {
    configured: bool,
    config: SignConfig,
    message_text: String,
    message_owner: String,
    temp_min: Option<i32>,
    temp_max: Option<i32>,
}

/// Dynamic message sign.
#[derive(Debug)]
pub struct Dms {
    name: String,
    pin: u8,
    sign_access: String,
    state: RwLock<DmsState>,
}

impl Dms {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Access-type string from configuration ("modem" selects long timeouts).
    pub fn sign_access(&self) -> &str {
        &self.sign_access
    }

    pub fn is_configured(&self) -> bool {
        self.state.read().configured
    }

    pub fn config(&self) -> SignConfig {
        self.state.read().config.clone()
    }

    pub fn message_text(&self) -> String {
        self.state.read().message_text.clone()
    }

    pub fn message_owner(&self) -> String {
        self.state.read().message_owner.clone()
    }

    pub fn temperatures(&self) -> (Option<i32>, Option<i32>) {
        let state = self.state.read();
        (state.temp_min, state.temp_max)
    }

    pub fn set_configured(&self, commit: &StatusCommit, configured: bool) {
        self.state.write().configured = configured;
        commit.notify(&self.name, "configured");
    }

    pub fn set_config(&self, commit: &StatusCommit, config: SignConfig) {
        self.state.write().config = config;
        commit.notify(&self.name, "config");
    }

    pub fn set_message(&self, commit: &StatusCommit, text: &str, owner: &str) {
        let mut state = self.state.write();
        state.message_text = text.to_owned();
        state.message_owner = owner.to_owned();
        drop(state);
        commit.notify(&self.name, "message");
    }

    pub fn set_temperatures(&self, commit: &StatusCommit, min: Option<i32>, max: Option<i32>) {
        let mut state = self.state.write();
        state.temp_min = min;
        state.temp_max = max;
        drop(state);
        commit.notify(&self.name, "temperatures");
    }
}

/// Indication shown by one lane-control signal head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcsIndication {
    Dark,
    LaneOpen,
    LaneClosed,
}

/// Lane-control signal array.
#[derive(Debug)]
pub struct LcsArray {
    name: String,
    pin: u8,
    lanes: u8,
    state: RwLock<Vec<LcsIndication>>,
}

impl LcsArray {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn lanes(&self) -> u8 {
        self.lanes
    }

    pub fn indications(&self) -> Vec<LcsIndication> {
        self.state.read().clone()
    }

    pub fn set_indications(&self, commit: &StatusCommit, indications: Vec<LcsIndication>) {
        *self.state.write() = indications;
        commit.notify(&self.name, "indications");
    }
}

/// Warning sign (flashing beacon) driven by a special function output.
#[derive(Debug)]
pub struct WarningSign {
    name: String,
    pin: u8,
    state: RwLock<bool>,
}

impl WarningSign {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn deployed(&self) -> bool {
        *self.state.read()
    }

    pub fn set_deployed(&self, commit: &StatusCommit, deployed: bool) {
        *self.state.write() = deployed;
        commit.notify(&self.name, "deployed");
    }
}

/// Discrete alarm input.
#[derive(Debug)]
pub struct Alarm {
    name: String,
    pin: u8,
    state: RwLock<bool>,
}

impl Alarm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn triggered(&self) -> bool {
        *self.state.read()
    }

    pub fn set_triggered(&self, commit: &StatusCommit, triggered: bool) {
        *self.state.write() = triggered;
        commit.notify(&self.name, "triggered");
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    volume: Option<u32>,
    scans: Option<u32>,
    stamp: Option<DateTime<Local>>,
}

/// Loop detector input with binned sample data.
#[derive(Debug)]
pub struct Detector {
    name: String,
    pin: u8,
    lane_type: LaneType,
    state: RwLock<DetectorState>,
}

impl Detector {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn lane_type(&self) -> LaneType {
        self.lane_type
    }

    pub fn sample(&self) -> (Option<u32>, Option<u32>) {
        let state = self.state.read();
        (state.volume, state.scans)
    }

    pub fn sample_stamp(&self) -> Option<DateTime<Local>> {
        self.state.read().stamp
    }

    pub fn set_sample(
        &self,
        commit: &StatusCommit,
        volume: u32,
        scans: u32,
        stamp: DateTime<Local>,
    ) {
        let mut state = self.state.write();
        state.volume = Some(volume);
        state.scans = Some(scans);
        state.stamp = Some(stamp);
        drop(state);
        commit.notify(&self.name, "sample");
    }
}

/// Owns every controller and device built from configuration and publishes
/// status-change notifications to observers.
pub struct DeviceRegistry {
    controllers: IndexMap<String, Arc<Controller>>,
    meters: IndexMap<String, Arc<RampMeter>>,
    signs: IndexMap<String, Arc<Dms>>,
    lcs_arrays: IndexMap<String, Arc<LcsArray>>,
    warning_signs: IndexMap<String, Arc<WarningSign>>,
    alarms: IndexMap<String, Arc<Alarm>>,
    detectors: IndexMap<String, Arc<Detector>>,
    /// controller name -> device names, preserving config order
    attachments: IndexMap<String, Vec<String>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    /// Build the registry from validated configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut registry = Self {
            controllers: IndexMap::new(),
            meters: IndexMap::new(),
            signs: IndexMap::new(),
            lcs_arrays: IndexMap::new(),
            warning_signs: IndexMap::new(),
            alarms: IndexMap::new(),
            detectors: IndexMap::new(),
            attachments: IndexMap::new(),
            events,
        };
        for (link_id, link) in &config.links {
            for (name, controller_cfg) in &link.controllers {
                let controller = Arc::new(Controller::new(
                    name.clone(),
                    link_id.clone(),
                    controller_cfg.drop,
                    controller_cfg.retry_threshold,
                    controller_cfg.cabinet_dip,
                ));
                registry.controllers.insert(name.clone(), controller);
                let mut attached = Vec::new();
                for device in &controller_cfg.devices {
                    attached.push(device.name.clone());
                    match &device.kind {
                        DeviceKind::RampMeter {
                            meter_type,
                            am_target,
                            pm_target,
                        } => {
                            registry.meters.insert(
                                device.name.clone(),
                                Arc::new(RampMeter {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    meter_type: *meter_type,
                                    am_target: *am_target,
                                    pm_target: *pm_target,
                                    state: RwLock::new(MeterState::default()),
                                }),
                            );
                        }
                        DeviceKind::Dms { sign_access } => {
                            registry.signs.insert(
                                device.name.clone(),
                                Arc::new(Dms {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    sign_access: sign_access.clone(),
                                    state: RwLock::new(DmsState::default()),
                                }),
                            );
                        }
                        DeviceKind::LcsArray { lanes } => {
                            registry.lcs_arrays.insert(
                                device.name.clone(),
                                Arc::new(LcsArray {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    lanes: *lanes,
                                    state: RwLock::new(vec![
                                        LcsIndication::Dark;
                                        *lanes as usize
                                    ]),
                                }),
                            );
                        }
                        DeviceKind::WarningSign => {
                            registry.warning_signs.insert(
                                device.name.clone(),
                                Arc::new(WarningSign {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    state: RwLock::new(false),
                                }),
                            );
                        }
                        DeviceKind::Alarm => {
                            registry.alarms.insert(
                                device.name.clone(),
                                Arc::new(Alarm {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    state: RwLock::new(false),
                                }),
                            );
                        }
                        DeviceKind::Detector { lane_type } => {
                            registry.detectors.insert(
                                device.name.clone(),
                                Arc::new(Detector {
                                    name: device.name.clone(),
                                    pin: device.pin,
                                    lane_type: *lane_type,
                                    state: RwLock::new(DetectorState::default()),
                                }),
                            );
                        }
                    }
                }
                registry.attachments.insert(name.clone(), attached);
            }
        }
        registry
    }

    /// Subscribe to device status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Create a commit handle. The engine calls this when running an
    /// operation's cleanup; nothing else should.
    pub fn commit_handle(&self) -> StatusCommit {
        StatusCommit::new(self.events.clone())
    }

    pub fn controller(&self, name: &str) -> Option<Arc<Controller>> {
        self.controllers.get(name).cloned()
    }

    /// The controller a device is attached to.
    pub fn controller_of(&self, device: &str) -> Option<Arc<Controller>> {
        self.attachments
            .iter()
            .find(|(_, devices)| devices.iter().any(|d| d == device))
            .and_then(|(controller, _)| self.controllers.get(controller).cloned())
    }

    pub fn controllers_on(&self, link: &str) -> Vec<Arc<Controller>> {
        self.controllers
            .values()
            .filter(|c| c.link() == link)
            .cloned()
            .collect()
    }

    pub fn meter(&self, name: &str) -> Option<Arc<RampMeter>> {
        self.meters.get(name).cloned()
    }

    pub fn dms(&self, name: &str) -> Option<Arc<Dms>> {
        self.signs.get(name).cloned()
    }

    pub fn lcs(&self, name: &str) -> Option<Arc<LcsArray>> {
        self.lcs_arrays.get(name).cloned()
    }

    pub fn warning_sign(&self, name: &str) -> Option<Arc<WarningSign>> {
        self.warning_signs.get(name).cloned()
    }

    fn attached(&self, controller: &str) -> impl Iterator<Item = &String> {
        self.attachments.get(controller).into_iter().flatten()
    }

    pub fn meters_on(&self, controller: &str) -> Vec<Arc<RampMeter>> {
        self.attached(controller)
            .filter_map(|n| self.meters.get(n).cloned())
            .collect()
    }

    /// The meter wired to a specific controller pin, if any.
    pub fn meter_at_pin(&self, controller: &str, pin: u8) -> Option<Arc<RampMeter>> {
        self.meters_on(controller).into_iter().find(|m| m.pin() == pin)
    }

    pub fn signs_on(&self, controller: &str) -> Vec<Arc<Dms>> {
        self.attached(controller)
            .filter_map(|n| self.signs.get(n).cloned())
            .collect()
    }

    pub fn lcs_on(&self, controller: &str) -> Vec<Arc<LcsArray>> {
        self.attached(controller)
            .filter_map(|n| self.lcs_arrays.get(n).cloned())
            .collect()
    }

    pub fn warning_signs_on(&self, controller: &str) -> Vec<Arc<WarningSign>> {
        self.attached(controller)
            .filter_map(|n| self.warning_signs.get(n).cloned())
            .collect()
    }

    pub fn alarms_on(&self, controller: &str) -> Vec<Arc<Alarm>> {
        self.attached(controller)
            .filter_map(|n| self.alarms.get(n).cloned())
            .collect()
    }

    pub fn detectors_on(&self, controller: &str) -> Vec<Arc<Detector>> {
        self.attached(controller)
            .filter_map(|n| self.detectors.get(n).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> DeviceRegistry {
        let config: AppConfig = r#"
            [links.west-170]
            uri = "10.1.4.21:8001"
            protocol = "mndot-5"

            [links.west-170.controllers.c101]
            drop = 7
            devices = [
                { name = "M35W41", pin = 2, kind = { type = "ramp-meter", meter_type = "dual" } },
                { name = "D501", pin = 39, kind = { type = "detector", lane_type = "queue" } },
            ]
        "#
        .parse()
        .expect("config");
        DeviceRegistry::from_config(&config)
    }

    #[test]
    fn registry_builds_controllers_and_devices() {
        let registry = sample_registry();
        let controller = registry.controller("c101").expect("controller");
        assert_eq!(controller.drop_address(), 7);
        assert!(registry.meter_at_pin("c101", 2).is_some());
        assert!(registry.meter_at_pin("c101", 3).is_none());
        assert_eq!(registry.detectors_on("c101").len(), 1);
    }

    #[test]
    fn commits_are_observable() {
        let registry = sample_registry();
        let mut events = registry.subscribe();
        let commit = registry.commit_handle();
        let meter = registry.meter("M35W41").expect("meter");

        meter.set_rate(&commit, Some(1200));
        assert_eq!(meter.rate(), Some(1200));
        let event = events.try_recv().expect("event queued");
        assert_eq!(event.device, "M35W41");
        assert_eq!(event.field, "rate");
    }

    #[test]
    fn retry_budget_is_bounded() {
        let registry = sample_registry();
        let controller = registry.controller("c101").expect("controller");
        assert!(controller.should_retry(0));
        assert!(controller.should_retry(2));
        assert!(!controller.should_retry(3));
    }
}
