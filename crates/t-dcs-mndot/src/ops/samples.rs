//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Binned sample collection operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local};
use t_dcs_common::time::WallClock;
use t_dcs_core::channel::Channel;
use t_dcs_core::devices::{Controller, Detector, RampMeter, StatusCommit};
use t_dcs_core::operation::{OpHeader, OpStep, Operation, PriorityLevel};
use t_dcs_core::Result;
use tracing::debug;

use crate::address;
use crate::bcd;
use crate::frame::FrameFormat;
use crate::message::Message;
use crate::meter::MeterRateCode;
use crate::property::MemoryProperty;
use crate::sample::{
    BinnedRecord, DeleteRecordProperty, NextRecordProperty, RecordCountProperty, SampleFetch,
};

/// Records with timestamps outside the acceptance window tolerated before
/// the drain aborts.
pub const MAX_BAD_RECORDS: u8 = 5;

/// How far past the interval stamp the drain may keep running. Roughly 4.3
/// minutes: any longer and the next 5-minute bin is nearly due.
const DRAIN_BOUND_SECS: i64 = 258;

/// Oldest record stamp still considered plausible.
const OLDEST_HOURS: i64 = 4;

/// Drain queued 5-minute sample records: count, fetch, validate, delete,
/// repeat until the controller reports none remain.
pub struct OpQuerySamples5Min {
    header: OpHeader,
    format: FrameFormat,
    detectors: Vec<Arc<Detector>>,
    /// Interval stamp the drain was started for.
    stamp: DateTime<Local>,
    clock: Arc<dyn WallClock>,
    latest: Option<BinnedRecord>,
    bad_records: u8,
    done: bool,
}

impl OpQuerySamples5Min {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        detectors: Vec<Arc<Detector>>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let stamp = clock.now();
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            detectors,
            stamp,
            clock,
            latest: None,
            bad_records: 0,
            done: false,
        }
    }

    fn newest_acceptable(&self) -> DateTime<Local> {
        self.stamp + ChronoDuration::seconds(DRAIN_BOUND_SECS)
    }

    fn oldest_acceptable(&self) -> DateTime<Local> {
        self.stamp - ChronoDuration::hours(OLDEST_HOURS)
    }

    fn stamp_in_window(&self, stamp: Option<DateTime<Local>>) -> bool {
        match stamp {
            Some(stamp) => stamp >= self.oldest_acceptable() && stamp <= self.newest_acceptable(),
            None => false,
        }
    }
}

#[async_trait]
impl Operation for OpQuerySamples5Min {
    fn name(&self) -> &'static str {
        "query 5-minute samples"
    }

    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut OpHeader {
        &mut self.header
    }

    /// One drain round per scheduling turn: check the queue, fetch the
    /// oldest record, delete it. A controller with N queued records takes
    /// N rounds plus the final empty check.
    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep> {
        if self.done {
            return Ok(OpStep::Done);
        }
        if self.clock.now() > self.newest_acceptable() {
            // Pathological drain; commit what we have and give up the line.
            debug!(controller = %self.header.controller.name(),
                "sample drain passed its time bound");
            self.done = true;
            return Ok(OpStep::Done);
        }
        let drop = self.header.controller.drop_address();
        let mut message = Message::new(channel, drop, self.format);

        let mut count = RecordCountProperty::default();
        message.query_prop(&mut count).await?;
        if count.count == 0 {
            self.done = true;
            return Ok(OpStep::Done);
        }
        let mut next = NextRecordProperty::default();
        message.query_prop(&mut next).await?;
        let record = match std::mem::take(&mut next.fetch) {
            SampleFetch::Empty | SampleFetch::Pending => {
                self.done = true;
                return Ok(OpStep::Done);
            }
            SampleFetch::Record(record) => record,
        };

        if self.stamp_in_window(record.stamp) {
            self.latest = Some(record);
        } else {
            self.bad_records += 1;
            debug!(controller = %self.header.controller.name(),
                bad = self.bad_records, stamp = ?record.stamp, "BAD_TIMESTAMP record");
            if self.bad_records >= MAX_BAD_RECORDS {
                self.header.fail("BAD TIMESTAMP");
                self.done = true;
                // Terminal; the bad record stays queued for diagnostics.
                return Ok(OpStep::Done);
            }
        }

        let mut delete = DeleteRecordProperty;
        message.store_prop(&mut delete).await?;
        Ok(OpStep::Continue)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success {
            if let Some(record) = &self.latest {
                let stamp = record.stamp.unwrap_or(self.stamp);
                for detector in &self.detectors {
                    if let Some(input) = detector.pin().checked_sub(address::FIRST_DETECTOR_PIN) {
                        if input < address::DETECTOR_INPUTS {
                            detector.set_sample(
                                commit,
                                record.volume[input as usize] as u32,
                                record.scans[input as usize] as u32,
                                stamp,
                            );
                        }
                    }
                }
            }
        }
        self.header.commit_outcome(commit);
    }
}

/// Read the 30-second bin buffer directly from controller memory.
pub struct OpQuerySamples30Sec {
    header: OpHeader,
    format: FrameFormat,
    detectors: Vec<Arc<Detector>>,
    clock: Arc<dyn WallClock>,
    volume: Vec<u8>,
    scans: Vec<u8>,
    done: bool,
}

impl OpQuerySamples30Sec {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        detectors: Vec<Arc<Detector>>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            detectors,
            clock,
            volume: Vec::new(),
            scans: Vec::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQuerySamples30Sec {
    fn name(&self) -> &'static str {
        "query 30-second samples"
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
        let inputs = address::DETECTOR_INPUTS as usize;
        let mut message = Message::new(
            channel,
            self.header.controller.drop_address(),
            self.format,
        );
        let mut prop = MemoryProperty::query(address::SAMPLE_30SEC_BUFFER, 2 * inputs);
        message.query_prop(&mut prop).await?;
        self.volume = prop.payload()[..inputs].to_vec();
        self.scans = prop.payload()[inputs..].to_vec();
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success && !self.volume.is_empty() {
            let stamp = self.clock.now();
            for detector in &self.detectors {
                if let Some(input) = detector.pin().checked_sub(address::FIRST_DETECTOR_PIN) {
                    if input < address::DETECTOR_INPUTS {
                        detector.set_sample(
                            commit,
                            self.volume[input as usize] as u32,
                            self.scans[input as usize] as u32,
                            stamp,
                        );
                    }
                }
            }
        }
        self.header.commit_outcome(commit);
    }
}

/// Read the ramp meter data blocks: rate code, police panel, green counts.
pub struct OpQueryMeterStatus {
    header: OpHeader,
    format: FrameFormat,
    meters: Vec<Arc<RampMeter>>,
    data: Vec<u8>,
    done: bool,
}

impl OpQueryMeterStatus {
    pub fn new(
        controller: Arc<Controller>,
        format: FrameFormat,
        meters: Vec<Arc<RampMeter>>,
    ) -> Self {
        Self {
            header: OpHeader::new(controller, PriorityLevel::Data),
            format,
            meters,
            data: Vec::new(),
            done: false,
        }
    }
}

#[async_trait]
impl Operation for OpQueryMeterStatus {
    fn name(&self) -> &'static str {
        "query meter status"
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
        let mut prop =
            MemoryProperty::query(address::RAMP_METER_DATA, address::METER_DATA_LEN);
        message.query_prop(&mut prop).await?;
        self.data = prop.payload().to_vec();
        self.done = true;
        Ok(OpStep::Done)
    }

    fn cleanup(&mut self, commit: &StatusCommit) {
        if self.header.success && self.data.len() == address::METER_DATA_LEN {
            for meter in &self.meters {
                let Some(number) = address::meter_number(meter.pin()) else {
                    continue;
                };
                let base = if number == 2 {
                    address::OFF_METER_2 as usize
                } else {
                    0
                };
                let rate_code = MeterRateCode::from_code(self.data[base]);
                let police = self.data[base + address::OFF_POLICE_PANEL as usize] & 0x01 != 0;
                let green = bcd::bcd4_decode([
                    self.data[base + address::OFF_GREEN_COUNT as usize],
                    self.data[base + address::OFF_GREEN_COUNT as usize + 1],
                ])
                .unwrap_or(0);
                meter.set_police_panel(commit, police);
                meter.set_metering(
                    commit,
                    rate_code.map(|c| c.is_metering()).unwrap_or(false) && !police,
                );
                meter.set_green_count(commit, green);
            }
        }
        self.header.commit_outcome(commit);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use t_dcs_core::channel::ScriptedChannel;
    use t_dcs_core::devices::DeviceRegistry;
    use t_dcs_core::operation::Operation as _;
    use t_dcs_common::config::AppConfig;
    use t_dcs_common::time::FixedClock;

    use super::*;
    use crate::sample::{encode_stamp, RECORD_LEN};

    fn frame(drop: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![(drop << 3) | status, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.push(0);
        bcd::seal(&mut frame);
        frame
    }

    fn registry() -> DeviceRegistry {
        let config: AppConfig = r#"
            [links.west-170]
            uri = "x:1"
            protocol = "mndot-5"
            [links.west-170.controllers.c101]
            drop = 7
            devices = [
                { name = "D1", pin = 39, kind = { type = "detector", lane_type = "mainline" } },
                { name = "D2", pin = 40, kind = { type = "detector", lane_type = "passage" } },
                { name = "M1", pin = 2, kind = { type = "ramp-meter", meter_type = "dual" } },
            ]
        "#
        .parse()
        .expect("config");
        DeviceRegistry::from_config(&config)
    }

    fn record_payload(stamp: DateTime<Local>, volume: u8, scans: u8) -> Vec<u8> {
        let mut payload = encode_stamp(stamp).expect("stamp").to_vec();
        payload.extend_from_slice(&[volume; address::DETECTOR_INPUTS as usize]);
        payload.extend_from_slice(&[scans; address::DETECTOR_INPUTS as usize]);
        assert_eq!(payload.len(), RECORD_LEN);
        payload
    }

    async fn run(op: &mut dyn Operation, channel: &mut dyn Channel) -> (u32, bool) {
        let mut polls = 0;
        loop {
            polls += 1;
            match op.poll(channel).await.expect("poll") {
                OpStep::Continue => continue,
                OpStep::Done => break,
            }
        }
        (polls, op.success())
    }

    #[tokio::test]
    async fn drain_terminates_after_n_plus_one_rounds() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let now = Local.with_ymd_and_hms(2024, 3, 14, 9, 25, 0).unwrap();
        let clock = Arc::new(FixedClock(now));

        let script = ScriptedChannel::new();
        let n = 3u8;
        for remaining in (1..=n).rev() {
            script.push_read(&frame(7, 0, &[remaining]));
            script.push_read(&frame(7, 0, &record_payload(now, remaining, 50)));
            script.push_read(&frame(7, 0, &[])); // delete ack
        }
        script.push_read(&frame(7, 0, &[0])); // no records remain

        let mut op = OpQuerySamples5Min::new(
            controller,
            FrameFormat::CategoryBits3,
            registry.detectors_on("c101"),
            clock,
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let (polls, success) = run(&mut op, channel.as_mut()).await;
        assert_eq!(polls, (n + 1) as u32);
        assert!(success);

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        let detector = registry.detectors_on("c101")[0].clone();
        // Last drained record (volume 1) wins.
        assert_eq!(detector.sample(), (Some(1), Some(50)));
    }

    #[tokio::test]
    async fn bad_timestamps_abort_after_the_cap() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let now = Local.with_ymd_and_hms(2024, 3, 14, 9, 25, 0).unwrap();
        let stale = now - ChronoDuration::days(2);
        let clock = Arc::new(FixedClock(now));

        let script = ScriptedChannel::new();
        for _ in 0..MAX_BAD_RECORDS {
            script.push_read(&frame(7, 0, &[9]));
            script.push_read(&frame(7, 0, &record_payload(stale, 1, 1)));
            script.push_read(&frame(7, 0, &[])); // delete ack
        }

        let mut op = OpQuerySamples5Min::new(
            controller,
            FrameFormat::CategoryBits3,
            registry.detectors_on("c101"),
            clock,
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let (polls, success) = run(&mut op, channel.as_mut()).await;
        assert_eq!(polls, MAX_BAD_RECORDS as u32);
        assert!(!success);
        assert_eq!(op.header().error_status(), Some("BAD TIMESTAMP"));

        // Failed drains must not touch detector state.
        let commit = registry.commit_handle();
        op.cleanup(&commit);
        assert_eq!(registry.detectors_on("c101")[0].sample(), (None, None));
    }

    #[tokio::test]
    async fn thirty_second_read_commits_per_pin_bins() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");
        let now = Local.with_ymd_and_hms(2024, 3, 14, 9, 25, 30).unwrap();
        let clock = Arc::new(FixedClock(now));

        let inputs = address::DETECTOR_INPUTS as usize;
        let mut payload = vec![0u8; 2 * inputs];
        payload[0] = 7; // volume, input 0 (pin 39)
        payload[1] = 4; // volume, input 1 (pin 40)
        payload[inputs] = 33; // scans, input 0
        payload[inputs + 1] = 21; // scans, input 1

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, 0, &payload));

        let mut op = OpQuerySamples30Sec::new(
            controller,
            FrameFormat::CategoryBits3,
            registry.detectors_on("c101"),
            clock,
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let (polls, success) = run(&mut op, channel.as_mut()).await;
        assert_eq!(polls, 1);
        assert!(success);

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        let detectors = registry.detectors_on("c101");
        assert_eq!(detectors[0].sample(), (Some(7), Some(33)));
        assert_eq!(detectors[1].sample(), (Some(4), Some(21)));
        assert_eq!(detectors[0].sample_stamp(), Some(now));
    }

    #[tokio::test]
    async fn meter_status_decodes_rate_code_and_green_count() {
        let registry = registry();
        let controller = registry.controller("c101").expect("controller");

        let mut payload = vec![0u8; address::METER_DATA_LEN];
        payload[0] = MeterRateCode::Central as u8;
        payload[address::OFF_POLICE_PANEL as usize] = 0;
        payload[address::OFF_GREEN_COUNT as usize] = 0x01;
        payload[address::OFF_GREEN_COUNT as usize + 1] = 0x23;

        let script = ScriptedChannel::new();
        script.push_read(&frame(7, 0, &payload));

        let mut op = OpQueryMeterStatus::new(
            controller,
            FrameFormat::CategoryBits3,
            vec![registry.meter("M1").expect("meter")],
        );
        let mut channel: Box<dyn Channel> = Box::new(script.clone());
        let (_, success) = run(&mut op, channel.as_mut()).await;
        assert!(success);

        let commit = registry.commit_handle();
        op.cleanup(&commit);
        let meter = registry.meter("M1").expect("meter");
        assert!(meter.is_metering());
        assert!(!meter.police_panel());
        assert_eq!(meter.green_count(), 123);
    }
}
