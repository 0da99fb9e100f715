//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Shared primitives and utilities for the driver runtime."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_period() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_threshold() -> u8 {
    3
}

fn default_am_target() -> u32 {
    1714
}

fn default_pm_target() -> u32 {
    1714
}

fn default_green_secs() -> f32 {
    1.3
}

fn default_yellow_secs() -> f32 {
    0.7
}

fn default_min_red_secs() -> f32 {
    0.1
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(65)
}

fn default_modem_op_timeout() -> Duration {
    Duration::from_secs(305)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the T-DCS runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub links: IndexMap<String, LinkConfig>,
    #[serde(default)]
    pub meter: MeterTimingConfig,
    #[serde(default)]
    pub dmslite: DmsLiteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "T_DCS_CONFIG";

    /// Load configuration from disk, respecting the `T_DCS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a link configuration by identifier.
    pub fn link(&self, link_id: &str) -> Option<&LinkConfig> {
        self.links.get(link_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.links.is_empty() {
            return Err(anyhow!(
                "configuration must contain at least one communication link"
            ));
        }
        for (link_id, link) in &self.links {
            link.validate(link_id)?;
        }
        self.meter.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Wire protocol spoken on a communication link.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LinkProtocol {
    /// MnDOT-170 revision 4: 4-bit category, 4-bit drop (1-15).
    Mndot4,
    /// MnDOT-170 revision 5: 3-bit category, 5-bit drop (1-31).
    Mndot5,
    /// dmslite XML protocol for dynamic message signs.
    DmsLite,
}

impl LinkProtocol {
    /// Largest drop address a controller on this link may use.
    pub fn max_drop(&self) -> u8 {
        match self {
            LinkProtocol::Mndot4 => 15,
            LinkProtocol::Mndot5 => 31,
            LinkProtocol::DmsLite => 255,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Endpoint of the link, `host:port` for TCP-wrapped serial servers.
    pub uri: String,
    pub protocol: LinkProtocol,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_read_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde(default = "default_poll_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_period: Duration,
    #[serde(default)]
    pub controllers: IndexMap<String, ControllerConfig>,
}

impl LinkConfig {
    pub fn validate(&self, link_id: &str) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(anyhow!("link '{}' must declare a uri", link_id));
        }
        if self.controllers.is_empty() {
            return Err(anyhow!(
                "link '{}' must declare at least one controller",
                link_id
            ));
        }
        if self.poll_period.is_zero() || self.read_timeout.is_zero() {
            return Err(anyhow!(
                "link '{}' must use non-zero poll period and read timeout",
                link_id
            ));
        }
        for (name, controller) in &self.controllers {
            controller.validate(link_id, name, self.protocol)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Drop address on the multi-drop line.
    pub drop: u8,
    /// Number of times a recoverable protocol error is retried before the
    /// operation is failed.
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u8,
    /// Expected cabinet dip-switch setting, checked during settings download.
    #[serde(default)]
    pub cabinet_dip: Option<u8>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl ControllerConfig {
    pub fn validate(&self, link_id: &str, name: &str, protocol: LinkProtocol) -> Result<()> {
        if self.drop < 1 || self.drop > protocol.max_drop() {
            return Err(anyhow!(
                "controller '{}' on link '{}' has drop {} outside 1-{}",
                name,
                link_id,
                self.drop,
                protocol.max_drop()
            ));
        }
        let mut pins: Vec<u8> = self.devices.iter().map(|d| d.pin).collect();
        pins.sort_unstable();
        pins.dedup();
        if pins.len() != self.devices.len() {
            return Err(anyhow!(
                "controller '{}' on link '{}' assigns the same pin twice",
                name,
                link_id
            ));
        }
        for device in &self.devices {
            device.validate(link_id, name, protocol)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// I/O pin identifying the device within the controller memory map.
    pub pin: u8,
    pub kind: DeviceKind,
}

impl DeviceConfig {
    pub fn validate(&self, link_id: &str, controller: &str, protocol: LinkProtocol) -> Result<()> {
        let on_dmslite = protocol == LinkProtocol::DmsLite;
        let is_sign = matches!(self.kind, DeviceKind::Dms { .. });
        if on_dmslite != is_sign {
            return Err(anyhow!(
                "device '{}' on controller '{}' (link '{}') does not match the link protocol",
                self.name,
                controller,
                link_id
            ));
        }
        Ok(())
    }
}

/// Kind of field device attached to a controller pin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeviceKind {
    RampMeter {
        meter_type: MeterType,
        #[serde(default = "default_am_target")]
        am_target: u32,
        #[serde(default = "default_pm_target")]
        pm_target: u32,
    },
    Dms {
        /// Access-type string; "modem" selects the long operation timeout.
        #[serde(default)]
        sign_access: String,
    },
    LcsArray {
        lanes: u8,
    },
    WarningSign,
    Alarm,
    Detector {
        lane_type: LaneType,
    },
}

/// Release geometry of a ramp meter.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    /// One release per cycle; red times are halved relative to the rate.
    Single,
    /// Alternating two-lane release.
    Dual,
}

/// Lane classification of a detector input.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LaneType {
    Mainline,
    Queue,
    Exit,
    Bypass,
    Passage,
    Merge,
    Green,
}

/// System-wide ramp meter timing attributes (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterTimingConfig {
    #[serde(default = "default_green_secs")]
    pub green_secs: f32,
    #[serde(default = "default_yellow_secs")]
    pub yellow_secs: f32,
    #[serde(default = "default_min_red_secs")]
    pub min_red_secs: f32,
}

impl MeterTimingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.green_secs <= 0.0 || self.yellow_secs <= 0.0 || self.min_red_secs <= 0.0 {
            return Err(anyhow!("meter timing values must be positive"));
        }
        Ok(())
    }
}

impl Default for MeterTimingConfig {
    fn default() -> Self {
        Self {
            green_secs: default_green_secs(),
            yellow_secs: default_yellow_secs(),
            min_red_secs: default_min_red_secs(),
        }
    }
}

/// Operation timeouts for the dmslite protocol, selected by sign access type.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmsLiteConfig {
    #[serde(default = "default_op_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub op_timeout: Duration,
    #[serde(default = "default_modem_op_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub modem_op_timeout: Duration,
}

impl Default for DmsLiteConfig {
    fn default() -> Self {
        Self {
            op_timeout: default_op_timeout(),
            modem_op_timeout: default_modem_op_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [links.west-170]
        uri = "10.1.4.21:8001"
        protocol = "mndot-5"

        [links.west-170.controllers.c101]
        drop = 7
        devices = [
            { name = "M35W41", pin = 2, kind = { type = "ramp-meter", meter_type = "dual" } },
            { name = "D501", pin = 39, kind = { type = "detector", lane_type = "queue" } },
        ]

        [links.cms-east]
        uri = "10.1.9.3:9001"
        protocol = "dms-lite"

        [links.cms-east.controllers.v94e22]
        drop = 22
        devices = [
            { name = "V94E22", pin = 1, kind = { type = "dms", sign_access = "modem" } },
        ]
    "#;

    #[test]
    fn sample_config_parses_and_validates() {
        let config: AppConfig = SAMPLE.parse().expect("sample config valid");
        assert_eq!(config.links.len(), 2);
        let link = config.link("west-170").expect("link present");
        assert_eq!(link.protocol, LinkProtocol::Mndot5);
        let controller = &link.controllers["c101"];
        assert_eq!(controller.drop, 7);
        assert_eq!(controller.retry_threshold, 3);
        assert_eq!(controller.devices.len(), 2);
    }

    #[test]
    fn empty_config_is_rejected() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn drop_range_depends_on_protocol_revision() {
        let mut config: AppConfig = SAMPLE.parse().expect("sample config valid");
        config.links["west-170"].controllers["c101"].drop = 31;
        assert!(config.validate().is_ok());
        config.links["west-170"].protocol = LinkProtocol::Mndot4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_pins_are_rejected() {
        let mut config: AppConfig = SAMPLE.parse().expect("sample config valid");
        config.links["west-170"].controllers["c101"].devices[1].pin = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sign_devices_require_dmslite_links() {
        let mut config: AppConfig = SAMPLE.parse().expect("sample config valid");
        config.links["west-170"].controllers["c101"].devices[0].kind = DeviceKind::Dms {
            sign_access: String::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_takes_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("override.toml");
        std::fs::write(&path, SAMPLE).expect("write config");
        std::env::set_var(AppConfig::ENV_CONFIG_PATH, &path);
        let loaded = AppConfig::load_with_source(&["does/not/exist.toml"]).expect("load");
        std::env::remove_var(AppConfig::ENV_CONFIG_PATH);
        assert_eq!(loaded.source, path);
    }
}
