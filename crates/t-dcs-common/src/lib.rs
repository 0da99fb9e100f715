//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Shared primitives and utilities for the driver runtime."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Shared primitives for the T-DCS driver workspace.
//! This crate exposes configuration loading, logging, and time utilities
//! consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ControllerConfig, DeviceConfig, DeviceKind, DmsLiteConfig, LaneType, LinkConfig,
    LinkProtocol, LoggingConfig, MeterTimingConfig, MeterType, MetricsConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{monotonic_now, FixedClock, SystemClock, WallClock};
