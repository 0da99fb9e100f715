//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Device model and operation engine for field controllers."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
//! Device model and operation engine for roadside field controllers.
//!
//! An [`Operation`](operation::Operation) is a multi-phase exchange against
//! one controller. Operations are queued per communication link, ordered by
//! priority, and executed one phase at a time by the link's worker task so
//! that at most one request/response exchange is in flight per physical
//! line. Device status is committed only when an operation finishes, through
//! a [`StatusCommit`](devices::StatusCommit) handle, so observers never see
//! a half-updated device.

pub mod channel;
pub mod devices;
pub mod link;
pub mod operation;
pub mod poller;
pub mod queue;

/// Shared result type for engine operations.
pub type Result<T> = std::result::Result<T, CommError>;

/// Failure taxonomy for device communication.
///
/// Transport errors ([`Io`](CommError::Io), [`Timeout`](CommError::Timeout))
/// trigger the link reopen policy; framing errors
/// ([`Checksum`](CommError::Checksum), [`Parsing`](CommError::Parsing)) drain
/// the channel input; contract violations
/// ([`Encoding`](CommError::Encoding), [`InvalidAddress`](CommError::InvalidAddress))
/// are raised at encode time before any bytes are written.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("poll timeout expired")]
    Timeout,
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },
    #[error("parsing error: {0}")]
    Parsing(String),
    #[error("invalid drop address {0}")]
    InvalidAddress(u8),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("controller error: {0}")]
    Controller(String),
    #[error("download request from controller")]
    DownloadRequest,
    #[error("poll queue drained: {0}")]
    QueueDrained(String),
}

impl CommError {
    /// Transport failures require the channel to be reopened.
    pub fn requires_reopen(&self) -> bool {
        matches!(self, CommError::Io(_) | CommError::Timeout)
    }

    /// Framing failures leave unread garbage on the line; drain it before
    /// the next exchange.
    pub fn requires_drain(&self) -> bool {
        matches!(self, CommError::Checksum { .. } | CommError::Parsing(_))
    }
}

pub use channel::{Channel, ChannelFactory, ScriptedChannel, TcpChannel, TcpChannelFactory};
pub use devices::{
    Alarm, Controller, Detector, DeviceEvent, DeviceRegistry, Dms, LcsArray, LcsIndication,
    RampMeter, SignConfig, SignMessage, SignPage, StatusCommit, WarningSign,
};
pub use link::{CommLink, LinkHandle};
pub use operation::{OpHeader, OpStep, Operation, PriorityLevel};
pub use poller::{
    AlarmPoller, DeviceRequest, LcsPoller, MeterPoller, SamplePoller, SampleInterval, SignPoller,
    WarningSignPoller,
};
pub use queue::PollQueue;
