//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Operation state machine contract and priorities."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use strum::Display;

use crate::channel::Channel;
use crate::devices::{Controller, StatusCommit};
use crate::{CommError, Result};

/// Scheduling tiers, in service order. Operator commands are served first;
/// background settings downloads last. FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLevel {
    Command,
    Diagnostic,
    Data,
    Download,
}

/// Outcome of one scheduling turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStep {
    /// The operation has more phases; requeue it.
    Continue,
    /// Terminal phase reached; run cleanup.
    Done,
}

/// Identity used to deduplicate queued operations: a second request for the
/// same work against the same controller is dropped while one is pending.
pub type OpKey = String;

/// A sequenced, resumable unit of work against one controller.
///
/// The link worker calls [`poll`](Operation::poll) once per scheduling turn;
/// each call performs at most one request/response exchange (one phase) and
/// reports whether the chain continues. After the terminal phase, or on any
/// error, [`cleanup`](Operation::cleanup) runs exactly once and is the only
/// place device status may be committed.
#[async_trait]
pub trait Operation: Send {
    /// Short operation name used in logs, metrics, and dedup keys.
    fn name(&self) -> &'static str;

    fn header(&self) -> &OpHeader;

    fn header_mut(&mut self) -> &mut OpHeader;

    /// Run the current phase against the link channel.
    async fn poll(&mut self, channel: &mut dyn Channel) -> Result<OpStep>;

    /// Commit results (on success) or record the failure, then release the
    /// operation. Runs exactly once, on the link worker.
    fn cleanup(&mut self, commit: &StatusCommit);

    fn controller(&self) -> &Arc<Controller> {
        &self.header().controller
    }

    fn priority(&self) -> PriorityLevel {
        self.header().priority
    }

    fn set_priority(&mut self, priority: PriorityLevel) {
        self.header_mut().priority = priority;
    }

    fn key(&self) -> OpKey {
        format!("{}:{}", self.header().controller.name(), self.name())
    }

    fn success(&self) -> bool {
        self.header().success
    }
}

/// Bookkeeping shared by every operation: priority, target controller, and
/// the success/error outcome inspected by `cleanup`.
#[derive(Debug)]
pub struct OpHeader {
    pub controller: Arc<Controller>,
    pub priority: PriorityLevel,
    pub success: bool,
    pub error_status: Option<String>,
}

impl OpHeader {
    pub fn new(controller: Arc<Controller>, priority: PriorityLevel) -> Self {
        Self {
            controller,
            priority,
            success: true,
            error_status: None,
        }
    }

    /// Record a terminal failure; the first recorded status wins.
    pub fn fail(&mut self, status: impl Into<String>) {
        self.success = false;
        if self.error_status.is_none() {
            self.error_status = Some(status.into());
        }
    }

    pub fn fail_on(&mut self, error: &CommError) {
        self.fail(error.to_string());
    }

    pub fn error_status(&self) -> Option<&str> {
        self.error_status.as_deref()
    }

    /// Commit the shared outcome fields onto the controller.
    pub fn commit_outcome(&self, commit: &StatusCommit) {
        self.controller.set_failed(commit, !self.success);
        if let Some(status) = &self.error_status {
            self.controller.set_error_status(commit, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_commands_before_downloads() {
        assert!(PriorityLevel::Command < PriorityLevel::Diagnostic);
        assert!(PriorityLevel::Diagnostic < PriorityLevel::Data);
        assert!(PriorityLevel::Data < PriorityLevel::Download);
    }

    #[test]
    fn first_failure_status_wins() {
        let controller = Arc::new(Controller::new("c1", "l1", 1, 3, None));
        let mut header = OpHeader::new(controller, PriorityLevel::Data);
        header.fail("NO DATA");
        header.fail("second");
        assert!(!header.success);
        assert_eq!(header.error_status(), Some("NO DATA"));
    }
}
