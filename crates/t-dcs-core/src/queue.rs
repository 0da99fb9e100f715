//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Priority poll queue with duplicate elimination."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::operation::{OpKey, Operation, PriorityLevel};

type BoxedOp = Box<dyn Operation>;

#[derive(Default)]
struct Inner {
    tiers: BTreeMap<PriorityLevel, VecDeque<BoxedOp>>,
    keys: HashSet<OpKey>,
    closed: bool,
}

/// Poll queue for one communication link: priority tiers served in order,
/// FIFO within a tier, duplicate operations rejected by key while queued.
#[derive(Default)]
pub struct PollQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PollQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation. A closed queue or a pending equal operation
    /// rejects the add and hands the operation back to the caller, which
    /// decides whether cleanup is owed (a requeue mid-operation) or not (a
    /// duplicate that never began).
    pub fn add(&self, op: BoxedOp) -> std::result::Result<(), BoxedOp> {
        let key = op.key();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(op);
        }
        if !inner.keys.insert(key.clone()) {
            debug!(op = %key, "DROPPING duplicate operation");
            return Err(op);
        }
        inner.tiers.entry(op.priority()).or_default().push_back(op);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next operation, waiting until one is available. Returns
    /// `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<BoxedOp> {
        loop {
            {
                let mut inner = self.inner.lock();
                let next = inner
                    .tiers
                    .values_mut()
                    .find_map(|tier| tier.pop_front());
                if let Some(op) = next {
                    inner.keys.remove(&op.key());
                    return Some(op);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue and return every pending operation so the worker can
    /// fail and clean them up.
    pub fn close(&self) -> Vec<BoxedOp> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.keys.clear();
        let drained = inner
            .tiers
            .values_mut()
            .flat_map(|tier| tier.drain(..))
            .collect();
        drop(inner);
        self.notify.notify_waiters();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tiers.values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::channel::Channel;
    use crate::devices::{Controller, StatusCommit};
    use crate::operation::{OpHeader, OpStep};
    use crate::Result;

    struct StubOp {
        header: OpHeader,
        label: &'static str,
    }

    impl StubOp {
        fn boxed(priority: PriorityLevel, label: &'static str) -> BoxedOp {
            let controller = Arc::new(Controller::new("c1", "l1", 1, 3, None));
            Box::new(Self {
                header: OpHeader::new(controller, priority),
                label,
            })
        }
    }

    #[async_trait]
    impl Operation for StubOp {
        fn name(&self) -> &'static str {
            self.label
        }

        fn header(&self) -> &OpHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut OpHeader {
            &mut self.header
        }

        async fn poll(&mut self, _channel: &mut dyn Channel) -> Result<OpStep> {
            Ok(OpStep::Done)
        }

        fn cleanup(&mut self, _commit: &StatusCommit) {}
    }

    #[tokio::test]
    async fn commands_are_served_before_downloads() {
        let queue = PollQueue::new();
        assert!(queue.add(StubOp::boxed(PriorityLevel::Download, "settings")).is_ok());
        assert!(queue.add(StubOp::boxed(PriorityLevel::Data, "samples")).is_ok());
        assert!(queue.add(StubOp::boxed(PriorityLevel::Command, "rate")).is_ok());

        assert_eq!(queue.next().await.expect("op").name(), "rate");
        assert_eq!(queue.next().await.expect("op").name(), "samples");
        assert_eq!(queue.next().await.expect("op").name(), "settings");
    }

    #[tokio::test]
    async fn duplicate_operations_are_dropped() {
        let queue = PollQueue::new();
        assert!(queue.add(StubOp::boxed(PriorityLevel::Data, "samples")).is_ok());
        assert!(queue.add(StubOp::boxed(PriorityLevel::Data, "samples")).is_err());
        assert_eq!(queue.len(), 1);

        // Once popped, the key is free again.
        let op = queue.next().await.expect("op");
        assert!(queue.add(op).is_ok());
    }

    #[tokio::test]
    async fn close_drains_pending_operations() {
        let queue = PollQueue::new();
        let _ = queue.add(StubOp::boxed(PriorityLevel::Data, "samples"));
        let _ = queue.add(StubOp::boxed(PriorityLevel::Command, "rate"));
        let drained = queue.close();
        assert_eq!(drained.len(), 2);
        assert!(queue.next().await.is_none());
        assert!(queue.add(StubOp::boxed(PriorityLevel::Data, "late")).is_err());
    }
}
