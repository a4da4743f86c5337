//! Contracts towards the caller layer: push notifications and record persistence.
//!
//! Both are best-effort. A failed notification or a failed write must never
//! abort the execution or debug session it describes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::debug::{DebugSession, StackFrame};
use crate::execution::{ExecutionRecord, ExecutionStatus};
use crate::runtime::StreamKind;

/// Event pushed to an owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    /// An execution moved to a new phase.
    ExecutionStatus {
        execution_id: String,
        status: ExecutionStatus,
        message: String,
    },
    /// One chunk of execution output, forwarded as it arrives.
    ExecutionOutput {
        execution_id: String,
        stream: StreamKind,
        data: String,
    },
    /// An execution finished; the program's exit code may still be non-zero.
    ExecutionComplete {
        execution_id: String,
        stdout: String,
        stderr: String,
        exit_code: i64,
        duration_ms: u64,
    },
    /// An execution failed (timeout or infrastructure error).
    ExecutionError { execution_id: String, error: String },
    /// The debuggee stopped.
    DebugPaused {
        session_id: String,
        reason: String,
        line: Option<i64>,
        frames: Vec<StackFrame>,
        variables: BTreeMap<String, String>,
    },
    /// Program output captured by the debugger.
    DebugOutput {
        session_id: String,
        category: String,
        content: String,
    },
    /// The debug session ended.
    DebugTerminated { session_id: String },
    /// A session was torn down without the owner asking for it.
    SessionTerminated { session_id: String, reason: String },
}

/// Delivers events to an owner. Delivery is at-least-once, best-effort, unacknowledged.
pub trait Notifier: Send + Sync {
    fn notify(&self, owner_id: &str, event: SandboxEvent);

    /// The owner is gone for good; anything still held for them can go.
    fn forget(&self, _owner_id: &str) {}
}

/// Persists execution and debug records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()>;

    async fn save_debug_session(&self, owner_id: &str, session: &DebugSession) -> anyhow::Result<()>;
}

/// Save an execution record, logging and swallowing failures.
pub async fn persist_execution(store: &dyn RecordStore, record: &ExecutionRecord) {
    if let Err(e) = store.save_execution(record).await {
        warn!(execution = %record.id, error = %e, "Failed to persist execution record");
    }
}

/// Save a debug session record, logging and swallowing failures.
pub async fn persist_debug_session(store: &dyn RecordStore, owner_id: &str, session: &DebugSession) {
    if let Err(e) = store.save_debug_session(owner_id, session).await {
        warn!(session = %session.id, error = %e, "Failed to persist debug session record");
    }
}

/// Queues events per owner until the caller layer drains them.
///
/// Each owner's queue is bounded; the oldest events are dropped first.
#[derive(Debug)]
pub struct EventMailbox {
    queues: Mutex<HashMap<String, VecDeque<SandboxEvent>>>,
    capacity: usize,
}

impl Default for EventMailbox {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Take every queued event for an owner, oldest first.
    pub fn drain(&self, owner_id: &str) -> Vec<SandboxEvent> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues
            .remove(owner_id)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

impl Notifier for EventMailbox {
    fn notify(&self, owner_id: &str, event: SandboxEvent) {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let queue = queues.entry(owner_id.to_string()).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
            debug!(owner = %owner_id, "Event queue full, dropped oldest event");
        }
        queue.push_back(event);
    }

    fn forget(&self, owner_id: &str) {
        let dropped = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(owner_id);
        if let Some(queue) = dropped {
            debug!(owner = %owner_id, events = queue.len(), "Dropped undelivered events");
        }
    }
}

/// Record store that only logs. Used when no persistence layer is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecordStore;

#[async_trait]
impl RecordStore for LogRecordStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        debug!(
            execution = %record.id,
            status = ?record.status,
            exit_code = ?record.exit_code,
            "Execution record"
        );
        Ok(())
    }

    async fn save_debug_session(&self, owner_id: &str, session: &DebugSession) -> anyhow::Result<()> {
        debug!(
            session = %session.id,
            owner = %owner_id,
            status = ?session.status,
            "Debug session record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminated(id: &str) -> SandboxEvent {
        SandboxEvent::DebugTerminated {
            session_id: id.into(),
        }
    }

    #[test]
    fn mailbox_queues_per_owner() {
        let mailbox = EventMailbox::default();
        mailbox.notify("alice", terminated("a1"));
        mailbox.notify("bob", terminated("b1"));
        mailbox.notify("alice", terminated("a2"));

        assert_eq!(mailbox.drain("alice"), vec![terminated("a1"), terminated("a2")]);
        assert!(mailbox.drain("alice").is_empty());
        assert_eq!(mailbox.drain("bob").len(), 1);
    }

    #[test]
    fn mailbox_drops_oldest_when_full() {
        let mailbox = EventMailbox::new(2);
        for i in 0..3 {
            mailbox.notify("alice", terminated(&i.to_string()));
        }
        assert_eq!(mailbox.drain("alice"), vec![terminated("1"), terminated("2")]);
    }

    #[test]
    fn forgotten_owners_leave_no_queue() {
        let mailbox = EventMailbox::default();
        mailbox.notify("guest-1", terminated("g1"));
        mailbox.notify("alice", terminated("a1"));

        mailbox.forget("guest-1");
        mailbox.forget("never-seen");

        let queues = mailbox.queues.lock().unwrap();
        assert_eq!(queues.len(), 1);
        assert!(queues.contains_key("alice"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SandboxEvent::ExecutionOutput {
            execution_id: "e1".into(),
            stream: StreamKind::Stdout,
            data: "ok\n".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_output");
        assert_eq!(json["stream"], "stdout");
    }
}
