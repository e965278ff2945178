//! Ingest queues between the RPC layer and the main loop
//!
//! Multi-producer, single-consumer, unbounded, FIFO. The server thread (and
//! tests) hold cloned senders; only the main loop drains. Draining is
//! non-blocking and happens at the points fixed by the tick order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Severity of a task message, mapped to a log level on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

/// A status message from (or about) a task job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMsg {
    /// Fully qualified job id, `point/name/submit_num`.
    pub job_id: String,
    pub severity: Severity,
    /// Message text; standard lifecycle messages double as output labels.
    pub message: String,
    pub event_time: DateTime<Utc>,
}

impl TaskMsg {
    pub fn new(job_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            severity,
            message: message.into(),
            event_time: Utc::now(),
        }
    }
}

/// A workflow-external event, matched by name against tasks that declare it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtTriggerMsg {
    pub trigger: String,
    /// Opaque identifier from the event producer, echoed into logs.
    pub id: String,
}

/// One MPSC ingest queue.
pub struct IngestQueue<T> {
    tx: UnboundedSender<T>,
    rx: UnboundedReceiver<T>,
}

impl<T> IngestQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A sender handle for producer threads.
    pub fn sender(&self) -> UnboundedSender<T> {
        self.tx.clone()
    }

    /// Push from the consumer side (commands can re-queue commands).
    pub fn push(&self, item: T) {
        // Cannot fail: we hold both ends.
        let _ = self.tx.send(item);
    }

    /// Drain everything currently queued, preserving FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

impl<T> Default for IngestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let mut queue = IngestQueue::new();
        let tx = queue.sender();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        queue.push(3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let mut queue = IngestQueue::new();
        let tx1 = queue.sender();
        let tx2 = queue.sender();
        tx1.send("a").unwrap();
        tx2.send("b").unwrap();
        assert_eq!(queue.drain().len(), 2);
    }

    #[test]
    fn test_task_msg_serde() {
        let msg = TaskMsg::new("1/foo/01", Severity::Info, "succeeded");
        let json = serde_json::to_string(&msg).unwrap();
        let back: TaskMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
