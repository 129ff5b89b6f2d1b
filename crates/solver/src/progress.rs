//! Progress records and the per-job fan-out bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kiln_graph::Digest;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Which output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// Standard output of the operation.
    Stdout,
    /// Standard error of the operation.
    Stderr,
}

/// Vertex lifecycle update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexUpdate {
    /// Vertex identity.
    pub digest: Digest,
    /// Digests of the vertex's inputs, in declared order.
    pub inputs: Vec<Digest>,
    /// Human-readable label.
    pub name: String,
    /// When work on the vertex started.
    pub started: Option<DateTime<Utc>>,
    /// When work on the vertex finished.
    pub completed: Option<DateTime<Utc>>,
    /// The vertex was satisfied from cache without running its operation.
    pub cached: bool,
    /// Terminal error, when the vertex failed.
    pub error: Option<String>,
}

/// Fine-grained operation status, e.g. transfer progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexStatus {
    /// Vertex the status belongs to.
    pub vertex: Digest,
    /// Stable identifier of the tracked activity within the vertex.
    pub id: String,
    /// Human-readable label of the activity.
    pub name: String,
    /// Units done so far.
    pub current: u64,
    /// Total units, when known.
    pub total: Option<u64>,
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// When the activity started.
    pub started: Option<DateTime<Utc>>,
    /// When the activity completed.
    pub completed: Option<DateTime<Utc>>,
}

/// A chunk of operation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexLog {
    /// Vertex the output belongs to.
    pub vertex: Digest,
    /// Stream the chunk was written to.
    pub stream: LogStream,
    /// Raw output bytes.
    pub data: Bytes,
    /// When the chunk was produced.
    pub timestamp: DateTime<Utc>,
}

/// One record on a job's progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressRecord {
    /// Vertex lifecycle transition.
    Vertex(VertexUpdate),
    /// Operation status counter.
    Status(VertexStatus),
    /// Operation log output.
    Log(VertexLog),
    /// Records were dropped because this subscriber lagged.
    Overflow {
        /// How many records were lost.
        dropped: u64,
    },
}

/// Live stream of progress records for one job.
///
/// The stream ends when the job terminates. A subscriber that falls behind
/// the bounded buffer loses the oldest records and observes a single
/// [`ProgressRecord::Overflow`] marker in their place.
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressRecord>,
}

impl ProgressStream {
    /// Next record, or `None` once the job has terminated.
    pub async fn next(&mut self) -> Option<ProgressRecord> {
        match self.rx.recv().await {
            Ok(record) => Some(record),
            Err(RecvError::Lagged(dropped)) => Some(ProgressRecord::Overflow { dropped }),
            Err(RecvError::Closed) => None,
        }
    }
}

/// Per-job bounded fan-out of progress records.
///
/// A job's channel is created lazily from either side, so subscribing before
/// the solve starts works; publication never blocks the producer.
pub(crate) struct ProgressBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressRecord>>>,
}

impl ProgressBus {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<ProgressRecord> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Deliver a record to the job's subscribers. Publication never creates
    /// a channel: records for a job nobody observes (or that already
    /// terminated) are dropped.
    pub(crate) fn publish(&self, job_id: &str, record: ProgressRecord) {
        let sender = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.get(job_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(record);
        }
    }

    pub(crate) fn subscribe(&self, job_id: &str) -> ProgressStream {
        ProgressStream {
            rx: self.sender(job_id).subscribe(),
        }
    }

    /// Drop the job's channel; live subscribers drain and then end.
    pub(crate) fn close(&self, job_id: &str) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }
}

/// Tracks which jobs are interested in a vertex and what they have already
/// been told, so started/completed are emitted exactly once per (job, vertex).
#[derive(Default)]
pub(crate) struct JobTags {
    pub(crate) jobs: HashMap<String, TagState>,
}

#[derive(Default, Clone, Copy)]
pub(crate) struct TagState {
    pub(crate) started_sent: bool,
    pub(crate) terminal_sent: bool,
}

impl JobTags {
    pub(crate) fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }
}

/// Emits status and log records for one vertex to every interested job.
///
/// Handed to operations through their context; interest is tagged at publish
/// time, so a job attaching mid-run starts receiving records immediately.
pub struct VertexProgress {
    bus: Arc<ProgressBus>,
    vertex: Digest,
    tags: Arc<Mutex<JobTags>>,
}

impl VertexProgress {
    pub(crate) fn new(bus: Arc<ProgressBus>, vertex: Digest, tags: Arc<Mutex<JobTags>>) -> Self {
        Self { bus, vertex, tags }
    }

    fn publish_all(&self, record: ProgressRecord) {
        let job_ids = {
            let tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
            tags.job_ids()
        };
        for job_id in job_ids {
            self.bus.publish(&job_id, record.clone());
        }
    }

    /// Publish a status counter for this vertex.
    pub fn status(&self, id: &str, name: &str, current: u64, total: Option<u64>) {
        let now = Utc::now();
        self.publish_all(ProgressRecord::Status(VertexStatus {
            vertex: self.vertex,
            id: id.to_string(),
            name: name.to_string(),
            current,
            total,
            timestamp: now,
            started: Some(now),
            completed: None,
        }));
    }

    /// Publish a chunk of operation output for this vertex.
    pub fn log(&self, stream: LogStream, data: impl Into<Bytes>) {
        self.publish_all(ProgressRecord::Log(VertexLog {
            vertex: self.vertex,
            stream,
            data: data.into(),
            timestamp: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(digest: Digest) -> ProgressRecord {
        ProgressRecord::Vertex(VertexUpdate {
            digest,
            inputs: Vec::new(),
            name: "v".to_string(),
            started: None,
            completed: None,
            cached: false,
            error: None,
        })
    }

    #[tokio::test]
    async fn records_arrive_in_publication_order() {
        let bus = ProgressBus::new(16);
        let mut stream = bus.subscribe("job-1");
        let a = Digest::from_bytes(b"a");
        let b = Digest::from_bytes(b"b");
        bus.publish("job-1", update(a));
        bus.publish("job-1", update(b));
        bus.close("job-1");

        match stream.next().await {
            Some(ProgressRecord::Vertex(v)) => assert_eq!(v.digest, a),
            other => panic!("unexpected record: {other:?}"),
        }
        match stream.next().await {
            Some(ProgressRecord::Vertex(v)) => assert_eq!(v.digest, b),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_overflow_marker() {
        let bus = ProgressBus::new(1);
        let mut stream = bus.subscribe("job-1");
        for i in 0..4u8 {
            bus.publish("job-1", update(Digest::from_bytes(&[i])));
        }
        match stream.next().await {
            Some(ProgressRecord::Overflow { dropped }) => assert!(dropped >= 1),
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn jobs_are_isolated() {
        let bus = ProgressBus::new(16);
        let mut one = bus.subscribe("job-1");
        let _two = bus.subscribe("job-2");
        bus.publish("job-2", update(Digest::from_bytes(b"x")));
        bus.close("job-1");
        assert!(one.next().await.is_none());
    }
}
