//! Per-job event fan-out.
//!
//! Subscribers attach to one job and receive a replay of the current job
//! snapshot followed by every subsequent lifecycle event, until they
//! disconnect or the job reaches a terminal state. Delivery is best-effort
//! per subscriber: a stalled subscriber loses its own events and never
//! blocks the publishing task or other subscribers.

use crate::artifacts::Artifact;
use crate::job::{Job, JobId};
use crate::logs::LogEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Per-subscriber delivery queue depth.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A discrete event on a job's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Snapshot replayed to a subscriber when it joins.
    #[serde(rename = "job:state")]
    State { job_id: JobId, data: Box<Job> },
    /// The job's fields changed (status, stage, progress, ...).
    #[serde(rename = "job:updated")]
    Updated { job_id: JobId, data: Box<Job> },
    #[serde(rename = "log")]
    Log { job_id: JobId, data: LogEntry },
    #[serde(rename = "artifact:created")]
    ArtifactCreated { job_id: JobId, data: Artifact },
    #[serde(rename = "metrics:updated")]
    MetricsUpdated { job_id: JobId, data: serde_json::Map<String, serde_json::Value> },
    /// Final event on a stream; the hub closes the subscription after it.
    #[serde(rename = "terminal")]
    Terminal { job_id: JobId, data: Box<Job> },
}

impl JobEvent {
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::State { job_id, .. }
            | Self::Updated { job_id, .. }
            | Self::Log { job_id, .. }
            | Self::ArtifactCreated { job_id, .. }
            | Self::MetricsUpdated { job_id, .. }
            | Self::Terminal { job_id, .. } => job_id,
        }
    }
}

/// Abstract subscriber endpoint, decoupled from any wire transport.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Returns `false` once the sink is gone and should
    /// be dropped by the hub.
    fn send(&self, event: &JobEvent) -> bool;

    /// Closes the sink from the hub side.
    fn close(&self);
}

/// `EventSink` backed by a bounded tokio channel.
///
/// A full queue drops the event for this subscriber only.
struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
    closed: AtomicBool,
}

impl EventSink for ChannelSink {
    fn send(&self, event: &JobEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(job_id = %event.job_id(), "subscriber queue full, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct SubscriberEntry {
    id: u64,
    sink: Arc<dyn EventSink>,
}

/// Publish/subscribe hub fanning job events out to live subscribers.
///
/// Publishing to a job with no subscribers is a no-op; nothing is buffered
/// beyond the snapshot replayed on join.
pub struct EventHub {
    subscribers: RwLock<HashMap<JobId, Vec<SubscriberEntry>>>,
    next_subscription_id: AtomicU64,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("active_subscriptions", &self.active_subscriptions())
            .finish_non_exhaustive()
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(HashMap::new()), next_subscription_id: AtomicU64::new(1) }
    }

    fn read_subscribers(&self) -> RwLockReadGuard<'_, HashMap<JobId, Vec<SubscriberEntry>>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscribers(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Vec<SubscriberEntry>>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches an arbitrary sink to a job's stream.
    ///
    /// # Returns
    /// The subscription id to use with [`EventHub::unsubscribe`].
    pub fn attach(&self, job_id: JobId, sink: Arc<dyn EventSink>) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.write_subscribers();
        subscribers.entry(job_id).or_default().push(SubscriberEntry { id, sink });
        id
    }

    /// Subscribes to a job's stream via a channel-backed subscription.
    ///
    /// The current snapshot is replayed to the new subscriber immediately.
    /// If the job is already terminal, the subscription receives the snapshot
    /// and the terminal event, then closes.
    pub fn subscribe(self: &Arc<Self>, snapshot: &Job) -> JobSubscription {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sink = Arc::new(ChannelSink { tx, closed: AtomicBool::new(false) });
        let job_id = snapshot.id.clone();
        let id = self.attach(job_id.clone(), sink.clone());
        debug!(job_id = %job_id, subscription = id, "subscriber attached");

        sink.send(&JobEvent::State { job_id: job_id.clone(), data: Box::new(snapshot.clone()) });
        if snapshot.status.is_terminal() {
            sink.send(&JobEvent::Terminal {
                job_id: job_id.clone(),
                data: Box::new(snapshot.clone()),
            });
            self.unsubscribe(&job_id, id);
        }

        JobSubscription { id, job_id, rx, hub: Arc::clone(self) }
    }

    /// Detaches one subscriber. Idempotent; safe after the hub already
    /// closed the subscription.
    pub fn unsubscribe(&self, job_id: &JobId, subscription_id: u64) {
        let mut subscribers = self.write_subscribers();
        if let Some(entries) = subscribers.get_mut(job_id) {
            if let Some(index) = entries.iter().position(|e| e.id == subscription_id) {
                let entry = entries.remove(index);
                entry.sink.close();
                debug!(job_id = %job_id, subscription = subscription_id, "subscriber detached");
            }
            if entries.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }

    /// Fans an event out to the job's subscribers.
    ///
    /// A terminal event additionally closes every subscription for the job.
    pub fn publish(&self, event: &JobEvent) {
        let job_id = event.job_id().clone();
        let mut dead = Vec::new();
        {
            let subscribers = self.read_subscribers();
            let Some(entries) = subscribers.get(&job_id) else {
                return;
            };
            for entry in entries {
                if !entry.sink.send(event) {
                    dead.push(entry.id);
                }
            }
        }

        if matches!(event, JobEvent::Terminal { .. }) {
            self.close_job(&job_id);
        } else if !dead.is_empty() {
            let mut subscribers = self.write_subscribers();
            if let Some(entries) = subscribers.get_mut(&job_id) {
                entries.retain(|e| !dead.contains(&e.id));
                if entries.is_empty() {
                    subscribers.remove(&job_id);
                }
            }
        }
    }

    /// Closes and removes every subscription for a job.
    pub fn close_job(&self, job_id: &JobId) {
        let mut subscribers = self.write_subscribers();
        if let Some(entries) = subscribers.remove(job_id) {
            debug!(job_id = %job_id, count = entries.len(), "closing job subscriptions");
            for entry in entries {
                entry.sink.close();
            }
        }
    }

    /// Number of currently attached subscribers across all jobs.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.read_subscribers().values().map(Vec::len).sum()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one job's event stream.
pub struct JobSubscription {
    id: u64,
    job_id: JobId,
    rx: mpsc::Receiver<JobEvent>,
    hub: Arc<EventHub>,
}

impl JobSubscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Receives the next event; `None` once the hub closed the stream and
    /// all buffered events are drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Detaches from the hub. Idempotent.
    pub fn unsubscribe(&self) {
        self.hub.unsubscribe(&self.job_id, self.id);
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
