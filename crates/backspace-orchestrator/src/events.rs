//! Progress events - ordered, replayable per-job broadcast
//!
//! Each job has one [`EventEmitter`] (single writer) and any number of
//! [`Subscription`]s. Sequence numbers start at 0 and increase by one per
//! event. A bounded ring of recent events backs replay; a subscriber that
//! asks for an offset older than the ring, or falls behind it, receives
//! [`StreamItem::ReplayUnavailable`] and continues from the oldest retained
//! event.

use backspace_core::{
    AbortReason, AppliedDiff, BackspaceError, ChangedFile, JobId, PublishedReference, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    JobStarted {
        repository: String,
        change_description: String,
        retry_budget: u32,
    },
    Materialized {
        bytes: u64,
    },
    AttemptStarted {
        attempt: u32,
    },
    GenerationComplete {
        attempt: u32,
        edits: usize,
        summary: Option<String>,
    },
    ApplyConflict {
        attempt: u32,
        detail: String,
    },
    ApplyComplete {
        attempt: u32,
        files: Vec<ChangedFile>,
    },
    CommandFinished {
        name: String,
        passed: bool,
        exit_code: Option<i32>,
        timed_out: bool,
    },
    ValidationComplete {
        attempt: u32,
        passed: bool,
    },
    AttemptRevising {
        attempt: u32,
        diagnostics: String,
    },
    JobAccepted {
        diff: AppliedDiff,
    },
    PublishStarted,
    Published {
        reference: PublishedReference,
    },
    PublishFailed {
        reason: String,
    },
    JobAborted {
        reason: AbortReason,
        message: String,
        diagnostics: Option<String>,
    },
    WorkspaceTornDown,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::Materialized { .. } => "materialized",
            Self::AttemptStarted { .. } => "attempt_started",
            Self::GenerationComplete { .. } => "generation_complete",
            Self::ApplyConflict { .. } => "apply_conflict",
            Self::ApplyComplete { .. } => "apply_complete",
            Self::CommandFinished { .. } => "command_finished",
            Self::ValidationComplete { .. } => "validation_complete",
            Self::AttemptRevising { .. } => "attempt_revising",
            Self::JobAccepted { .. } => "job_accepted",
            Self::PublishStarted => "publish_started",
            Self::Published { .. } => "published",
            Self::PublishFailed { .. } => "publish_failed",
            Self::JobAborted { .. } => "job_aborted",
            Self::WorkspaceTornDown => "workspace_torn_down",
        }
    }
}

/// One entry of a job's event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(ProgressEvent),
    /// Events `requested..earliest` are gone; the stream resumes at `earliest`
    ReplayUnavailable { requested: u64, earliest: u64 },
}

#[derive(Debug)]
struct Inner {
    next_seq: u64,
    aborted: bool,
    buffer: VecDeque<ProgressEvent>,
    /// Dropped on close so live receivers see the end of the stream
    sender: Option<broadcast::Sender<ProgressEvent>>,
}

impl Inner {
    fn earliest(&self) -> u64 {
        self.buffer.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }

    fn retained_from(&self, from: u64) -> VecDeque<ProgressEvent> {
        self.buffer.iter().filter(|e| e.seq >= from).cloned().collect()
    }
}

/// Single-writer event channel for one job
#[derive(Debug)]
pub struct EventEmitter {
    job_id: JobId,
    retention: usize,
    inner: Mutex<Inner>,
}

impl EventEmitter {
    pub fn new(job_id: JobId, retention: usize) -> Arc<Self> {
        let retention = retention.max(1);
        let (sender, _) = broadcast::channel(retention);
        Arc::new(Self {
            job_id,
            retention,
            inner: Mutex::new(Inner {
                next_seq: 0,
                aborted: false,
                buffer: VecDeque::with_capacity(retention),
                sender: Some(sender),
            }),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and deliver it to live subscribers
    ///
    /// Returns the assigned sequence number. Events emitted after
    /// [`close`](Self::close) are dropped and return `None`.
    pub fn emit(&self, kind: EventKind) -> Option<u64> {
        let mut inner = self.lock();
        let sender = inner.sender.clone()?;

        let event = ProgressEvent {
            job_id: self.job_id,
            seq: inner.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        debug!(job_id = %self.job_id, seq = event.seq, "event {}", event.kind.name());

        inner.next_seq += 1;
        inner.aborted |= matches!(event.kind, EventKind::JobAborted { .. });
        if inner.buffer.len() == self.retention {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event.clone());
        // No receivers is fine; the buffer still serves replays
        let _ = sender.send(event.clone());
        Some(event.seq)
    }

    /// End the stream; subscribers finish after draining
    pub fn close(&self) {
        self.lock().sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    /// Whether a `JobAborted` event has been emitted
    pub fn has_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Sequence number the next event will get
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Retained events with `seq >= from`
    pub fn history(&self, from: u64) -> Vec<ProgressEvent> {
        self.lock().retained_from(from).into_iter().collect()
    }

    /// Subscribe starting at sequence number `from`
    ///
    /// Replay and live delivery are stitched under the same lock, so the
    /// subscriber sees every event from its offset exactly once and in order.
    pub fn subscribe(self: &Arc<Self>, from: u64) -> Subscription {
        let inner = self.lock();
        let earliest = inner.earliest();

        let mut pending = VecDeque::new();
        let mut expected = from;
        if from < earliest {
            pending.push_back(StreamItem::ReplayUnavailable {
                requested: from,
                earliest,
            });
            expected = earliest;
        }
        pending.extend(inner.retained_from(expected).into_iter().map(StreamItem::Event));
        if let Some(StreamItem::Event(last)) = pending.back() {
            expected = last.seq + 1;
        }

        let receiver = inner.sender.as_ref().map(|s| s.subscribe());
        drop(inner);

        Subscription {
            emitter: Arc::clone(self),
            pending,
            receiver,
            expected,
        }
    }
}

/// An ordered view of one job's events from some offset
#[derive(Debug)]
pub struct Subscription {
    emitter: Arc<EventEmitter>,
    pending: VecDeque<StreamItem>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    /// Sequence number of the next event to hand out
    expected: u64,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.emitter.job_id()
    }

    /// Next item, or `None` once the job's stream is closed and drained
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) if event.seq < self.expected => continue,
                Ok(event) if event.seq == self.expected => {
                    self.expected += 1;
                    return Some(StreamItem::Event(event));
                }
                Ok(_) => self.resync(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(job_id = %self.job_id(), "subscriber lagged by {}", skipped);
                    self.resync();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    // Anything emitted between our last receive and close
                    self.resync();
                }
            }
        }
    }

    /// Refill `pending` from the emitter's ring after a gap
    fn resync(&mut self) {
        let inner = self.emitter.lock();
        let earliest = inner.earliest();
        if self.expected < earliest {
            self.pending.push_back(StreamItem::ReplayUnavailable {
                requested: self.expected,
                earliest,
            });
            self.expected = earliest;
        }
        for event in inner.retained_from(self.expected) {
            self.expected = event.seq + 1;
            self.pending.push_back(StreamItem::Event(event));
        }
    }

    /// Collect every remaining event, ignoring replay gaps
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            if let StreamItem::Event(event) = item {
                events.push(event);
            }
        }
        events
    }
}

/// Registry of per-job emitters
#[derive(Debug)]
pub struct EventHub {
    retention: usize,
    emitters: Mutex<HashMap<JobId, Arc<EventEmitter>>>,
}

impl EventHub {
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            emitters: Mutex::new(HashMap::new()),
        }
    }

    /// Emitter for a new job
    pub fn register(&self, job_id: JobId) -> Arc<EventEmitter> {
        let emitter = EventEmitter::new(job_id, self.retention);
        self.emitters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, Arc::clone(&emitter));
        emitter
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<EventEmitter>> {
        self.emitters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
    }

    pub fn subscribe(&self, job_id: JobId, from: u64) -> Result<Subscription> {
        self.get(job_id)
            .map(|emitter| emitter.subscribe(from))
            .ok_or_else(|| BackspaceError::JobNotFound(job_id.to_string()))
    }

    pub fn remove(&self, job_id: JobId) -> Option<Arc<EventEmitter>> {
        self.emitters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(attempt: u32) -> EventKind {
        EventKind::AttemptStarted { attempt }
    }

    fn seqs(items: &[StreamItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Event(e) => Some(e.seq),
                _ => None,
            })
            .collect()
    }

    async fn drain(mut sub: Subscription) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = sub.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_contiguous() {
        let emitter = EventEmitter::new(JobId::new(), 16);
        let sub = emitter.subscribe(0);
        for i in 0..5 {
            assert_eq!(emitter.emit(attempt(i)), Some(i as u64));
        }
        emitter.close();

        let items = drain(sub).await;
        assert_eq!(seqs(&items), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_replay_then_live() {
        let emitter = EventEmitter::new(JobId::new(), 16);
        emitter.emit(attempt(1));
        emitter.emit(attempt(2));
        emitter.emit(attempt(3));

        let sub = emitter.subscribe(1);
        emitter.emit(attempt(4));
        emitter.close();

        assert_eq!(seqs(&drain(sub).await), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_replay_unavailable_past_retention() {
        let emitter = EventEmitter::new(JobId::new(), 3);
        for i in 0..6 {
            emitter.emit(attempt(i));
        }
        emitter.close();

        let items = drain(emitter.subscribe(1)).await;
        assert_eq!(
            items[0],
            StreamItem::ReplayUnavailable {
                requested: 1,
                earliest: 3
            }
        );
        assert_eq!(seqs(&items), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs_in_order() {
        let emitter = EventEmitter::new(JobId::new(), 4);
        let sub = emitter.subscribe(0);
        // Overflows the broadcast channel and the ring
        for i in 0..10 {
            emitter.emit(attempt(i));
        }
        emitter.close();

        let items = drain(sub).await;
        let seen = seqs(&items);
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1), "{:?}", seen);
        assert_eq!(seen.last(), Some(&9));
        assert!(items
            .iter()
            .any(|i| matches!(i, StreamItem::ReplayUnavailable { requested: 0, .. })));
    }

    #[tokio::test]
    async fn test_future_offset_skips_earlier_events() {
        let emitter = EventEmitter::new(JobId::new(), 16);
        let sub = emitter.subscribe(2);
        for i in 0..4 {
            emitter.emit(attempt(i));
        }
        emitter.close();
        assert_eq!(seqs(&drain(sub).await), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_emit_after_close_is_dropped() {
        let emitter = EventEmitter::new(JobId::new(), 16);
        emitter.emit(attempt(1));
        emitter.close();
        assert_eq!(emitter.emit(attempt(2)), None);
        assert_eq!(emitter.next_seq(), 1);
        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn test_abort_marker_survives_eviction() {
        let emitter = EventEmitter::new(JobId::new(), 1);
        assert!(!emitter.has_aborted());
        emitter.emit(EventKind::JobAborted {
            reason: AbortReason::Cancelled,
            message: "Job cancelled".to_string(),
            diagnostics: None,
        });
        emitter.emit(EventKind::WorkspaceTornDown);
        assert!(emitter.has_aborted());
        assert!(emitter.history(0).iter().all(|e| e.kind.name() != "job_aborted"));
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_see_same_order() {
        let emitter = EventEmitter::new(JobId::new(), 64);
        let subs: Vec<_> = (0..3).map(|_| emitter.subscribe(0)).collect();
        let handles: Vec<_> = subs
            .into_iter()
            .map(|s| tokio::spawn(async move { s.collect().await }))
            .collect();

        let writer = {
            let emitter = Arc::clone(&emitter);
            tokio::spawn(async move {
                for i in 0..20 {
                    emitter.emit(attempt(i));
                    tokio::task::yield_now().await;
                }
                emitter.close();
            })
        };
        writer.await.unwrap();

        for handle in handles {
            let events = handle.await.unwrap();
            let seen: Vec<u64> = events.iter().map(|e| e.seq).collect();
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_event_serde_shape() {
        let event = ProgressEvent {
            job_id: JobId::new(),
            seq: 7,
            timestamp: Utc::now(),
            kind: EventKind::ValidationComplete {
                attempt: 2,
                passed: false,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "validation_complete");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["passed"], false);
    }

    #[test]
    fn test_hub_subscribe_unknown_job() {
        let hub = EventHub::new(8);
        assert!(matches!(
            hub.subscribe(JobId::new(), 0),
            Err(BackspaceError::JobNotFound(_))
        ));
        let id = JobId::new();
        hub.register(id);
        assert!(hub.subscribe(id, 0).is_ok());
        assert!(hub.remove(id).is_some());
        assert!(hub.get(id).is_none());
    }
}
