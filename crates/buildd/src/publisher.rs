//! Event publisher.
//!
//! One ordered log per project: every published event gets the next sequence
//! number, lands in a bounded replay buffer, and is pushed to the single
//! attached subscriber if there is one. Sequence assignment, buffering and
//! delivery all happen under the project's lock, so a subscriber sees events
//! in sequence order with no gaps between replay and live delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use build_core::events::{Event, EventKind, EventPayload};
use build_core::{Config, Id, ProjectId};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ProjectLog {
    next_sequence: u64,
    buffer: VecDeque<Event>,
    subscriber: Option<mpsc::Sender<Event>>,
    /// Sequence of the latest run-started event.
    run_start: Option<u64>,
}

impl ProjectLog {
    fn push(&mut self, event: Event, depth: usize) {
        if event.kind == EventKind::RunStarted {
            self.run_start = Some(event.sequence);
        }
        self.buffer.push_back(event);
        while self.buffer.len() > depth {
            // Only the newest terminal event is pinned; older runs' outcomes
            // age out like everything else.
            let newest_terminal = self.buffer.iter().rposition(|e| e.kind.is_terminal());
            match (0..self.buffer.len()).find(|&i| Some(i) != newest_terminal) {
                Some(index) => {
                    self.buffer.remove(index);
                }
                None => break,
            }
        }
    }
}

pub struct EventPublisher {
    depth: usize,
    send_timeout: Duration,
    logs: Mutex<HashMap<ProjectId, Arc<AsyncMutex<ProjectLog>>>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("depth", &self.depth)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(depth: usize, send_timeout: Duration) -> Self {
        Self {
            depth: depth.max(1),
            send_timeout,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.event_buffer_depth,
            Duration::from_millis(config.subscriber_send_timeout_ms),
        )
    }

    fn log(&self, project_id: &ProjectId) -> Arc<AsyncMutex<ProjectLog>> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(logs.entry(project_id.clone()).or_insert_with(|| {
            Arc::new(AsyncMutex::new(ProjectLog {
                next_sequence: 1,
                ..ProjectLog::default()
            }))
        }))
    }

    /// Append an event to the project's log and deliver it.
    ///
    /// Waits up to the send timeout for a slow subscriber, then detaches it.
    /// The event stays buffered either way.
    pub async fn publish(&self, project_id: &ProjectId, run_id: &Id, payload: EventPayload) -> Event {
        self.publish_with(project_id, run_id, payload, |_| {}).await
    }

    /// Like `publish`, running `before_delivery` once the event has its
    /// sequence number but before any later event for the project can be
    /// sequenced or delivered.
    pub async fn publish_with(
        &self,
        project_id: &ProjectId,
        run_id: &Id,
        payload: EventPayload,
        before_delivery: impl FnOnce(&Event) + Send,
    ) -> Event {
        let log = self.log(project_id);
        let mut log = log.lock().await;

        let event = Event {
            sequence: log.next_sequence,
            run_id: run_id.clone(),
            kind: payload.kind(),
            payload: payload.to_value(),
            timestamp: Utc::now(),
        };
        log.next_sequence += 1;
        log.push(event.clone(), self.depth);
        before_delivery(&event);

        if let Some(sender) = log.subscriber.as_ref() {
            match sender.send_timeout(event.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(
                        project_id = %project_id,
                        sequence = event.sequence,
                        "subscriber stalled, detaching"
                    );
                    log.subscriber = None;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(project_id = %project_id, "subscriber gone");
                    log.subscriber = None;
                }
            }
        }

        event
    }

    /// Attach a subscriber, replacing any previous one.
    ///
    /// The subscription first yields buffered events with
    /// `sequence >= from_sequence`, then live events.
    pub async fn attach(&self, project_id: &ProjectId, from_sequence: u64) -> Subscription {
        let log = self.log(project_id);
        let mut log = log.lock().await;

        let replay: VecDeque<Event> = log
            .buffer
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(self.depth);
        if log.subscriber.replace(tx).is_some() {
            debug!(project_id = %project_id, "replacing previous subscriber");
        }

        Subscription { replay, rx }
    }

    /// Sequence number the next event for this project will get.
    pub async fn next_sequence(&self, project_id: &ProjectId) -> u64 {
        self.log(project_id).lock().await.next_sequence
    }

    /// Where a new observer starts by default: the latest run's run-started
    /// event, or the next sequence when the project has not run yet.
    pub async fn current_run_start(&self, project_id: &ProjectId) -> u64 {
        let log = self.log(project_id);
        let log = log.lock().await;
        log.run_start.unwrap_or(log.next_sequence)
    }

    /// Buffered events for a project, oldest first.
    pub async fn buffered(&self, project_id: &ProjectId) -> Vec<Event> {
        self.log(project_id).lock().await.buffer.iter().cloned().collect()
    }
}

/// A subscriber's view of a project's events.
#[derive(Debug)]
pub struct Subscription {
    replay: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once this subscriber has been replaced or detached.
    pub async fn next(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

/// Publishing handle scoped to one run, handed to stage executors.
#[derive(Debug, Clone)]
pub struct RunEvents {
    publisher: Arc<EventPublisher>,
    project_id: ProjectId,
    run_id: Id,
}

impl RunEvents {
    pub fn new(publisher: Arc<EventPublisher>, project_id: ProjectId, run_id: Id) -> Self {
        Self {
            publisher,
            project_id,
            run_id,
        }
    }

    pub async fn emit(&self, payload: EventPayload) -> Event {
        self.publisher
            .publish(&self.project_id, &self.run_id, payload)
            .await
    }

    /// Emit with a hook that runs before delivery. See `publish_with`.
    pub async fn emit_with(
        &self,
        payload: EventPayload,
        before_delivery: impl FnOnce(&Event) + Send,
    ) -> Event {
        self.publisher
            .publish_with(&self.project_id, &self.run_id, payload, before_delivery)
            .await
    }
}
