//! Task router — delivers dispatches to the instance bound to a session and
//! fans inbound status traffic back to the task's subscribers, in order.
//!
//! Sessions process tasks strictly serially: at most one task is in flight
//! per session, and per-session task sequence numbers are gapless as
//! observed by the requester. Every task's update history is retained for a
//! bounded window after it finishes so late subscribers can replay it.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use convoy_core::config::CoreConfig;
use convoy_core::errors::OrchestratorError;
use convoy_core::events::{SessionEvent, TaskEvent};
use convoy_core::ids::{InstanceId, SessionId, TaskId};
use convoy_core::protocol::{CommandMessage, CommandPayload, StatusPhase};
use convoy_store::sessions::SessionState;

use crate::channel::ChannelManager;
use crate::sessions::SessionManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A task routed through a session. Steps are opaque to the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    /// Per-session ordinal, strictly increasing and gapless.
    pub seq: u64,
    pub status: TaskStatus,
    pub steps: Vec<serde_json::Value>,
}

struct TaskRecord {
    task: Task,
    history: Vec<TaskEvent>,
    live: broadcast::Sender<TaskEvent>,
    cancel_requested: bool,
    /// Set once a terminal event lands; later reports are ignored.
    finished_at: Option<Instant>,
}

pub struct TaskRouter {
    tasks: DashMap<TaskId, Mutex<TaskRecord>>,
    /// The single in-flight task per session (the serial gate).
    in_progress: DashMap<SessionId, TaskId>,
    next_task_seq: DashMap<SessionId, u64>,
    sessions: Arc<SessionManager>,
    channels: Arc<ChannelManager>,
    events: broadcast::Sender<TaskEvent>,
    config: CoreConfig,
}

impl TaskRouter {
    pub fn new(
        sessions: Arc<SessionManager>,
        channels: Arc<ChannelManager>,
        events: broadcast::Sender<TaskEvent>,
        config: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            in_progress: DashMap::new(),
            next_task_seq: DashMap::new(),
            sessions,
            channels,
            events,
            config,
        })
    }

    /// Submit a task for a session. Fails with a state error if the session
    /// is not active or another task is already in flight; otherwise the
    /// task takes the session's next sequence number and a dispatch goes out
    /// on the bound instance's channel.
    pub async fn submit(
        &self,
        session_id: &SessionId,
        steps: Vec<serde_json::Value>,
    ) -> Result<Task, OrchestratorError> {
        if steps.is_empty() {
            return Err(OrchestratorError::Validation("task has no steps".into()));
        }

        self.sessions.touch(session_id)?;
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown session {session_id}")))?;
        if session.state != SessionState::Active {
            return Err(OrchestratorError::StateConflict(format!(
                "session {session_id} is {}",
                session.state
            )));
        }
        let instance_id = session.instance_id.ok_or_else(|| {
            OrchestratorError::StateConflict(format!("session {session_id} has no instance"))
        })?;
        let channel = self.channels.for_instance(&instance_id).ok_or_else(|| {
            OrchestratorError::InstanceFailed(format!("no channel for instance {instance_id}"))
        })?;

        let task_id = TaskId::new();
        match self.in_progress.entry(session_id.clone()) {
            Entry::Occupied(occupied) => {
                return Err(OrchestratorError::StateConflict(format!(
                    "task {} is already in progress for session {session_id}",
                    occupied.get()
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(task_id.clone());
            }
        }

        let seq = {
            let mut counter = self.next_task_seq.entry(session_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let (live, _) = broadcast::channel(256);
        let task = Task {
            id: task_id.clone(),
            session_id: session_id.clone(),
            seq,
            status: TaskStatus::Queued,
            steps: steps.clone(),
        };
        self.tasks.insert(
            task_id.clone(),
            Mutex::new(TaskRecord {
                task: task.clone(),
                history: Vec::new(),
                live,
                cancel_requested: false,
                finished_at: None,
            }),
        );

        let dispatch = CommandPayload::Dispatch {
            task_id: task_id.clone(),
            session_id: session_id.clone(),
            steps,
        };
        match channel.send(dispatch).await {
            Ok(_) => {
                info!(session_id = %session_id, task_id = %task_id, seq, "task dispatched");
                self.push_event(
                    &task_id,
                    TaskEvent::Dispatched {
                        session_id: session_id.clone(),
                        task_id: task_id.clone(),
                        task_seq: seq,
                    },
                    Some(TaskStatus::Dispatched),
                );
                Ok(self.task(&task_id).unwrap_or(task))
            }
            Err(e) => {
                // Roll back so the requester never observes this sequence
                // number (the gate is still held, nothing raced the counter).
                self.tasks.remove(&task_id);
                self.in_progress.remove(session_id);
                if let Some(mut counter) = self.next_task_seq.get_mut(session_id) {
                    *counter -= 1;
                }
                Err(e)
            }
        }
    }

    /// Request cooperative cancellation. The task is marked cancelled
    /// optimistically; the authoritative terminal state is whatever status
    /// the instance reports, resolved by sequence order.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        let session_id = {
            let record = self
                .tasks
                .get(task_id)
                .ok_or_else(|| OrchestratorError::Validation(format!("unknown task {task_id}")))?;
            let mut rec = record.lock();
            if rec.finished_at.is_some() {
                return Err(OrchestratorError::StateConflict(format!(
                    "task {task_id} already finished"
                )));
            }
            if rec.cancel_requested {
                return Ok(());
            }
            rec.cancel_requested = true;
            rec.task.status = TaskStatus::Cancelled;
            rec.task.session_id.clone()
        };

        let channel = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.instance_id)
            .and_then(|instance_id| self.channels.for_instance(&instance_id));

        if let Some(channel) = channel {
            channel.send(CommandPayload::Cancel { task_id: task_id.clone() }).await?;
            info!(task_id = %task_id, "cancel requested");
        } else {
            debug!(task_id = %task_id, "no channel for cancel; session teardown will settle it");
        }
        Ok(())
    }

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|record| record.lock().task.clone())
    }

    /// Subscribe to a task's updates: the full ordered history so far, then
    /// live events, ending at the terminal event.
    pub fn subscribe(&self, task_id: &TaskId) -> Result<UpdateStream, OrchestratorError> {
        let record = self
            .tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown task {task_id}")))?;
        let rec = record.lock();

        let history: VecDeque<TaskEvent> = rec.history.iter().cloned().collect();
        let live = if rec.finished_at.is_some() {
            None
        } else {
            Some(BroadcastStream::new(rec.live.subscribe()))
        };
        Ok(UpdateStream { history, live, done: false })
    }

    /// Route one in-order message delivered off an instance's channel.
    fn handle_instance_message(&self, instance_id: &InstanceId, msg: CommandMessage) {
        match msg.payload {
            CommandPayload::StepResult { task_id, step_index, output } => {
                let session_id = match self.session_for(&task_id) {
                    Some(session_id) => session_id,
                    None => return,
                };
                self.push_event(
                    &task_id,
                    TaskEvent::StepResult { session_id, task_id: task_id.clone(), step_index, output },
                    Some(TaskStatus::InProgress),
                );
            }
            CommandPayload::Status { task_id, phase, detail } => {
                let session_id = match self.session_for(&task_id) {
                    Some(session_id) => session_id,
                    None => return,
                };
                let (event, status) = match phase {
                    StatusPhase::Started => (
                        TaskEvent::Started { session_id, task_id: task_id.clone() },
                        TaskStatus::InProgress,
                    ),
                    StatusPhase::Progress => (
                        TaskEvent::Progress {
                            session_id,
                            task_id: task_id.clone(),
                            detail: detail.unwrap_or_default(),
                        },
                        TaskStatus::InProgress,
                    ),
                    StatusPhase::Completed => (
                        TaskEvent::Completed { session_id, task_id: task_id.clone() },
                        TaskStatus::Completed,
                    ),
                    StatusPhase::Cancelled => (
                        TaskEvent::Cancelled { session_id, task_id: task_id.clone() },
                        TaskStatus::Cancelled,
                    ),
                };
                self.push_event(&task_id, event, Some(status));
            }
            CommandPayload::Error { task_id, message } => {
                let session_id = match self.session_for(&task_id) {
                    Some(session_id) => session_id,
                    None => return,
                };
                self.push_event(
                    &task_id,
                    TaskEvent::Failed { session_id, task_id: task_id.clone(), reason: message },
                    Some(TaskStatus::Failed),
                );
            }
            CommandPayload::Close { ref reason } => {
                debug!(instance_id = %instance_id, reason = %reason, "instance closing channel");
            }
            ref other => {
                debug!(kind = other.kind(), "unexpected payload reached the router");
            }
        }
    }

    /// Fail the in-flight task of a terminated session so its subscriber
    /// stream ends instead of hanging.
    fn fail_in_progress(&self, session_id: &SessionId, reason: &str) {
        let task_id = match self.in_progress.get(session_id) {
            Some(task_id) => task_id.clone(),
            None => return,
        };
        self.push_event(
            &task_id,
            TaskEvent::Failed {
                session_id: session_id.clone(),
                task_id: task_id.clone(),
                reason: reason.to_string(),
            },
            Some(TaskStatus::Failed),
        );
    }

    /// Append an event to the task's history, publish it to subscribers, and
    /// settle bookkeeping for terminal events. Reports arriving after the
    /// terminal event (e.g. a completion racing an optimistic cancel) are
    /// dropped; the first terminal report wins by sequence order.
    fn push_event(&self, task_id: &TaskId, event: TaskEvent, status: Option<TaskStatus>) {
        let session_id = event.session_id().clone();
        let terminal = event.is_terminal();

        let published = {
            let record = match self.tasks.get(task_id) {
                Some(record) => record,
                None => return,
            };
            let mut rec = record.lock();
            if rec.finished_at.is_some() {
                return;
            }
            if let Some(status) = status {
                rec.task.status = status;
            }
            rec.history.push(event.clone());
            let _ = rec.live.send(event.clone());
            if terminal {
                rec.finished_at = Some(Instant::now());
            }
            true
        };

        if published {
            let _ = self.events.send(event);
        }

        if terminal {
            // Clear the serial gate only if it still points at this task.
            if let Some(current) = self.in_progress.get(&session_id).map(|t| t.clone()) {
                if &current == task_id {
                    self.in_progress.remove(&session_id);
                }
            }
        }
    }

    fn session_for(&self, task_id: &TaskId) -> Option<SessionId> {
        self.tasks.get(task_id).map(|record| record.lock().task.session_id.clone())
    }

    /// Drop finished tasks whose replay window has elapsed. Public so tests
    /// can drive it deterministically.
    pub fn prune_finished(&self, now: Instant) {
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry
                    .lock()
                    .finished_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.task_history_retention)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for task_id in expired {
            self.tasks.remove(&task_id);
            debug!(task_id = %task_id, "task history pruned");
        }
    }

    /// Consume in-order messages delivered off instance channels.
    pub fn spawn_fan_in(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(InstanceId, CommandMessage)>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((instance_id, msg)) = rx.recv().await {
                self.handle_instance_message(&instance_id, msg);
            }
        })
    }

    /// Fail in-flight tasks when their session terminates.
    pub fn spawn_session_listener(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<SessionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let router = self;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Terminated { session_id, reason }) => {
                        router.fail_in_progress(&session_id, &reason);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "session listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodically prune expired task histories.
    pub fn spawn_retention_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.idle_sweep_interval);
            loop {
                ticker.tick().await;
                self.prune_finished(Instant::now());
            }
        })
    }
}

pin_project_lite::pin_project! {
    /// Finite, ordered stream of a task's updates. Replays retained history
    /// first, then yields live events, and ends after the terminal event.
    pub struct UpdateStream {
        history: VecDeque<TaskEvent>,
        #[pin]
        live: Option<BroadcastStream<TaskEvent>>,
        done: bool,
    }
}

impl Stream for UpdateStream {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskEvent>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        if let Some(event) = this.history.pop_front() {
            if event.is_terminal() {
                *this.done = true;
            }
            return Poll::Ready(Some(event));
        }

        loop {
            return match this.live.as_mut().as_pin_mut() {
                None => {
                    *this.done = true;
                    Poll::Ready(None)
                }
                Some(stream) => match stream.poll_next(cx) {
                    Poll::Ready(Some(Ok(event))) => {
                        if event.is_terminal() {
                            *this.done = true;
                        }
                        Poll::Ready(Some(event))
                    }
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                        warn!(skipped = n, "update subscriber lagged");
                        continue;
                    }
                    Poll::Ready(None) => {
                        *this.done = true;
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                },
            };
        }
    }
}
