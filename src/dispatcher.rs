use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::agent::{CancelHandle, ProgressStep, cancel_pair, is_cancellation};
use crate::error::{Error, Result};
use crate::events::{EventBus, QueueEvent};
use crate::jobs::{JobContext, JobRunner, PriorReview, StepSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// Queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem<R> {
    pub entity_number: u64,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<R> QueueItem<R> {
    fn queued(entity_number: u64) -> Self {
        Self {
            entity_number,
            status: QueueStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub entity_number: u64,
    pub project_path: PathBuf,
    pub prior: PriorReview,
}

impl EnqueueRequest {
    pub fn new(entity_number: u64, project_path: impl Into<PathBuf>) -> Self {
        Self {
            entity_number,
            project_path: project_path.into(),
            prior: PriorReview::None,
        }
    }

    pub fn with_prior(mut self, prior: PriorReview) -> Self {
        self.prior = prior;
        self
    }
}

enum Command<R> {
    Enqueue {
        request: EnqueueRequest,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        entity_number: u64,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<QueueItem<R>>>,
    },
}

/// Handle to one queue. Cloning shares the same queue.
///
/// All queue state lives in a single actor task; this handle only sends it
/// commands. At most one job runs at a time and queued jobs start in FIFO
/// order.
pub struct Dispatcher<J: JobRunner> {
    commands: mpsc::UnboundedSender<Command<J::Output>>,
    events: EventBus<QueueEvent<J::Output>>,
    kind: &'static str,
}

impl<J: JobRunner> Clone for Dispatcher<J> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
            kind: self.kind,
        }
    }
}

impl<J: JobRunner> Dispatcher<J> {
    pub fn spawn(job: J) -> Self {
        Self::spawn_with_bus(job, EventBus::default())
    }

    pub fn spawn_with_bus(job: J, events: EventBus<QueueEvent<J::Output>>) -> Self {
        let kind = job.kind();
        let (commands, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let actor = QueueActor {
            job: Arc::new(job),
            items: Vec::new(),
            requests: HashMap::new(),
            running: None,
            events: events.clone(),
            done_tx,
        };
        tokio::spawn(actor.run(rx, done_rx));
        Self {
            commands,
            events,
            kind,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<J::Output>> {
        self.events.subscribe()
    }

    /// Queue an entity with no re-review context. Returns false when it was
    /// already queued or running.
    pub async fn enqueue(&self, entity_number: u64, project_path: impl Into<PathBuf>) -> Result<bool> {
        self.enqueue_request(EnqueueRequest::new(entity_number, project_path))
            .await
    }

    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue { request, reply })?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Cancel a queued or running entity. Returns false for unknown or
    /// finished entities.
    pub async fn cancel(&self, entity_number: u64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { entity_number, reply })?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Current queue contents in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<QueueItem<J::Output>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| self.stopped())
    }

    fn send(&self, command: Command<J::Output>) -> Result<()> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::Dispatcher(format!("{} queue has stopped", self.kind))
    }
}

struct RunningJob {
    entity_number: u64,
    cancel: CancelHandle,
}

type JobOutcome<R> = (u64, Result<R>);

struct QueueActor<J: JobRunner> {
    job: Arc<J>,
    items: Vec<QueueItem<J::Output>>,
    requests: HashMap<u64, EnqueueRequest>,
    running: Option<RunningJob>,
    events: EventBus<QueueEvent<J::Output>>,
    done_tx: mpsc::UnboundedSender<JobOutcome<J::Output>>,
}

impl<J: JobRunner> QueueActor<J> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<J::Output>>,
        mut done: mpsc::UnboundedReceiver<JobOutcome<J::Output>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((entity_number, outcome)) = done.recv() => self.finish(entity_number, outcome),
            }
            self.drain();
        }

        if let Some(running) = self.running.take() {
            debug!(queue = self.job.kind(), entity = running.entity_number, "queue dropped, cancelling running job");
            running.cancel.cancel();
        }
    }

    fn handle(&mut self, command: Command<J::Output>) {
        match command {
            Command::Enqueue { request, reply } => {
                let _ = reply.send(self.enqueue(request));
            }
            Command::Cancel { entity_number, reply } => {
                let _ = reply.send(self.cancel(entity_number));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.items.clone());
            }
        }
    }

    fn position(&self, entity_number: u64) -> Option<usize> {
        self.items.iter().position(|i| i.entity_number == entity_number)
    }

    fn enqueue(&mut self, request: EnqueueRequest) -> bool {
        let entity_number = request.entity_number;
        if let Some(idx) = self.position(entity_number) {
            if self.items[idx].status.is_active() {
                debug!(queue = self.job.kind(), entity = entity_number, "already queued");
                return false;
            }
            // A finished entry is replaced so the entity runs again at the back.
            self.items.remove(idx);
        }

        info!(queue = self.job.kind(), entity = entity_number, "queued");
        self.items.push(QueueItem::queued(entity_number));
        self.requests.insert(entity_number, request);
        self.publish_snapshot();
        true
    }

    fn cancel(&mut self, entity_number: u64) -> bool {
        let Some(idx) = self.position(entity_number) else {
            return false;
        };
        match self.items[idx].status {
            QueueStatus::Queued => {
                let item = &mut self.items[idx];
                item.status = QueueStatus::Cancelled;
                item.completed_at = Some(Utc::now());
                item.error = Some(format!("{} cancelled before it started", self.job.kind()));
                self.requests.remove(&entity_number);
                info!(queue = self.job.kind(), entity = entity_number, "cancelled while queued");
                self.events.publish(QueueEvent::Error {
                    entity_number,
                    error: format!("{} cancelled before it started", self.job.kind()),
                });
                self.publish_snapshot();
                true
            }
            QueueStatus::Running => {
                if let Some(running) = self.running.as_ref().filter(|r| r.entity_number == entity_number) {
                    info!(queue = self.job.kind(), entity = entity_number, "cancelling running job");
                    running.cancel.cancel();
                }
                self.publish_snapshot();
                true
            }
            _ => false,
        }
    }

    /// Start the oldest queued item if nothing is running.
    fn drain(&mut self) {
        if self.running.is_some() {
            return;
        }
        let Some(idx) = self.items.iter().position(|i| i.status == QueueStatus::Queued) else {
            return;
        };

        let entity_number = self.items[idx].entity_number;
        let Some(request) = self.requests.remove(&entity_number) else {
            warn!(queue = self.job.kind(), entity = entity_number, "queued item lost its request");
            self.items[idx].status = QueueStatus::Failed;
            self.items[idx].error = Some("missing enqueue request".to_string());
            return;
        };

        self.items[idx].status = QueueStatus::Running;
        self.items[idx].started_at = Some(Utc::now());

        let (handle, signal) = cancel_pair();
        self.running = Some(RunningJob {
            entity_number,
            cancel: handle,
        });
        info!(
            queue = self.job.kind(),
            entity = entity_number,
            project = %request.project_path.display(),
            "started"
        );
        self.publish_snapshot();

        let ctx = JobContext {
            entity_number,
            project_path: request.project_path,
            prior: request.prior,
            cancel: signal,
        };
        let sink = progress_sink(self.job.kind(), entity_number, self.events.clone());
        let job = Arc::clone(&self.job);
        let done = self.done_tx.clone();

        tokio::spawn(async move {
            let task = tokio::spawn(async move { job.run(ctx, sink).await });
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Dispatcher(format!("job task failed: {e}"))),
            };
            let _ = done.send((entity_number, outcome));
        });
    }

    fn finish(&mut self, entity_number: u64, outcome: Result<J::Output>) {
        let cancel_requested = self
            .running
            .take()
            .filter(|r| r.entity_number == entity_number)
            .is_some_and(|r| r.cancel.is_cancelled());

        let Some(idx) = self.position(entity_number) else {
            warn!(queue = self.job.kind(), entity = entity_number, "finished job has no queue entry");
            return;
        };
        let kind = self.job.kind();
        let item = &mut self.items[idx];
        item.completed_at = Some(Utc::now());

        let event = match outcome {
            Ok(result) => {
                info!(queue = kind, entity = entity_number, "completed");
                item.status = QueueStatus::Completed;
                item.result = Some(result.clone());
                QueueEvent::Complete { entity_number, result }
            }
            Err(e) => {
                let message = e.to_string();
                if matches!(e, Error::Cancelled(_)) || is_cancellation(&message) {
                    info!(queue = kind, entity = entity_number, "cancelled");
                    item.status = QueueStatus::Cancelled;
                } else {
                    if cancel_requested {
                        debug!(queue = kind, entity = entity_number, "job failed after cancel was requested");
                    }
                    warn!(queue = kind, entity = entity_number, error = %message, "failed");
                    item.status = QueueStatus::Failed;
                }
                item.error = Some(message.clone());
                QueueEvent::Error {
                    entity_number,
                    error: message,
                }
            }
        };

        self.events.publish(event);
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.events.publish(QueueEvent::QueueUpdate {
            queue: self.items.clone(),
        });
    }
}

/// Relays steps to observers in order and mirrors them into the activity log.
fn progress_sink<R: Clone + Send + 'static>(
    kind: &'static str,
    entity_number: u64,
    events: EventBus<QueueEvent<R>>,
) -> StepSink {
    Box::new(move |step: ProgressStep| {
        debug!(
            queue = kind,
            entity = entity_number,
            step_type = %step.step_type,
            tool = step.tool_name.as_deref().unwrap_or(""),
            "{}",
            step.message
        );
        events.publish(QueueEvent::Progress { entity_number, step });
    })
}
