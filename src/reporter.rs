use tokio::sync::broadcast;

use crate::agent::{ProgressStep, StepType};
use crate::dispatcher::{Dispatcher, QueueItem};
use crate::error::{Error, Result};
use crate::events::QueueEvent;
use crate::jobs::JobRunner;

/// Receives queue activity for display.
pub trait QueueReporter: Send + Sync {
    fn progress(&self, queue: &str, entity_number: u64, step: &ProgressStep);
    fn completed(&self, queue: &str, entity_number: u64);
    fn failed(&self, queue: &str, entity_number: u64, error: &str);
}

/// Default reporter that prints to stderr.
pub struct StderrReporter;

impl QueueReporter for StderrReporter {
    fn progress(&self, queue: &str, entity_number: u64, step: &ProgressStep) {
        let marker = match step.step_type {
            StepType::Init => "*",
            StepType::Reading | StepType::Searching => ">",
            StepType::ToolUse | StepType::Processing => "-",
            StepType::Analyzing => "~",
        };
        eprintln!("[revq] {queue} #{entity_number} {marker} {}", step.message);
    }

    fn completed(&self, queue: &str, entity_number: u64) {
        eprintln!("[revq] {queue} #{entity_number} complete");
    }

    fn failed(&self, queue: &str, entity_number: u64, error: &str) {
        eprintln!("[revq] {queue} #{entity_number} failed: {error}");
    }
}

/// Relay events to `reporter` until every listed entity has reached a
/// terminal status, then return their queue items in the order given.
///
/// Subscribe before enqueueing, or early events are missed. Events already
/// buffered when the entities settle are still relayed before returning.
pub async fn follow<J: JobRunner, P: QueueReporter>(
    dispatcher: &Dispatcher<J>,
    events: &mut broadcast::Receiver<QueueEvent<J::Output>>,
    entity_numbers: &[u64],
    reporter: &P,
) -> Result<Vec<QueueItem<J::Output>>> {
    let queue = dispatcher.kind();
    let mut snapshot = dispatcher.snapshot().await?;

    loop {
        if let Some(settled) = settled(&snapshot, entity_numbers) {
            relay_buffered(queue, events, reporter);
            return Ok(settled);
        }

        match events.recv().await {
            Ok(event) => {
                if let Some(items) = relay(queue, event, reporter) {
                    snapshot = items;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => snapshot = dispatcher.snapshot().await?,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Dispatcher(format!("{queue} event bus closed")));
            }
        }
    }
}

/// Hand one event to the reporter. Queue updates are returned instead.
fn relay<R, P: QueueReporter>(queue: &str, event: QueueEvent<R>, reporter: &P) -> Option<Vec<QueueItem<R>>> {
    match event {
        QueueEvent::Progress { entity_number, step } => reporter.progress(queue, entity_number, &step),
        QueueEvent::Complete { entity_number, .. } => reporter.completed(queue, entity_number),
        QueueEvent::Error { entity_number, error } => reporter.failed(queue, entity_number, &error),
        QueueEvent::QueueUpdate { queue: items } => return Some(items),
    }
    None
}

fn relay_buffered<R: Clone, P: QueueReporter>(
    queue: &str,
    events: &mut broadcast::Receiver<QueueEvent<R>>,
    reporter: &P,
) {
    loop {
        match events.try_recv() {
            Ok(event) => {
                relay(queue, event, reporter);
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

fn settled<R: Clone>(snapshot: &[QueueItem<R>], entity_numbers: &[u64]) -> Option<Vec<QueueItem<R>>> {
    entity_numbers
        .iter()
        .map(|n| {
            snapshot
                .iter()
                .find(|item| item.entity_number == *n && item.status.is_terminal())
                .cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::dispatcher::QueueStatus;
    use crate::jobs::{JobContext, StepSink};

    struct EchoJob;

    impl JobRunner for EchoJob {
        type Output = u64;

        fn kind(&self) -> &'static str {
            "echo"
        }

        async fn run(&self, ctx: JobContext, mut on_step: StepSink) -> Result<u64> {
            on_step(ProgressStep::new("text", StepType::Analyzing, format!("echo {}", ctx.entity_number)));
            if ctx.entity_number % 2 == 1 {
                return Err(Error::Agent(format!("odd number {}", ctx.entity_number)));
            }
            Ok(ctx.entity_number * 10)
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl QueueReporter for Recording {
        fn progress(&self, queue: &str, entity_number: u64, step: &ProgressStep) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{queue} {entity_number} {}", step.message));
        }

        fn completed(&self, queue: &str, entity_number: u64) {
            self.0.lock().unwrap().push(format!("{queue} {entity_number} done"));
        }

        fn failed(&self, queue: &str, entity_number: u64, error: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{queue} {entity_number} failed {error}"));
        }
    }

    #[tokio::test]
    async fn test_follow_relays_until_settled() {
        let dispatcher = Dispatcher::spawn(EchoJob);
        let mut events = dispatcher.subscribe();
        dispatcher.enqueue(2, ".").await.unwrap();
        dispatcher.enqueue(3, ".").await.unwrap();

        let reporter = Recording::default();
        let items = follow(&dispatcher, &mut events, &[3, 2], &reporter).await.unwrap();

        assert_eq!(items[0].entity_number, 3);
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert!(items[0].error.as_deref().unwrap().contains("odd number 3"));
        assert_eq!(items[1].result, Some(20));

        let lines = reporter.0.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                "echo 2 echo 2",
                "echo 2 done",
                "echo 3 echo 3",
                "echo 3 failed agent error: odd number 3",
            ]
        );
    }

    async fn wait_settled(dispatcher: &Dispatcher<EchoJob>, entity_number: u64) {
        for _ in 0..500 {
            let items = dispatcher.snapshot().await.unwrap();
            if items
                .iter()
                .any(|i| i.entity_number == entity_number && i.status.is_terminal())
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("#{entity_number} never settled");
    }

    #[tokio::test]
    async fn test_follow_reports_failure_that_finished_before_following() {
        let dispatcher = Dispatcher::spawn(EchoJob);
        let mut events = dispatcher.subscribe();
        dispatcher.enqueue(9, ".").await.unwrap();
        wait_settled(&dispatcher, 9).await;

        let reporter = Recording::default();
        let items = follow(&dispatcher, &mut events, &[9], &reporter).await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(
            reporter.0.lock().unwrap().clone(),
            vec!["echo 9 echo 9", "echo 9 failed agent error: odd number 9"]
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_follow_returns_immediately_when_already_settled() {
        let dispatcher = Dispatcher::spawn(EchoJob);
        let mut events = dispatcher.subscribe();
        dispatcher.enqueue(4, ".").await.unwrap();
        follow(&dispatcher, &mut events, &[4], &Recording::default())
            .await
            .unwrap();

        let reporter = Recording::default();
        let mut late = dispatcher.subscribe();
        let items = follow(&dispatcher, &mut late, &[4], &reporter).await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Completed);
        assert!(reporter.0.lock().unwrap().is_empty());
    }
}
