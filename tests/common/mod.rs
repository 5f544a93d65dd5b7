#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};

use revq::agent::{
    AgentCapability, AgentMessage, AgentOutput, AgentRequest, AgentStream, CancelSignal, ProgressStep,
    StepType, agent_channel,
};
use revq::error::{Error, Result};
use revq::events::QueueEvent;
use revq::forge::{Entity, EntityKind, Forge, RepoInfo};
use revq::review_schema::AgentUsage;

pub const REPOSITORY: &str = "acme/widgets";

pub const SAMPLE_DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,4 @@
 fn a() {}
+fn b() {}
 fn c() {}
 fn d() {}
";

/// In-memory forge with canned pull requests and issues.
pub struct MockForge {
    repository: String,
    entities: Mutex<HashMap<u64, Entity>>,
    diffs: Mutex<HashMap<u64, String>>,
    commit_diff: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self {
            repository: REPOSITORY.to_string(),
            entities: Mutex::new(HashMap::new()),
            diffs: Mutex::new(HashMap::new()),
            commit_diff: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pr(self, number: u64, diff: &str) -> Self {
        self.entities.lock().unwrap().insert(
            number,
            Entity {
                number,
                title: format!("PR {number}"),
                body: format!("Body of PR {number}"),
                url: format!("https://github.com/{REPOSITORY}/pull/{number}"),
                head_sha: Some(format!("sha-{number}-a")),
            },
        );
        self.diffs.lock().unwrap().insert(number, diff.to_string());
        self
    }

    pub fn with_issue(self, number: u64) -> Self {
        self.entities.lock().unwrap().insert(
            number,
            Entity {
                number,
                title: format!("Issue {number}"),
                body: "It crashes on an empty diff.".to_string(),
                url: format!("https://github.com/{REPOSITORY}/issues/{number}"),
                head_sha: None,
            },
        );
        self
    }

    pub fn set_head(&self, number: u64, sha: &str) {
        if let Some(entity) = self.entities.lock().unwrap().get_mut(&number) {
            entity.head_sha = Some(sha.to_string());
        }
    }

    pub fn set_commit_diff(&self, diff: &str) {
        *self.commit_diff.lock().unwrap() = Some(diff.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Forge for MockForge {
    async fn get_entity(&self, _repo: &Path, kind: EntityKind, number: u64) -> Result<Entity> {
        self.record(format!("get_entity {number}"));
        self.entities
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::Forge(format!("{kind} #{number} not found")))
    }

    async fn get_diff(&self, _repo: &Path, pr_number: u64) -> Result<String> {
        self.record(format!("get_diff {pr_number}"));
        self.diffs
            .lock()
            .unwrap()
            .get(&pr_number)
            .cloned()
            .ok_or_else(|| Error::Forge(format!("no diff for #{pr_number}")))
    }

    async fn get_repo_info(&self, _repo: &Path) -> Result<RepoInfo> {
        Ok(RepoInfo {
            full_name: self.repository.clone(),
            default_branch: Some("main".to_string()),
        })
    }

    async fn get_head_sha(&self, _repo: &Path, pr_number: u64) -> Result<String> {
        self.record(format!("get_head_sha {pr_number}"));
        Err(Error::Forge("head sha unavailable".to_string()))
    }

    async fn get_commit_diff(&self, _repo: &Path, from_sha: &str, to_sha: &str) -> Result<String> {
        self.record(format!("get_commit_diff {from_sha}..{to_sha}"));
        self.commit_diff
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Forge("commit not found".to_string()))
    }
}

/// How a scripted agent run ends.
pub enum Reply {
    Done(String),
    Fail(String),
    /// Finish with the text once the gate is opened, or fail if cancelled first.
    Gated(Arc<Notify>, String),
    /// Run until cancelled.
    UntilCancelled,
}

pub struct AgentScript {
    pub steps: Vec<String>,
    pub reply: Reply,
}

impl AgentScript {
    pub fn done(text: &str) -> Self {
        Self {
            steps: vec!["Reading the diff".to_string()],
            reply: Reply::Done(text.to_string()),
        }
    }

    pub fn with_steps(mut self, steps: &[&str]) -> Self {
        self.steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Agent that replays one script per invocation, in order.
pub struct ScriptedAgent {
    available: bool,
    scripts: Mutex<VecDeque<AgentScript>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(scripts: Vec<AgentScript>) -> Self {
        Self {
            available: true,
            scripts: Mutex::new(scripts.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(vec![])
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl AgentCapability for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn invoke(&self, request: AgentRequest, mut cancel: CancelSignal) -> AgentStream {
        self.prompts.lock().unwrap().push(request.prompt);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| AgentScript::done(&review_json(7.0, &[])));

        let (tx, rx) = agent_channel();
        tokio::spawn(async move {
            for message in script.steps {
                let step = ProgressStep::new("text", StepType::Analyzing, message);
                if tx.send(AgentMessage::Step(step)).await.is_err() {
                    return;
                }
            }
            let done = |text: String| {
                AgentMessage::Done(AgentOutput {
                    text,
                    usage: AgentUsage {
                        duration_ms: Some(1500),
                        cost_usd: Some(0.12),
                        num_turns: Some(4),
                    },
                })
            };
            let cancelled = || AgentMessage::Failed("agent run cancelled".to_string());
            let terminal = match script.reply {
                Reply::Done(text) => done(text),
                Reply::Fail(error) => AgentMessage::Failed(error),
                Reply::Gated(gate, text) => tokio::select! {
                    _ = gate.notified() => done(text),
                    _ = cancel.cancelled() => cancelled(),
                },
                Reply::UntilCancelled => {
                    cancel.cancelled().await;
                    cancelled()
                }
            };
            let _ = tx.send(terminal).await;
        });
        rx
    }
}

/// A minimal review result as the agent would print it.
pub fn review_json(score: f64, findings: &[(&str, &str, u32)]) -> String {
    let findings: Vec<serde_json::Value> = findings
        .iter()
        .map(|(severity, file, line)| {
            serde_json::json!({
                "severity": severity,
                "category": "logic",
                "file": file,
                "line": line,
                "title": format!("{severity} issue at {file}:{line}"),
                "explanation": "Something is off here.",
            })
        })
        .collect();
    serde_json::json!({
        "summary": "Reviewed the change.",
        "score": score,
        "findings": findings,
    })
    .to_string()
}

/// Wait for the next event matching `pred`, failing the test after 10 seconds.
pub async fn wait_for<R: Clone>(
    events: &mut broadcast::Receiver<QueueEvent<R>>,
    mut pred: impl FnMut(&QueueEvent<R>) -> bool,
) -> QueueEvent<R> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait for the complete or error event of one entity.
pub async fn wait_terminal<R: Clone>(
    events: &mut broadcast::Receiver<QueueEvent<R>>,
    entity: u64,
) -> QueueEvent<R> {
    wait_for(events, |e| {
        matches!(e, QueueEvent::Complete { entity_number, .. } | QueueEvent::Error { entity_number, .. } if *entity_number == entity)
    })
    .await
}

/// Wait until a queue-update shows the entity running.
pub async fn wait_running<R: Clone>(events: &mut broadcast::Receiver<QueueEvent<R>>, entity: u64) {
    wait_for(events, |e| match e {
        QueueEvent::QueueUpdate { queue } => queue
            .iter()
            .any(|i| i.entity_number == entity && i.status == revq::dispatcher::QueueStatus::Running),
        _ => false,
    })
    .await;
}

/// Drain whatever events are already buffered.
pub fn drain<R: Clone>(events: &mut broadcast::Receiver<QueueEvent<R>>) -> Vec<QueueEvent<R>> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
