use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::review_schema::AgentUsage;

const STREAM_CAPACITY: usize = 64;
const STEP_MESSAGE_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Init,
    Analyzing,
    Reading,
    Searching,
    ToolUse,
    Processing,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Init => "init",
            StepType::Analyzing => "analyzing",
            StepType::Reading => "reading",
            StepType::Searching => "searching",
            StepType::ToolUse => "tool-use",
            StepType::Processing => "processing",
        };
        write!(f, "{s}")
    }
}

/// One unit of progress reported while the agent works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    /// The raw event kind the step was derived from, e.g. `tool_use`.
    pub step_kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ProgressStep {
    pub fn new(step_kind: &str, step_type: StepType, message: impl Into<String>) -> Self {
        Self {
            step_kind: step_kind.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            step_type,
            tool_name: None,
        }
    }

    pub fn with_tool(mut self, tool_name: &str) -> Self {
        self.tool_name = Some(tool_name.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub output_schema: Value,
    pub working_dir: PathBuf,
}

/// The agent's final answer: raw structured text plus run metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub text: String,
    pub usage: AgentUsage,
}

/// Messages on an [`AgentStream`]. Exactly one of `Done`/`Failed` is sent, last.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    Step(ProgressStep),
    Done(AgentOutput),
    Failed(String),
}

pub type AgentStream = mpsc::Receiver<AgentMessage>;

/// Create a bounded stream for an agent implementation to push into.
pub fn agent_channel() -> (mpsc::Sender<AgentMessage>, AgentStream) {
    mpsc::channel(STREAM_CAPACITY)
}

/// Sending half of a cancellation flag.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Receiving half of a cancellation flag, handed to the agent.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The opaque AI capability: takes a prompt and output schema and streams
/// progress steps followed by one terminal message.
pub trait AgentCapability: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    fn invoke(&self, request: AgentRequest, cancel: CancelSignal) -> AgentStream;
}

/// Whether an error message describes a user-initiated stop.
pub fn is_cancellation(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("cancel") || lower.contains("abort")
}

/// Read an agent stream to its terminal message, handing each step to
/// `on_step` in arrival order.
pub async fn drive(mut stream: AgentStream, mut on_step: impl FnMut(ProgressStep)) -> Result<AgentOutput> {
    while let Some(message) = stream.recv().await {
        match message {
            AgentMessage::Step(step) => on_step(step),
            AgentMessage::Done(output) => return Ok(output),
            AgentMessage::Failed(error) => return Err(Error::Agent(error)),
        }
    }
    Err(Error::Agent("agent produced no result".to_string()))
}

/// Claude CLI runner speaking the `stream-json` output format.
pub struct ClaudeAgent {
    agent_binary: String,
    model: Option<String>,
    max_turns: Option<u32>,
}

impl ClaudeAgent {
    pub fn new(agent_binary: String, model: Option<String>, max_turns: Option<u32>) -> Self {
        Self {
            agent_binary,
            model,
            max_turns,
        }
    }

    /// Build the command and arguments for a prompt.
    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.agent_binary.clone(), args)
    }

    fn compose_prompt(request: &AgentRequest) -> String {
        let schema = serde_json::to_string_pretty(&request.output_schema)
            .unwrap_or_else(|_| request.output_schema.to_string());
        format!(
            "{}\n\nRespond with a single JSON object matching this schema and nothing else:\n```json\n{schema}\n```\n",
            request.prompt.trim_end()
        )
    }
}

impl AgentCapability for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> bool {
        binary_on_path(&self.agent_binary)
    }

    fn invoke(&self, request: AgentRequest, cancel: CancelSignal) -> AgentStream {
        let (tx, rx) = agent_channel();
        let (command, args) = self.build_command(&Self::compose_prompt(&request));

        tokio::spawn(async move {
            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
            let mut config = ProcessConfig::new(command, args, request.working_dir);
            config.log_prefix = "agent".to_string();
            config.stdout_sink = Some(line_tx);
            config.cancel = Some(cancel);

            let mut parser = StreamParser::default();
            let process = spawn_and_stream(config);
            tokio::pin!(process);

            let outcome = loop {
                tokio::select! {
                    biased;
                    Some(line) = line_rx.recv() => {
                        for step in parser.parse_line(&line) {
                            let _ = tx.send(AgentMessage::Step(step)).await;
                        }
                    }
                    outcome = &mut process => break outcome,
                }
            };
            while let Ok(line) = line_rx.try_recv() {
                for step in parser.parse_line(&line) {
                    let _ = tx.send(AgentMessage::Step(step)).await;
                }
            }

            let terminal = match outcome {
                Ok(output) if output.success() => parser.finish(),
                Ok(output) => {
                    let tail = output.stderr_tail();
                    let mut message = format!("agent exited with code {}", output.exit_code);
                    if !tail.trim().is_empty() {
                        message.push_str(&format!("\n{tail}"));
                    }
                    AgentMessage::Failed(message)
                }
                Err(e) => AgentMessage::Failed(e.to_string()),
            };
            if tx.send(terminal).await.is_err() {
                debug!("agent stream receiver dropped before completion");
            }
        });

        rx
    }
}

pub(crate) fn binary_on_path(binary: &str) -> bool {
    if binary.contains(std::path::MAIN_SEPARATOR) || binary.contains('/') {
        return Path::new(binary).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct FinalResult {
    text: String,
    is_error: bool,
    usage: AgentUsage,
}

/// Turns Claude `stream-json` lines into progress steps and remembers the
/// final `result` event.
#[derive(Debug, Default)]
pub struct StreamParser {
    result: Option<FinalResult>,
}

impl StreamParser {
    pub fn parse_line(&mut self, line: &str) -> Vec<ProgressStep> {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            return vec![];
        };
        match event.get("type").and_then(Value::as_str) {
            Some("system") if event.get("subtype").and_then(Value::as_str) == Some("init") => {
                let model = event.get("model").and_then(Value::as_str).unwrap_or("agent");
                vec![ProgressStep::new("init", StepType::Init, format!("Started {model} session"))]
            }
            Some("assistant") => content_items(&event)
                .filter_map(assistant_step)
                .collect(),
            Some("user") => content_items(&event)
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_result"))
                .map(|_| ProgressStep::new("tool_result", StepType::Processing, "Processing tool output"))
                .collect(),
            Some("result") => {
                self.result = Some(parse_result_event(&event));
                vec![]
            }
            _ => vec![],
        }
    }

    /// The terminal message once the process has exited cleanly.
    pub fn finish(self) -> AgentMessage {
        match self.result {
            Some(result) if result.is_error => {
                AgentMessage::Failed(format!("agent reported an error: {}", result.text))
            }
            Some(result) => AgentMessage::Done(AgentOutput {
                text: result.text,
                usage: result.usage,
            }),
            None => {
                warn!("agent exited without a result event");
                AgentMessage::Failed("agent exited without producing a result".to_string())
            }
        }
    }
}

fn content_items(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn assistant_step(item: &Value) -> Option<ProgressStep> {
    match item.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = item.get("text").and_then(Value::as_str)?.trim();
            if text.is_empty() {
                return None;
            }
            Some(ProgressStep::new("text", StepType::Analyzing, truncate(text, STEP_MESSAGE_MAX)))
        }
        "thinking" => Some(ProgressStep::new("thinking", StepType::Analyzing, "Thinking")),
        "tool_use" => {
            let name = item.get("name").and_then(Value::as_str).unwrap_or("tool");
            let input = item.get("input");
            let arg = |key: &str| {
                input
                    .and_then(|i| i.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let (step_type, message) = match name {
                "Read" => (StepType::Reading, format!("Reading {}", arg("file_path"))),
                "Grep" => (StepType::Searching, format!("Searching for {}", arg("pattern"))),
                "Glob" => (
                    StepType::Searching,
                    format!("Finding files matching {}", arg("pattern")),
                ),
                other => (StepType::ToolUse, format!("Using {other}")),
            };
            Some(ProgressStep::new("tool_use", step_type, message.trim_end().to_string()).with_tool(name))
        }
        _ => None,
    }
}

fn parse_result_event(event: &Value) -> FinalResult {
    let text = match event.get("structured_output") {
        Some(structured) if !structured.is_null() => structured.to_string(),
        _ => event
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };
    FinalResult {
        text,
        is_error: event.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        usage: AgentUsage {
            duration_ms: event.get("duration_ms").and_then(Value::as_u64),
            cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
            num_turns: event
                .get("num_turns")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
        },
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
