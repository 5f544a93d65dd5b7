use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::binary_on_path;
use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::store::KvStore;

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(60);
pub const STATUS_KEY: &str = "tool-status";

/// Install and auth state of the agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub tool: String,
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub authenticated: bool,
    pub checked_at: DateTime<Utc>,
}

pub trait StatusProbe: Send + Sync + 'static {
    /// The tool this probe reports on; stored statuses for other tools are ignored.
    fn tool(&self) -> &str;

    fn probe(&self) -> impl Future<Output = Result<ToolStatus>> + Send;
}

/// Probes by running `<binary> --version` and `gh auth status`.
pub struct CliStatusProbe {
    binary: String,
    timeout: Duration,
    working_dir: PathBuf,
}

impl CliStatusProbe {
    pub fn new(binary: impl Into<String>, timeout: Duration, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            working_dir: working_dir.into(),
        }
    }

    async fn run(&self, command: &str, args: &[&str]) -> Result<crate::process::ProcessOutput> {
        let mut config = ProcessConfig::new(
            command,
            args.iter().map(|a| a.to_string()).collect(),
            &self.working_dir,
        );
        config.timeout = Some(self.timeout);
        config.log_prefix = format!("probe:{command}");
        spawn_and_stream(config).await
    }
}

impl StatusProbe for CliStatusProbe {
    fn tool(&self) -> &str {
        &self.binary
    }

    async fn probe(&self) -> Result<ToolStatus> {
        let mut status = ToolStatus {
            tool: self.binary.clone(),
            installed: false,
            version: None,
            authenticated: false,
            checked_at: Utc::now(),
        };
        if !binary_on_path(&self.binary) {
            return Ok(status);
        }

        let version = self.run(&self.binary, &["--version"]).await?;
        status.installed = version.success();
        status.version = version
            .stdout_lines
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string);

        if binary_on_path("gh") {
            let auth = self.run("gh", &["auth", "status"]).await?;
            status.authenticated = auth.success();
        }
        Ok(status)
    }
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<ToolStatus, String>>>;

#[derive(Default)]
struct CacheState {
    in_flight: Option<(u64, SharedRefresh)>,
    generation: u64,
}

/// TTL cache in front of a [`StatusProbe`], persisted under [`STATUS_KEY`]
/// so separate runs share it. Concurrent callers during a refresh all await
/// the same probe run.
pub struct StatusCache<P> {
    probe: Arc<P>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl<P: StatusProbe> StatusCache<P> {
    pub fn new(probe: P, store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            probe: Arc::new(probe),
            store,
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub async fn get_status(&self) -> Result<ToolStatus> {
        let refresh = {
            let mut state = self.lock()?;
            if let Some(status) = self.fresh_cached() {
                return Ok(status);
            }
            match &state.in_flight {
                Some((_, refresh)) => {
                    debug!("joining in-flight status refresh");
                    refresh.clone()
                }
                None => {
                    state.generation += 1;
                    let refresh = self.start_refresh(state.generation);
                    state.in_flight = Some((state.generation, refresh.clone()));
                    refresh
                }
            }
        };
        refresh.await.map_err(Error::Status)
    }

    /// Drop the stored value so the next call probes again.
    pub fn clear_cache(&self) -> Result<()> {
        self.store.set(STATUS_KEY, Value::Null)
    }

    fn fresh_cached(&self) -> Option<ToolStatus> {
        let value = match self.store.get(STATUS_KEY) {
            Ok(Some(value)) if !value.is_null() => value,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read stored tool status");
                return None;
            }
        };
        let status = match serde_json::from_value::<ToolStatus>(value) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable stored tool status");
                return None;
            }
        };
        let age = Utc::now().signed_duration_since(status.checked_at).to_std().ok()?;
        (status.tool == self.probe.tool() && age < self.ttl).then_some(status)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| Error::Status("status cache lock poisoned".to_string()))
    }

    fn start_refresh(&self, generation: u64) -> SharedRefresh {
        let probe = Arc::clone(&self.probe);
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        async move {
            let _clear = ClearInFlight { state, generation };
            let outcome = probe.probe().await.map_err(|e| e.to_string());
            if let Ok(status) = &outcome {
                info!(
                    tool = status.tool,
                    installed = status.installed,
                    authenticated = status.authenticated,
                    "tool status refreshed"
                );
                let stored = serde_json::to_value(status)
                    .map_err(|e| Error::Status(format!("failed to serialize tool status: {e}")))
                    .and_then(|value| store.set(STATUS_KEY, value));
                if let Err(e) = stored {
                    warn!(error = %e, "failed to store tool status");
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

/// Clears the in-flight marker when the refresh settles, whatever the outcome.
struct ClearInFlight {
    state: Arc<Mutex<CacheState>>,
    generation: u64,
}

impl Drop for ClearInFlight {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock()
            && state.in_flight.as_ref().is_some_and(|(g, _)| *g == self.generation)
        {
            state.in_flight = None;
        }
    }
}
