use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::run_captured;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    PullRequest,
    Issue,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::PullRequest => write!(f, "pull request"),
            EntityKind::Issue => write!(f, "issue"),
        }
    }
}

/// A pull request or issue as fetched from the forge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
    /// Head commit, for pull requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    /// `owner/name`.
    pub full_name: String,
    pub default_branch: Option<String>,
}

/// Code-hosting operations the engine needs. All calls are scoped to a local
/// checkout of the repository.
pub trait Forge: Send + Sync + 'static {
    fn get_entity(
        &self,
        repo: &Path,
        kind: EntityKind,
        number: u64,
    ) -> impl Future<Output = Result<Entity>> + Send;

    fn get_diff(&self, repo: &Path, pr_number: u64) -> impl Future<Output = Result<String>> + Send;

    fn get_repo_info(&self, repo: &Path) -> impl Future<Output = Result<RepoInfo>> + Send;

    fn get_head_sha(&self, repo: &Path, pr_number: u64) -> impl Future<Output = Result<String>> + Send;

    /// Diff between two commits, for incremental re-reviews.
    fn get_commit_diff(
        &self,
        repo: &Path,
        from_sha: &str,
        to_sha: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Abstraction over running `gh`/`git` for testability.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        dir: &Path,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Runs commands as child processes with a fixed timeout.
pub struct CliRunner {
    timeout: Duration,
}

impl CliRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for CliRunner {
    async fn run(&self, program: &str, args: &[&str], dir: &Path) -> Result<String> {
        run_captured(program, args, dir, self.timeout).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhEntity {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    head_ref_oid: Option<String>,
}

impl From<GhEntity> for Entity {
    fn from(gh: GhEntity) -> Self {
        Self {
            number: gh.number,
            title: gh.title,
            body: gh.body.unwrap_or_default(),
            url: gh.url,
            head_sha: gh.head_ref_oid.filter(|sha| !sha.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRepo {
    name_with_owner: String,
    #[serde(default)]
    default_branch_ref: Option<GhBranchRef>,
}

#[derive(Debug, Deserialize)]
struct GhBranchRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhHead {
    head_ref_oid: String,
}

/// GitHub via the `gh` CLI, with retry and exponential backoff on `gh` calls.
pub struct GhForge<R = CliRunner> {
    runner: R,
    initial_backoff_ms: u64,
}

impl GhForge<CliRunner> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_runner(CliRunner::new(timeout))
    }
}

impl<R: CommandRunner> GhForge<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    async fn gh(&self, repo: &Path, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "gh");
        retry_with_backoff(
            || async {
                self.runner
                    .run("gh", args, repo)
                    .await
                    .map_err(|e| Error::Forge(format!("gh {}: {e}", args.first().copied().unwrap_or_default())))
            },
            self.initial_backoff_ms,
            MAX_RETRIES,
        )
        .await
    }

    async fn gh_json<T: serde::de::DeserializeOwned>(&self, repo: &Path, args: &[&str]) -> Result<T> {
        let raw = self.gh(repo, args).await?;
        serde_json::from_str(&raw).map_err(|e| Error::Forge(format!("failed to parse gh output: {e}")))
    }
}

impl<R: CommandRunner> Forge for GhForge<R> {
    async fn get_entity(&self, repo: &Path, kind: EntityKind, number: u64) -> Result<Entity> {
        let n = number.to_string();
        let args: [&str; 5] = match kind {
            EntityKind::PullRequest => ["pr", "view", &n, "--json", "number,title,body,url,headRefOid"],
            EntityKind::Issue => ["issue", "view", &n, "--json", "number,title,body,url"],
        };
        let entity: GhEntity = self.gh_json(repo, &args).await?;
        Ok(entity.into())
    }

    async fn get_diff(&self, repo: &Path, pr_number: u64) -> Result<String> {
        let n = pr_number.to_string();
        self.gh(repo, &["pr", "diff", &n]).await
    }

    async fn get_repo_info(&self, repo: &Path) -> Result<RepoInfo> {
        let info: GhRepo = self
            .gh_json(repo, &["repo", "view", "--json", "nameWithOwner,defaultBranchRef"])
            .await?;
        Ok(RepoInfo {
            full_name: info.name_with_owner,
            default_branch: info.default_branch_ref.map(|b| b.name),
        })
    }

    async fn get_head_sha(&self, repo: &Path, pr_number: u64) -> Result<String> {
        let n = pr_number.to_string();
        let head: GhHead = self
            .gh_json(repo, &["pr", "view", &n, "--json", "headRefOid"])
            .await?;
        Ok(head.head_ref_oid)
    }

    async fn get_commit_diff(&self, repo: &Path, from_sha: &str, to_sha: &str) -> Result<String> {
        let range = format!("{from_sha}..{to_sha}");
        self.runner
            .run("git", &["diff", &range], repo)
            .await
            .map_err(|e| Error::Forge(format!("git diff {range}: {e}")))
    }
}

async fn retry_with_backoff<F, Fut, T>(f: F, initial_backoff_ms: u64, max_retries: u32) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff_ms = initial_backoff_ms;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_retries => {
                warn!(attempt, error = %e, backoff_ms, "retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<Vec<Result<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str], _dir: &Path) -> Result<String> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(format!("{program} {}", args.join(" ")));
            }
            let mut responses = self
                .responses
                .lock()
                .map_err(|_| Error::Forge("runner lock poisoned".to_string()))?;
            if responses.is_empty() {
                Err(Error::Forge("no more scripted responses".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn forge(responses: Vec<Result<String>>) -> GhForge<ScriptedRunner> {
        let mut forge = GhForge::with_runner(ScriptedRunner::new(responses));
        forge.initial_backoff_ms = 1;
        forge
    }

    fn repo() -> PathBuf {
        PathBuf::from(".")
    }

    #[tokio::test]
    async fn test_get_pull_request() {
        let forge = forge(vec![Ok(
            r#"{"number":42,"title":"Add cache","body":null,"url":"u","headRefOid":"abc123"}"#.to_string(),
        )]);
        let pr = forge.get_entity(&repo(), EntityKind::PullRequest, 42).await.unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.title, "Add cache");
        assert_eq!(pr.head_sha.as_deref(), Some("abc123"));
        assert_eq!(
            forge.runner.calls(),
            vec!["gh pr view 42 --json number,title,body,url,headRefOid"]
        );
    }

    #[tokio::test]
    async fn test_get_issue_without_body() {
        let forge = forge(vec![Ok(r#"{"number":7,"title":"Crash on start","url":"u"}"#.to_string())]);
        let issue = forge.get_entity(&repo(), EntityKind::Issue, 7).await.unwrap();
        assert_eq!(issue.body, "");
        assert!(issue.head_sha.is_none());
        assert!(forge.runner.calls()[0].starts_with("gh issue view 7"));
    }

    #[tokio::test]
    async fn test_get_repo_info() {
        let forge = forge(vec![Ok(
            r#"{"nameWithOwner":"acme/widgets","defaultBranchRef":{"name":"main"}}"#.to_string(),
        )]);
        let info = forge.get_repo_info(&repo()).await.unwrap();
        assert_eq!(info.full_name, "acme/widgets");
        assert_eq!(info.default_branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_head_sha_and_commit_diff() {
        let forge = forge(vec![
            Ok(r#"{"headRefOid":"def456"}"#.to_string()),
            Ok("diff --git a/x b/x".to_string()),
        ]);
        assert_eq!(forge.get_head_sha(&repo(), 3).await.unwrap(), "def456");
        let diff = forge.get_commit_diff(&repo(), "abc", "def456").await.unwrap();
        assert!(diff.starts_with("diff --git"));
        assert_eq!(forge.runner.calls()[1], "git diff abc..def456");
    }

    #[tokio::test]
    async fn test_gh_error_retried_then_propagated() {
        let forge = forge(vec![
            Err(Error::Process("gh not found".to_string())),
            Err(Error::Process("gh not found".to_string())),
            Err(Error::Process("gh not found".to_string())),
        ]);
        let err = forge.get_diff(&repo(), 1).await.unwrap_err();
        assert!(err.to_string().contains("gh not found"));
        assert_eq!(forge.runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_json_is_forge_error() {
        let forge = forge(vec![Ok("not json".to_string())]);
        let err = forge.get_entity(&repo(), EntityKind::Issue, 1).await.unwrap_err();
        assert!(matches!(err, Error::Forge(_)));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Forge("transient".to_string()))
                } else {
                    Ok("success".to_string())
                }
            },
            1,
            3,
        )
        .await;
        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let result: Result<String> =
            retry_with_backoff(|| async { Err(Error::Forge("permanent".to_string())) }, 1, 3).await;
        assert!(result.is_err());
    }
}
