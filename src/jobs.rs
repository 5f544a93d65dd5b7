use std::fmt::Debug;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentCapability, AgentRequest, CancelSignal, ProgressStep, drive};
use crate::aggregate::{AggregateSettings, aggregate};
use crate::diff_lines::{self, InlineComment};
use crate::error::{Error, Result};
use crate::forge::{Entity, EntityKind, Forge};
use crate::history::{HistoryEntry, HistoryStore};
use crate::prompts::{PromptEngine, PromptPhase, ReReviewVars, ReviewVars, ValidateVars};
use crate::review_schema::{
    NEUTRAL_SCORE, ReviewResult, ValidationResult, parse_review_output, parse_validation_output,
    review_output_schema, validation_output_schema,
};

/// Receives progress steps in the order the agent emits them.
pub type StepSink = Box<dyn FnMut(ProgressStep) + Send>;

/// Which earlier review a re-review measures against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PriorReview {
    #[default]
    None,
    /// The most recent history entry for the same repository and PR.
    Latest,
    Id(String),
}

/// Everything one run of a job needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub entity_number: u64,
    pub project_path: PathBuf,
    pub prior: PriorReview,
    pub cancel: CancelSignal,
}

impl JobContext {
    fn check_cancelled(&self, what: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{what} #{}", self.entity_number)));
        }
        Ok(())
    }
}

/// A single-job procedure driven by the dispatcher.
pub trait JobRunner: Send + Sync + 'static {
    type Output: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Queue name, used as the event prefix (`review`, `validation`).
    fn kind(&self) -> &'static str;

    fn run(&self, ctx: JobContext, on_step: StepSink) -> impl Future<Output = Result<Self::Output>> + Send;
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub multi_agent: bool,
    pub snap_window: u32,
    pub aggregate: AggregateSettings,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            multi_agent: false,
            snap_window: diff_lines::DEFAULT_SNAP_WINDOW,
            aggregate: AggregateSettings::default(),
        }
    }
}

/// Reviews one pull request and files the result in review history.
pub struct ReviewJob<F, A> {
    forge: Arc<F>,
    agent: Arc<A>,
    history: Arc<HistoryStore<ReviewResult>>,
    prompts: Arc<PromptEngine>,
    settings: ReviewSettings,
}

impl<F: Forge, A: AgentCapability> ReviewJob<F, A> {
    pub fn new(
        forge: Arc<F>,
        agent: Arc<A>,
        history: Arc<HistoryStore<ReviewResult>>,
        prompts: Arc<PromptEngine>,
        settings: ReviewSettings,
    ) -> Self {
        Self {
            forge,
            agent,
            history,
            prompts,
            settings,
        }
    }

    fn resolve_prior(
        &self,
        repository: &str,
        pr_number: u64,
        prior: &PriorReview,
    ) -> Option<HistoryEntry<ReviewResult>> {
        let found = match prior {
            PriorReview::None => return None,
            PriorReview::Latest => self.history.get_latest(repository, pr_number),
            PriorReview::Id(id) => self.history.get(id),
        };
        match found {
            Ok(Some(entry)) if entry.repository == repository && entry.result.pr_number == pr_number => {
                Some(entry)
            }
            Ok(Some(entry)) => {
                warn!(
                    pr = pr_number,
                    prior = entry.id,
                    "prior review belongs to a different pull request, reviewing from scratch"
                );
                None
            }
            Ok(None) => {
                warn!(pr = pr_number, prior = ?prior, "prior review not found, reviewing from scratch");
                None
            }
            Err(e) => {
                warn!(pr = pr_number, error = %e, "failed to load prior review, reviewing from scratch");
                None
            }
        }
    }

    async fn head_sha(&self, repo: &Path, entity: &Entity) -> Option<String> {
        if let Some(sha) = &entity.head_sha {
            return Some(sha.clone());
        }
        match self.forge.get_head_sha(repo, entity.number).await {
            Ok(sha) => Some(sha),
            Err(e) => {
                warn!(pr = entity.number, error = %e, "could not determine head commit");
                None
            }
        }
    }

    async fn incremental_diff(
        &self,
        repo: &Path,
        prior: &HistoryEntry<ReviewResult>,
        head_sha: Option<&str>,
    ) -> String {
        let (Some(from), Some(to)) = (prior.result.commit_sha.as_deref(), head_sha) else {
            return String::new();
        };
        if from == to {
            return String::new();
        }
        match self.forge.get_commit_diff(repo, from, to).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(from, to, error = %e, "incremental diff unavailable");
                String::new()
            }
        }
    }

    fn next_sequence(&self, repository: &str, pr_number: u64, prior: Option<&HistoryEntry<ReviewResult>>) -> u32 {
        let latest = match self.history.get_latest(repository, pr_number) {
            Ok(latest) => latest.map(|e| e.result.review_sequence),
            Err(e) => {
                warn!(pr = pr_number, error = %e, "failed to read review chain");
                None
            }
        };
        let after_prior = prior.map(|p| p.result.review_sequence);
        latest.max(after_prior).map_or(1, |seq| seq + 1)
    }
}

impl<F: Forge, A: AgentCapability> JobRunner for ReviewJob<F, A> {
    type Output = HistoryEntry<ReviewResult>;

    fn kind(&self) -> &'static str {
        "review"
    }

    async fn run(&self, ctx: JobContext, on_step: StepSink) -> Result<Self::Output> {
        let repo = ctx.project_path.as_path();
        let pr_number = ctx.entity_number;

        let repository = self.forge.get_repo_info(repo).await?.full_name;
        let entity = self.forge.get_entity(repo, EntityKind::PullRequest, pr_number).await?;
        let diff = self.forge.get_diff(repo, pr_number).await?;
        if diff.trim().is_empty() {
            return Err(Error::Forge(format!("pull request #{pr_number} has an empty diff")));
        }

        if !self.agent.is_available() {
            return Err(Error::Agent(format!("provider not available: {}", self.agent.name())));
        }
        ctx.check_cancelled("review")?;

        let prior = self.resolve_prior(&repository, pr_number, &ctx.prior);
        let head_sha = self.head_sha(repo, &entity).await;

        let review_vars = ReviewVars {
            repository: repository.clone(),
            repo_path: repo.display().to_string(),
            pr_number,
            pr_title: entity.title.clone(),
            pr_body: entity.body.clone(),
            diff: diff.clone(),
            multi_agent: self.settings.multi_agent,
        };
        let prompt = match &prior {
            Some(prior) => {
                let incremental_diff = self.incremental_diff(repo, prior, head_sha.as_deref()).await;
                self.prompts.render_phase(
                    PromptPhase::ReReview,
                    &ReReviewVars {
                        review: review_vars,
                        previous_summary: prior.result.summary.clone(),
                        previous_score: format!("{:.1}", prior.result.score),
                        previous_findings: prior.result.findings.clone(),
                        incremental_diff,
                    },
                )?
            }
            None => self.prompts.render_phase(PromptPhase::Review, &review_vars)?,
        };
        ctx.check_cancelled("review")?;

        info!(pr = pr_number, re_review = prior.is_some(), agent = self.agent.name(), "review started");
        let stream = self.agent.invoke(
            AgentRequest {
                prompt,
                output_schema: review_output_schema(self.settings.multi_agent),
                working_dir: ctx.project_path.clone(),
            },
            ctx.cancel.clone(),
        );
        let output = drive(stream, on_step).await?;
        let parsed = parse_review_output(&output.text)?;

        let (findings, score) = if self.settings.multi_agent {
            let merged = aggregate(&parsed, &self.settings.aggregate);
            (merged.findings, merged.score)
        } else {
            (parsed.findings.clone(), parsed.score.unwrap_or(NEUTRAL_SCORE))
        };

        let valid_lines = diff_lines::parse_valid_lines(&diff);
        let comments: Vec<InlineComment> = findings
            .iter()
            .filter(|f| !f.file.is_empty() && f.line > 0)
            .map(|f| f.as_inline_comment())
            .collect();
        let checked = diff_lines::validate(&comments, &valid_lines, self.settings.snap_window);
        if !checked.rejected.is_empty() || checked.snapped > 0 {
            info!(
                pr = pr_number,
                rejected = checked.rejected.len(),
                snapped = checked.snapped,
                "inline comments adjusted to diff"
            );
        }

        let review_sequence = self.next_sequence(&repository, pr_number, prior.as_ref());
        let result = ReviewResult {
            pr_number,
            pr_title: entity.title,
            summary: parsed.summary,
            score,
            findings,
            sub_agent_scores: parsed.sub_agent_scores,
            inline_comments: checked.accepted,
            dropped_comments: checked.rejected,
            reviewed_at: Utc::now(),
            usage: output.usage,
            commit_sha: head_sha,
            review_sequence,
            is_re_review: prior.is_some(),
            previous_review_id: prior.as_ref().map(|p| p.id.clone()),
            previous_score: prior.as_ref().map(|p| p.result.score),
        };

        let entry = self.history.save(&repository, result)?;
        info!(
            pr = pr_number,
            id = entry.id,
            score = entry.result.score,
            findings = entry.result.findings.len(),
            sequence = entry.result.review_sequence,
            "review saved"
        );
        Ok(entry)
    }
}

/// Validates one issue against the code and files the verdict.
pub struct ValidationJob<F, A> {
    forge: Arc<F>,
    agent: Arc<A>,
    history: Arc<HistoryStore<ValidationResult>>,
    prompts: Arc<PromptEngine>,
}

impl<F: Forge, A: AgentCapability> ValidationJob<F, A> {
    pub fn new(
        forge: Arc<F>,
        agent: Arc<A>,
        history: Arc<HistoryStore<ValidationResult>>,
        prompts: Arc<PromptEngine>,
    ) -> Self {
        Self {
            forge,
            agent,
            history,
            prompts,
        }
    }
}

impl<F: Forge, A: AgentCapability> JobRunner for ValidationJob<F, A> {
    type Output = HistoryEntry<ValidationResult>;

    fn kind(&self) -> &'static str {
        "validation"
    }

    async fn run(&self, ctx: JobContext, on_step: StepSink) -> Result<Self::Output> {
        let repo = ctx.project_path.as_path();
        let issue_number = ctx.entity_number;

        let repository = self.forge.get_repo_info(repo).await?.full_name;
        let issue = self.forge.get_entity(repo, EntityKind::Issue, issue_number).await?;

        if !self.agent.is_available() {
            return Err(Error::Agent(format!("provider not available: {}", self.agent.name())));
        }
        ctx.check_cancelled("validation")?;

        let prompt = self.prompts.render_phase(
            PromptPhase::Validate,
            &ValidateVars {
                repository: repository.clone(),
                repo_path: repo.display().to_string(),
                issue_number,
                issue_title: issue.title.clone(),
                issue_body: issue.body,
            },
        )?;

        info!(issue = issue_number, agent = self.agent.name(), "validation started");
        let stream = self.agent.invoke(
            AgentRequest {
                prompt,
                output_schema: validation_output_schema(),
                working_dir: ctx.project_path.clone(),
            },
            ctx.cancel.clone(),
        );
        let output = drive(stream, on_step).await?;
        let parsed = parse_validation_output(&output.text)?;

        let result = ValidationResult {
            issue_number,
            issue_title: issue.title,
            verdict: parsed.verdict,
            summary: parsed.summary,
            confidence: parsed.confidence,
            findings: parsed.findings,
            related_files: parsed.related_files,
            validated_at: Utc::now(),
            usage: output.usage,
        };

        let entry = self.history.save(&repository, result)?;
        info!(issue = issue_number, id = entry.id, verdict = %entry.result.verdict, "validation saved");
        Ok(entry)
    }
}
