use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::review_schema::Finding;

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");
const DEFAULT_RE_REVIEW: &str = include_str!("default_prompts/re-review.md");
const DEFAULT_VALIDATE: &str = include_str!("default_prompts/validate.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPhase {
    Review,
    ReReview,
    Validate,
}

impl PromptPhase {
    pub fn name(self) -> &'static str {
        match self {
            PromptPhase::Review => "review",
            PromptPhase::ReReview => "re-review",
            PromptPhase::Validate => "validate",
        }
    }

    fn default_template(self) -> &'static str {
        match self {
            PromptPhase::Review => DEFAULT_REVIEW,
            PromptPhase::ReReview => DEFAULT_RE_REVIEW,
            PromptPhase::Validate => DEFAULT_VALIDATE,
        }
    }

    fn template_filename(self) -> String {
        format!("{}.md", self.name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewVars {
    pub repository: String,
    pub repo_path: String,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_body: String,
    pub diff: String,
    pub multi_agent: bool,
}

/// Extra context for a re-review: what the prior run said and what changed since.
#[derive(Debug, Clone, Serialize)]
pub struct ReReviewVars {
    #[serde(flatten)]
    pub review: ReviewVars,
    pub previous_summary: String,
    pub previous_score: String,
    pub previous_findings: Vec<Finding>,
    /// Empty when the incremental diff could not be computed.
    pub incremental_diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateVars {
    pub repository: String,
    pub repo_path: String,
    pub issue_number: u64,
    pub issue_title: String,
    pub issue_body: String,
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<PathBuf>,
    engine: upon::Engine<'static>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self {
            override_dir,
            engine: upon::Engine::new(),
        }
    }

    /// User overrides in `override_dir` take precedence over defaults.
    pub fn load_template(&self, phase: PromptPhase) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(phase.template_filename());
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(phase.default_template().to_string())
    }

    /// Load a template and render it. Unknown variables are an error.
    pub fn render_phase<V: Serialize>(&self, phase: PromptPhase, vars: &V) -> Result<String> {
        let source = self.load_template(phase)?;
        self.render(phase.name(), source, vars)
    }

    fn render<V: Serialize>(&self, name: &str, source: String, vars: &V) -> Result<String> {
        let template = self
            .engine
            .compile(source)
            .map_err(|e| Error::Prompt(format!("invalid {name} template: {e}")))?;
        template
            .render(&self.engine, vars)
            .to_string()
            .map_err(|e| Error::Prompt(format!("failed to render {name} template: {e}")))
    }
}
