use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::diff_lines::{InlineComment, RejectedComment};
use crate::error::{Error, Result};

/// Score used when nothing better is known.
pub const NEUTRAL_SCORE: f64 = 5.0;

/// Finding severity, ordered `Nit < Minor < Major < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Nit,
    Minor,
    Major,
    Critical,
}

impl Severity {
    /// One level up; `Critical` stays `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Nit => Severity::Minor,
            Severity::Minor => Severity::Major,
            Severity::Major | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Nit => write!(f, "nit"),
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub file: String,
    /// 1-based, new side of the diff.
    pub line: u32,
    pub title: String,
    pub explanation: String,
    #[serde(default)]
    pub code_snippet: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_source: Option<String>,
}

impl Finding {
    pub fn as_inline_comment(&self) -> InlineComment {
        let mut body = format!("**[{}] {}**\n\n{}", self.severity, self.title, self.explanation);
        if !self.suggested_fix.trim().is_empty() {
            body.push_str("\n\nSuggested fix:\n");
            body.push_str(self.suggested_fix.trim());
        }
        InlineComment {
            path: self.file.clone(),
            line: self.line,
            body,
        }
    }
}

/// One sub-agent's verdict in multi-agent mode. A weight of zero marks an
/// agent that contributes context only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentScore {
    pub agent: String,
    pub score: f64,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SubAgentScore {
    pub fn is_well_formed(&self) -> bool {
        self.score.is_finite() && self.weight.is_finite() && self.weight >= 0.0
    }
}

/// Timing and cost reported by the agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

/// Structured output the agent returns for a pull request review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutput {
    pub summary: String,
    pub score: Option<f64>,
    pub findings: Vec<Finding>,
    pub sub_agent_scores: Vec<SubAgentScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationVerdict {
    Confirmed,
    Likely,
    Unclear,
    Invalid,
}

impl fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationVerdict::Confirmed => write!(f, "confirmed"),
            ValidationVerdict::Likely => write!(f, "likely"),
            ValidationVerdict::Unclear => write!(f, "unclear"),
            ValidationVerdict::Invalid => write!(f, "invalid"),
        }
    }
}

/// Structured output the agent returns for an issue validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutput {
    pub verdict: ValidationVerdict,
    pub summary: String,
    pub confidence: f64,
    pub findings: Vec<Finding>,
    pub related_files: Vec<String>,
}

/// A completed review, enriched with chain metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResult {
    pub pr_number: u64,
    pub pr_title: String,
    pub summary: String,
    pub score: f64,
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub sub_agent_scores: Vec<SubAgentScore>,
    #[serde(default)]
    pub inline_comments: Vec<InlineComment>,
    #[serde(default)]
    pub dropped_comments: Vec<RejectedComment>,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: AgentUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub review_sequence: u32,
    #[serde(default)]
    pub is_re_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_review_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub issue_number: u64,
    pub issue_title: String,
    pub verdict: ValidationVerdict,
    pub summary: String,
    pub confidence: f64,
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub related_files: Vec<String>,
    pub validated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: AgentUsage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReviewOutput {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    findings: Vec<Value>,
    #[serde(default)]
    sub_agent_scores: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawValidationOutput {
    verdict: ValidationVerdict,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    findings: Vec<Value>,
    #[serde(default)]
    related_files: Vec<String>,
}

/// Parse the agent's review JSON. Individual findings or sub-agent scores that
/// do not deserialize are dropped instead of failing the whole result.
pub fn parse_review_output(raw: &str) -> Result<ReviewOutput> {
    let json = extract_json(raw);
    let parsed: RawReviewOutput = serde_json::from_str(&json)
        .map_err(|e| Error::Schema(format!("failed to parse review JSON: {e}")))?;

    let sub_agent_scores = keep_valid::<SubAgentScore>(parsed.sub_agent_scores, "sub-agent score")
        .into_iter()
        .filter(|s| {
            let ok = s.is_well_formed();
            if !ok {
                warn!(agent = s.agent, "dropping malformed sub-agent score");
            }
            ok
        })
        .collect();

    Ok(ReviewOutput {
        summary: parsed.summary,
        score: parsed.score.filter(|s| s.is_finite()).map(clamp_score),
        findings: keep_valid(parsed.findings, "finding"),
        sub_agent_scores,
    })
}

pub fn parse_validation_output(raw: &str) -> Result<ValidationOutput> {
    let json = extract_json(raw);
    let parsed: RawValidationOutput = serde_json::from_str(&json)
        .map_err(|e| Error::Schema(format!("failed to parse validation JSON: {e}")))?;

    Ok(ValidationOutput {
        verdict: parsed.verdict,
        summary: parsed.summary,
        confidence: parsed
            .confidence
            .filter(|c| c.is_finite())
            .map(clamp_score)
            .unwrap_or(NEUTRAL_SCORE),
        findings: keep_valid(parsed.findings, "finding"),
        related_files: parsed.related_files,
    })
}

pub fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 10.0)
}

fn keep_valid<T: DeserializeOwned>(values: Vec<Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "dropping malformed {what}");
                None
            }
        })
        .collect()
}

/// Strip markdown fences and any prose around the outermost JSON object.
fn extract_json(input: &str) -> String {
    let stripped = strip_markdown_fences(input);
    match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if start < end => stripped[start..=end].to_string(),
        _ => stripped,
    }
}

/// Remove markdown code fences from a string, returning the inner content.
/// Handles ` ```json `, ` ``` `, and bare JSON.
fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        let after_tag = if let Some(pos) = rest.find('\n') {
            &rest[pos + 1..]
        } else {
            return String::new();
        };

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}

fn finding_schema() -> Value {
    json!({
        "type": "object",
        "required": ["severity", "category", "file", "line", "title", "explanation"],
        "properties": {
            "severity": { "enum": ["critical", "major", "minor", "nit"] },
            "category": { "type": "string" },
            "file": { "type": "string" },
            "line": { "type": "integer", "minimum": 1 },
            "title": { "type": "string" },
            "explanation": { "type": "string" },
            "codeSnippet": { "type": "string" },
            "suggestedFix": { "type": "string" },
            "agentSource": { "type": "string" }
        }
    })
}

/// JSON schema handed to the agent for review runs.
pub fn review_output_schema(multi_agent: bool) -> Value {
    let mut schema = json!({
        "type": "object",
        "required": ["summary", "score", "findings"],
        "properties": {
            "summary": { "type": "string" },
            "score": { "type": "number", "minimum": 0, "maximum": 10 },
            "findings": { "type": "array", "items": finding_schema() }
        }
    });
    if multi_agent {
        schema["required"] = json!(["summary", "score", "findings", "subAgentScores"]);
        schema["properties"]["subAgentScores"] = json!({
            "type": "array",
            "items": {
                "type": "object",
                "required": ["agent", "score", "weight"],
                "properties": {
                    "agent": { "type": "string" },
                    "score": { "type": "number", "minimum": 0, "maximum": 10 },
                    "weight": { "type": "number", "minimum": 0 },
                    "summary": { "type": "string" }
                }
            }
        });
    }
    schema
}

/// JSON schema handed to the agent for issue validation runs.
pub fn validation_output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["verdict", "summary", "confidence", "findings"],
        "properties": {
            "verdict": { "enum": ["confirmed", "likely", "unclear", "invalid"] },
            "summary": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 10 },
            "findings": { "type": "array", "items": finding_schema() },
            "relatedFiles": { "type": "array", "items": { "type": "string" } }
        }
    })
}
