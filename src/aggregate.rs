//! Merging of findings and scores produced by several review sub-agents.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::diff_lines::normalize_path;
use crate::review_schema::{Finding, NEUTRAL_SCORE, ReviewOutput, Severity, SubAgentScore};

pub const DEFAULT_LINE_GROUP_SIZE: u32 = 5;
pub const DEFAULT_SCORE_DIVERGENCE: f64 = 2.0;

const CRITICAL_SCORE_CAP: f64 = 5.0;
const MAJOR_SCORE_CAP: f64 = 7.0;

/// Tunables for [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSettings {
    pub line_group_size: u32,
    /// Recomputed score replaces the self-reported one when they differ by more than this.
    pub score_divergence: f64,
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            line_group_size: DEFAULT_LINE_GROUP_SIZE,
            score_divergence: DEFAULT_SCORE_DIVERGENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedReview {
    pub findings: Vec<Finding>,
    pub score: f64,
}

/// First line of the fixed-width bucket `line` falls in: 1..=5 -> 1, 6..=10 -> 6, ...
pub fn line_group(line: u32, size: u32) -> u32 {
    let size = size.max(1);
    (line.max(1) - 1) / size * size + 1
}

/// Collapse findings that point at the same spot with the same category.
pub fn deduplicate(findings: &[Finding]) -> Vec<Finding> {
    deduplicate_with(findings, DEFAULT_LINE_GROUP_SIZE)
}

/// [`deduplicate`] with a configurable bucket width.
///
/// Each group keeps its most severe, most detailed finding. When the group
/// was reported by more than one distinct agent the kept finding is escalated
/// one severity level. Groups keep the order of their first finding.
pub fn deduplicate_with(findings: &[Finding], line_group_size: u32) -> Vec<Finding> {
    let mut order: Vec<(String, u32, String)> = Vec::new();
    let mut groups: HashMap<(String, u32, String), Vec<&Finding>> = HashMap::new();

    for finding in findings {
        let key = (
            normalize_path(&finding.file),
            line_group(finding.line, line_group_size),
            finding.category.trim().to_lowercase(),
        );
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(finding);
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter_map(merge_group)
        .collect()
}

fn merge_group(mut group: Vec<&Finding>) -> Option<Finding> {
    if group.len() == 1 {
        return group.pop().cloned();
    }

    let sources: HashSet<&str> = group
        .iter()
        .filter_map(|f| f.agent_source.as_deref())
        .collect();

    group.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.explanation.len().cmp(&a.explanation.len()))
    });

    let representative = group.first()?;
    let mut merged = (*representative).clone();
    if sources.len() > 1 {
        merged.severity = merged.severity.escalate();
        debug!(
            file = merged.file,
            line = merged.line,
            agents = sources.len(),
            severity = %merged.severity,
            "corroborated finding escalated"
        );
    }
    Some(merged)
}

/// Weighted mean of sub-agent scores rounded to one decimal. Zero-weight and
/// malformed entries are ignored; with no usable weight the neutral score is returned.
pub fn weighted_score(scores: &[SubAgentScore]) -> f64 {
    let (total, weight) = scores
        .iter()
        .filter(|s| s.is_well_formed() && s.weight > 0.0)
        .fold((0.0, 0.0), |(total, weight), s| {
            (total + s.score * s.weight, weight + s.weight)
        });

    if weight <= 0.0 {
        return NEUTRAL_SCORE;
    }
    round_one_decimal(total / weight)
}

/// Clamp the score to 5 when any finding is critical, else to 7 when any is major.
pub fn apply_severity_caps(score: f64, findings: &[Finding]) -> f64 {
    let worst = findings.iter().map(|f| f.severity).max();
    match worst {
        Some(Severity::Critical) => score.min(CRITICAL_SCORE_CAP),
        Some(Severity::Major) => score.min(MAJOR_SCORE_CAP),
        _ => score,
    }
}

/// Multi-agent pipeline: dedupe, weigh sub-agent scores, reconcile with the
/// self-reported score, then cap by severity.
pub fn aggregate(output: &ReviewOutput, settings: &AggregateSettings) -> AggregatedReview {
    let findings = deduplicate_with(&output.findings, settings.line_group_size);

    let has_weighted = output
        .sub_agent_scores
        .iter()
        .any(|s| s.is_well_formed() && s.weight > 0.0);
    let computed = has_weighted.then(|| weighted_score(&output.sub_agent_scores));

    let score = match (output.score, computed) {
        (Some(reported), Some(computed))
            if (reported - computed).abs() > settings.score_divergence =>
        {
            debug!(reported, computed, "self-reported score diverges, using weighted score");
            computed
        }
        (Some(reported), _) => reported,
        (None, Some(computed)) => computed,
        (None, None) => NEUTRAL_SCORE,
    };

    let capped = apply_severity_caps(score, &findings);
    debug!(
        before = output.findings.len(),
        after = findings.len(),
        score = capped,
        "aggregated sub-agent findings"
    );

    AggregatedReview {
        findings,
        score: capped,
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
