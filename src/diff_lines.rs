use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default distance (in lines) a comment may be moved to land on a diff line.
pub const DEFAULT_SNAP_WINDOW: u32 = 3;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

/// Normalized file path -> line numbers that exist on the new side of a diff.
pub type ValidLineSet = HashMap<String, BTreeSet<u32>>;

/// An inline comment proposed against a file/line of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    FileNotInDiff,
    LineNotInDiff,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::FileNotInDiff => write!(f, "file not found in diff"),
            RejectReason::LineNotInDiff => write!(f, "line not in diff"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedComment {
    pub comment: InlineComment,
    pub reason: RejectReason,
}

/// Result of checking a batch of comments against a [`ValidLineSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentValidation {
    pub accepted: Vec<InlineComment>,
    pub rejected: Vec<RejectedComment>,
    /// How many accepted comments had their line moved.
    pub snapped: usize,
}

/// Hunk bookkeeping: the next new-side line number and how many old/new lines
/// the header said remain.
struct Hunk {
    new_line: u32,
    old_remaining: u32,
    new_remaining: u32,
}

impl Hunk {
    fn is_done(&self) -> bool {
        self.old_remaining == 0 && self.new_remaining == 0
    }
}

/// Parse a unified diff into the set of valid new-side line numbers per file.
pub fn parse_valid_lines(diff: &str) -> ValidLineSet {
    let mut valid = ValidLineSet::new();
    let mut current_file: Option<String> = None;
    let mut hunk: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            current_file = None;
            hunk = None;
            continue;
        }

        if let Some(h) = hunk.as_mut() {
            match line.as_bytes().first() {
                Some(b'+') => {
                    if let Some(file) = &current_file {
                        valid.entry(file.clone()).or_default().insert(h.new_line);
                    }
                    h.new_line += 1;
                    h.new_remaining = h.new_remaining.saturating_sub(1);
                }
                Some(b'-') => {
                    h.old_remaining = h.old_remaining.saturating_sub(1);
                }
                Some(b'\\') => {}
                _ => {
                    if let Some(file) = &current_file {
                        valid.entry(file.clone()).or_default().insert(h.new_line);
                    }
                    h.new_line += 1;
                    h.new_remaining = h.new_remaining.saturating_sub(1);
                    h.old_remaining = h.old_remaining.saturating_sub(1);
                }
            }
            if h.is_done() {
                hunk = None;
            }
            continue;
        }

        if let Some(caps) = HUNK_HEADER.captures(line) {
            let count = |idx: usize| {
                caps.get(idx)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(1)
            };
            let new_start = caps[3].parse::<u32>().unwrap_or(1);
            let h = Hunk {
                new_line: new_start,
                old_remaining: count(2),
                new_remaining: count(4),
            };
            hunk = (!h.is_done()).then_some(h);
            continue;
        }

        if let Some(target) = line.strip_prefix("+++ ") {
            current_file = parse_target_path(target);
            if let Some(file) = &current_file {
                valid.entry(file.clone()).or_default();
            }
        }
    }

    valid
}

fn parse_target_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    if path == "/dev/null" {
        return None;
    }
    let path = path.strip_prefix("b/").unwrap_or(path);
    Some(normalize_path(path))
}

/// Strip leading `./` and `/`, and convert backslashes to forward slashes.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized.trim_start_matches('/').to_string()
}

/// Accept, snap, or reject each comment against the diff's valid lines.
///
/// A comment whose line is not in the diff is moved to the closest valid line
/// at most `window` lines away (the earlier line wins a tie). The input slice
/// is never modified; accepted comments are returned as new values.
pub fn validate(
    comments: &[InlineComment],
    valid: &ValidLineSet,
    window: u32,
) -> CommentValidation {
    let mut outcome = CommentValidation::default();

    for comment in comments {
        let path = normalize_path(&comment.path);
        let Some(lines) = valid.get(&path) else {
            outcome.rejected.push(RejectedComment {
                comment: comment.clone(),
                reason: RejectReason::FileNotInDiff,
            });
            continue;
        };

        match closest_valid_line(lines, comment.line, window) {
            Some(line) => {
                if line != comment.line {
                    outcome.snapped += 1;
                }
                outcome.accepted.push(InlineComment {
                    path,
                    line,
                    body: comment.body.clone(),
                });
            }
            None => outcome.rejected.push(RejectedComment {
                comment: comment.clone(),
                reason: RejectReason::LineNotInDiff,
            }),
        }
    }

    outcome
}

fn closest_valid_line(lines: &BTreeSet<u32>, line: u32, window: u32) -> Option<u32> {
    if lines.contains(&line) {
        return Some(line);
    }
    (1..=window).find_map(|distance| {
        let below = line.checked_sub(distance).filter(|l| lines.contains(l));
        below.or_else(|| Some(line + distance).filter(|l| lines.contains(l)))
    })
}
