use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::aggregate::{AggregateSettings, DEFAULT_LINE_GROUP_SIZE, DEFAULT_SCORE_DIVERGENCE};
use crate::cli::Cli;
use crate::diff_lines::DEFAULT_SNAP_WINDOW;
use crate::error::{Error, Result};
use crate::history::DEFAULT_HISTORY_CAP;
use crate::jobs::ReviewSettings;

pub const DEFAULT_CONFIG_FILE: &str = ".revq.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub agent_max_turns: Option<u32>,
    pub forge_timeout: Option<u64>,
    pub probe_timeout: Option<u64>,
    pub status_ttl: Option<u64>,
    pub history_dir: Option<String>,
    pub history_cap: Option<usize>,
    pub multi_agent: Option<bool>,
    pub snap_window: Option<u32>,
    pub line_group_size: Option<u32>,
    pub score_divergence: Option<f64>,
    pub prompt_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub repo_root: PathBuf,
    pub agent_binary: String,
    pub agent_model: Option<String>,
    pub agent_max_turns: Option<u32>,
    pub forge_timeout: u64,
    pub probe_timeout: u64,
    pub status_ttl: u64,
    /// Resolved against `repo_root` when relative.
    pub history_dir: PathBuf,
    pub history_cap: usize,
    pub multi_agent: bool,
    pub snap_window: u32,
    pub line_group_size: u32,
    pub score_divergence: f64,
    pub prompt_dir: Option<PathBuf>,
}

impl Config {
    /// Load the config file and apply CLI overrides. A missing default config
    /// file is fine; a missing file named with `--config` is not.
    pub fn load(cli: &Cli) -> Result<Self> {
        let repo_root = match cli.repo {
            Some(ref repo) => PathBuf::from(repo),
            None => std::env::current_dir()?,
        };

        let file_config = match cli.config {
            Some(ref path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = repo_root.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(&path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let config = merge(file_config, cli, repo_root);
        validate_merged(&config)?;
        Ok(config)
    }

    pub fn forge_timeout(&self) -> Duration {
        Duration::from_secs(self.forge_timeout)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl)
    }

    pub fn review_settings(&self) -> ReviewSettings {
        ReviewSettings {
            multi_agent: self.multi_agent,
            snap_window: self.snap_window,
            aggregate: AggregateSettings {
                line_group_size: self.line_group_size,
                score_divergence: self.score_divergence,
            },
        }
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    let positive = [
        ("forge_timeout", config.forge_timeout),
        ("probe_timeout", config.probe_timeout),
        ("status_ttl", config.status_ttl),
        ("history_cap", config.history_cap.map(|c| c as u64)),
        ("line_group_size", config.line_group_size.map(u64::from)),
    ];
    for (key, value) in positive {
        if value == Some(0) {
            return Err(Error::ConfigValidation(format!("{key} must be > 0")));
        }
    }
    if let Some(divergence) = config.score_divergence
        && !(divergence.is_finite() && divergence >= 0.0)
    {
        return Err(Error::ConfigValidation(
            "score_divergence must be a non-negative number".to_string(),
        ));
    }
    if let Some(ref binary) = config.agent_binary
        && binary.trim().is_empty()
    {
        return Err(Error::ConfigValidation(
            "agent_binary must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_merged(config: &Config) -> Result<()> {
    if config.agent_binary.trim().is_empty() {
        return Err(Error::ConfigValidation(
            "agent_binary must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli, repo_root: PathBuf) -> Config {
    let history_dir = PathBuf::from(file.history_dir.unwrap_or_else(|| ".revq".to_string()));
    let history_dir = if history_dir.is_absolute() {
        history_dir
    } else {
        repo_root.join(history_dir)
    };

    Config {
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| "claude".to_string()),
        agent_model: cli.agent_model.clone().or(file.agent_model),
        agent_max_turns: file.agent_max_turns,
        forge_timeout: file.forge_timeout.unwrap_or(60),
        probe_timeout: file.probe_timeout.unwrap_or(10),
        status_ttl: file.status_ttl.unwrap_or(60),
        history_dir,
        history_cap: file.history_cap.unwrap_or(DEFAULT_HISTORY_CAP),
        multi_agent: cli.multi_agent || file.multi_agent.unwrap_or(false),
        snap_window: file.snap_window.unwrap_or(DEFAULT_SNAP_WINDOW),
        line_group_size: file.line_group_size.unwrap_or(DEFAULT_LINE_GROUP_SIZE),
        score_divergence: file.score_divergence.unwrap_or(DEFAULT_SCORE_DIVERGENCE),
        prompt_dir: file.prompt_dir.map(PathBuf::from),
        repo_root,
    }
}
