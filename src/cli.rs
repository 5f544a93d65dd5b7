use clap::{Parser, Subcommand};

/// Queued AI review and validation of pull requests and issues
#[derive(Parser, Debug, Clone)]
#[command(name = "revq", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: .revq.toml in the repository)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Repository checkout to work in (default: current directory)
    #[arg(long, global = true)]
    pub repo: Option<String>,

    /// Agent binary to use (default: claude)
    #[arg(long, global = true)]
    pub agent_binary: Option<String>,

    /// Model for the agent to use
    #[arg(long, global = true)]
    pub agent_model: Option<String>,

    /// Ask the agent for sub-agent reviews and merge their findings
    #[arg(long, global = true)]
    pub multi_agent: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Review one or more pull requests, one at a time
    Review {
        /// Pull request numbers
        #[arg(required = true)]
        prs: Vec<u64>,

        /// Re-review against the latest saved review of each PR
        #[arg(long, conflicts_with = "since")]
        re_review: bool,

        /// Re-review against a specific saved review
        #[arg(long, value_name = "ID")]
        since: Option<String>,
    },

    /// Check whether one or more issues describe a real problem
    Validate {
        /// Issue numbers
        #[arg(required = true)]
        issues: Vec<u64>,
    },

    /// Inspect or prune saved reviews
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Show agent CLI install and auth status
    Status {
        /// Ignore the cached value
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List saved reviews, newest first
    List {
        /// Only reviews of this pull request
        #[arg(long)]
        pr: Option<u64>,

        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,

        /// Include reviews of other repositories
        #[arg(long)]
        all_repos: bool,
    },

    /// Show the review chain of a pull request, oldest first
    Chain {
        pr: u64,

        /// Keep only the most recent N reviews
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete one saved review
    Delete { id: String },

    /// Delete saved reviews of this repository
    Clear {
        /// Delete reviews of every repository
        #[arg(long)]
        all: bool,
    },
}
