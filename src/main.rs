use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use revq::agent::ClaudeAgent;
use revq::cli::{Cli, CliCommand, HistoryCommand};
use revq::config::Config;
use revq::dispatcher::{Dispatcher, EnqueueRequest, QueueStatus};
use revq::error::{Error, Result};
use revq::forge::{Forge, GhForge};
use revq::history::{HistoryFilter, HistoryStore, REVIEW_HISTORY_KEY, VALIDATION_HISTORY_KEY};
use revq::jobs::{JobRunner, PriorReview, ReviewJob, ValidationJob};
use revq::prompts::PromptEngine;
use revq::reporter::{StderrReporter, follow};
use revq::review_schema::{ReviewResult, ValidationResult};
use revq::status::{CliStatusProbe, StatusCache};
use revq::store::{JsonFileStore, KvStore};

const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("revq=info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_FAILED);
        }
    };

    debug!(?config, "config loaded");

    match run(cli.command, config).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_FAILED);
        }
    }
}

async fn run(command: CliCommand, config: Config) -> Result<i32> {
    match command {
        CliCommand::Review {
            prs,
            re_review,
            since,
        } => {
            let prior = match since {
                Some(id) => PriorReview::Id(id),
                None if re_review => PriorReview::Latest,
                None => PriorReview::None,
            };
            review(&config, prs, prior).await
        }
        CliCommand::Validate { issues } => validate(&config, issues).await,
        CliCommand::History { command } => history(&config, command).await,
        CliCommand::Status { refresh } => status(&config, refresh).await,
    }
}

fn store(config: &Config) -> Arc<dyn KvStore> {
    Arc::new(JsonFileStore::new(&config.history_dir))
}

fn agent(config: &Config) -> Arc<ClaudeAgent> {
    Arc::new(ClaudeAgent::new(
        config.agent_binary.clone(),
        config.agent_model.clone(),
        config.agent_max_turns,
    ))
}

async fn review(config: &Config, prs: Vec<u64>, prior: PriorReview) -> Result<i32> {
    let history = Arc::new(HistoryStore::<ReviewResult>::new(
        store(config),
        REVIEW_HISTORY_KEY,
        config.history_cap,
    ));
    let job = ReviewJob::new(
        Arc::new(GhForge::new(config.forge_timeout())),
        agent(config),
        history,
        Arc::new(PromptEngine::new(config.prompt_dir.clone())),
        config.review_settings(),
    );
    let requests = unique(prs)
        .into_iter()
        .map(|n| EnqueueRequest::new(n, &config.repo_root).with_prior(prior.clone()))
        .collect();
    run_queue(Dispatcher::spawn(job), requests).await
}

async fn validate(config: &Config, issues: Vec<u64>) -> Result<i32> {
    let history = Arc::new(HistoryStore::<ValidationResult>::new(
        store(config),
        VALIDATION_HISTORY_KEY,
        config.history_cap,
    ));
    let job = ValidationJob::new(
        Arc::new(GhForge::new(config.forge_timeout())),
        agent(config),
        history,
        Arc::new(PromptEngine::new(config.prompt_dir.clone())),
    );
    let requests = unique(issues)
        .into_iter()
        .map(|n| EnqueueRequest::new(n, &config.repo_root))
        .collect();
    run_queue(Dispatcher::spawn(job), requests).await
}

fn unique(numbers: Vec<u64>) -> Vec<u64> {
    let mut seen = Vec::with_capacity(numbers.len());
    for n in numbers {
        if !seen.contains(&n) {
            seen.push(n);
        }
    }
    seen
}

/// Enqueue every request, stream progress to stderr, print results to stdout.
async fn run_queue<J: JobRunner>(dispatcher: Dispatcher<J>, requests: Vec<EnqueueRequest>) -> Result<i32> {
    let mut events = dispatcher.subscribe();
    let numbers: Vec<u64> = requests.iter().map(|r| r.entity_number).collect();
    for request in requests {
        dispatcher.enqueue_request(request).await?;
    }

    let followed = follow(&dispatcher, &mut events, &numbers, &StderrReporter);
    tokio::pin!(followed);
    let items = tokio::select! {
        items = &mut followed => items?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[revq] interrupted, cancelling {} job(s)", dispatcher.kind());
            for n in &numbers {
                if let Err(e) = dispatcher.cancel(*n).await {
                    warn!(entity = n, error = %e, "cancel failed");
                }
            }
            followed.await?
        }
    };

    let mut code = 0;
    for item in &items {
        match item.status {
            QueueStatus::Completed => {
                if let Some(ref result) = item.result {
                    print_json(result)?;
                }
            }
            QueueStatus::Cancelled => {
                report_unfinished(dispatcher.kind(), item.entity_number, "cancelled", item.error.as_deref());
                code = EXIT_CANCELLED;
            }
            status => {
                report_unfinished(dispatcher.kind(), item.entity_number, &status.to_string(), item.error.as_deref());
                if code == 0 {
                    code = EXIT_FAILED;
                }
            }
        }
    }
    info!(
        queue = dispatcher.kind(),
        total = items.len(),
        completed = items.iter().filter(|i| i.status == QueueStatus::Completed).count(),
        "queue drained"
    );
    Ok(code)
}

fn report_unfinished(queue: &str, entity_number: u64, status: &str, error: Option<&str>) {
    match error {
        Some(error) => eprintln!("[revq] {queue} #{entity_number} {status}: {error}"),
        None => eprintln!("[revq] {queue} #{entity_number} {status}"),
    }
}

async fn history(config: &Config, command: HistoryCommand) -> Result<i32> {
    let history = HistoryStore::<ReviewResult>::new(store(config), REVIEW_HISTORY_KEY, config.history_cap);
    let forge = GhForge::new(config.forge_timeout());
    let repository = || async { forge.get_repo_info(&config.repo_root).await.map(|r| r.full_name) };

    match command {
        HistoryCommand::List { pr, limit, all_repos } => {
            let filter = HistoryFilter {
                repository: if all_repos { None } else { Some(repository().await?) },
                entity_number: pr,
                limit,
            };
            print_json(&history.list(&filter)?)?;
        }
        HistoryCommand::Chain { pr, limit } => {
            let chain = history.get_chain(&repository().await?, pr, limit.unwrap_or(usize::MAX))?;
            print_json(&chain)?;
        }
        HistoryCommand::Delete { id } => {
            if !history.delete(&id)? {
                return Err(Error::History(format!("no saved review with id {id}")));
            }
            eprintln!("[revq] deleted review {id}");
        }
        HistoryCommand::Clear { all } => {
            let repo = if all { None } else { Some(repository().await?) };
            let removed = history.clear(repo.as_deref())?;
            eprintln!("[revq] cleared {removed} review(s)");
        }
    }
    Ok(0)
}

async fn status(config: &Config, refresh: bool) -> Result<i32> {
    let cache = StatusCache::new(
        CliStatusProbe::new(&config.agent_binary, config.probe_timeout(), &config.repo_root),
        store(config),
        config.status_ttl(),
    );
    if refresh {
        cache.clear_cache()?;
    }
    let status = cache.get_status().await?;
    print_json(&status)?;
    Ok(if status.installed { 0 } else { EXIT_FAILED })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Schema(format!("failed to serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}
