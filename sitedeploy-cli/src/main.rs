//! `sitedeploy` command-line runner.

mod cli;

use anyhow::{bail, Context};
use cli::{CliArgs, Command};
use serde::Deserialize;
use sitedeploy::config::DeployConfig;
use sitedeploy::notify::{LoggingSubscriber, Notifier};
use sitedeploy::observability::init_logging;
use sitedeploy::orchestrator::{Orchestrator, OrchestratorConfig};
use sitedeploy::stages::{CommandGenerateStage, ContentSyncStage, GitSourceRepository};
use sitedeploy::store::{DirectoryContentStore, FsArtifactStore};
use sitedeploy::utils::{now_utc, Timestamp};
use sitedeploy::watcher::{SourceWatcher, WatchOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("sitedeploy error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    match args.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run { repo, out, gc_interval } => run(config, repo, out, Duration::from_secs(gc_interval)).await,
    }
}

fn load_config(args: &CliArgs) -> anyhow::Result<DeployConfig> {
    let mut config = if args.config.exists() {
        DeployConfig::load_from_path(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        DeployConfig::default()
    };
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

/// One line of stdin.
#[derive(Debug, Deserialize)]
struct ChangeLine {
    branch: String,
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    timestamp: Option<Timestamp>,
    #[serde(default)]
    deleted: bool,
}

fn build_notifier(config: &DeployConfig) -> anyhow::Result<Arc<Notifier>> {
    let notifier = Arc::new(Notifier::new());
    if config.notify.log_events {
        notifier.subscribe(Arc::new(LoggingSubscriber::new(Level::INFO)));
    }
    #[cfg(feature = "webhook")]
    for url in &config.notify.webhooks {
        let webhook = sitedeploy::notify::WebhookSubscriber::new(url.as_str())?;
        notifier.subscribe(Arc::new(webhook));
    }
    #[cfg(not(feature = "webhook"))]
    if !config.notify.webhooks.is_empty() {
        warn!(count = config.notify.webhooks.len(), "Webhook support not compiled in; ignoring webhooks");
    }
    Ok(notifier)
}

async fn run(config: DeployConfig, repo: PathBuf, out: PathBuf, gc_interval: Duration) -> anyhow::Result<()> {
    if !repo.join(".git").exists() && !repo.join("HEAD").exists() {
        bail!("{} is not a git repository", repo.display());
    }

    let notifier = build_notifier(&config)?;
    let artifacts = Arc::new(
        FsArtifactStore::open(out.join("artifacts"))
            .await
            .context("failed to open artifact store")?,
    );
    let generate = Arc::new(CommandGenerateStage::new(
        Arc::new(GitSourceRepository::new(&repo)),
        config.generator.clone(),
    ));
    let sync = Arc::new(
        ContentSyncStage::new(Arc::new(DirectoryContentStore::new(out.join("site"))), config.sync.target.clone())
            .with_rules(config.sync.cache_rules.clone())
            .with_delete_removed(config.sync.delete_removed),
    );

    let (watcher, triggers) = SourceWatcher::new(&config.watch, notifier.clone())?;
    let orchestrator = Orchestrator::new(OrchestratorConfig::from(&config), generate, sync, artifacts, notifier.clone());
    let intake = orchestrator.spawn_intake(triggers);
    let maintenance = spawn_maintenance(orchestrator.clone(), gc_interval);

    info!(repo = %repo.display(), out = %out.display(), "Waiting for change notifications on stdin");
    read_changes(&watcher).await?;

    maintenance.abort();
    drop(watcher);
    if let Err(e) = intake.await {
        warn!(error = %e, "Intake task ended abnormally");
    }
    orchestrator.shutdown().await;
    maintain(&orchestrator).await;
    notifier.close().await;

    print_summary(&orchestrator)?;
    Ok(())
}

async fn read_changes(watcher: &SourceWatcher) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let change: ChangeLine = match serde_json::from_str(line) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, line = line, "Skipping malformed change line");
                continue;
            }
        };
        let timestamp = change.timestamp.unwrap_or_else(now_utc);

        if change.deleted {
            if !watcher.on_branch_deleted(&change.branch, timestamp) {
                warn!(branch = %change.branch, "Deletion of unknown or untracked branch ignored");
            }
            continue;
        }
        let Some(commit) = change.commit else {
            warn!(branch = %change.branch, "Change line has neither a commit nor a deletion");
            continue;
        };
        match watcher.on_change(&change.branch, &commit, timestamp)? {
            WatchOutcome::Accepted(trigger) => info!(branch = %change.branch, commit = %commit, sequence = trigger.sequence, "Queued"),
            WatchOutcome::Rejected(reason) => warn!(branch = %change.branch, "{reason}"),
            WatchOutcome::Duplicate | WatchOutcome::Stale => {}
        }
    }
    Ok(())
}

fn spawn_maintenance(orchestrator: Orchestrator, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            maintain(&orchestrator).await;
        }
    })
}

async fn maintain(orchestrator: &Orchestrator) {
    orchestrator.apply_retention();
    if let Err(e) = orchestrator.collect_garbage().await {
        warn!(error = %e, "Garbage collection failed");
    }
}

/// Prints every retained run as one JSON line on stdout.
fn print_summary(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    for branch in orchestrator.branches() {
        for run in orchestrator.runs_for_branch(&branch) {
            println!("{}", serde_json::to_string(&run)?);
        }
    }
    Ok(())
}
