#![forbid(unsafe_code)]

//! `callwarden`: run and inspect coordinated external process calls.
//!
//! Loads configuration, opens the ledger database, starts the retention
//! service, and executes one subcommand. Prompts are read from stdin;
//! results go to stdout and logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use callwarden::orchestrator::coordinator::DEFAULT_CLASS;
use callwarden::orchestrator::{CallCoordinator, CallHooks, CallOutcome, CallRequest, CancelSignal};
use callwarden::persistence::{db, retention};
use callwarden::process::ProcessRunner;
use callwarden::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "callwarden", about = "Coordinated external process calls", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one call now; the prompt is read from stdin.
    Call {
        /// Ordering scope.
        #[arg(long)]
        scope: String,
        /// Idempotency key within the scope.
        #[arg(long)]
        key: String,
        /// Work class for the concurrency gate.
        #[arg(long, default_value = DEFAULT_CLASS)]
        class: String,
        /// Session account for resume and usage accounting.
        #[arg(long)]
        account: Option<String>,
        /// Print the outcome as JSON instead of the bare result text.
        #[arg(long)]
        json: bool,
    },
    /// Queue a call; the prompt is read from stdin.
    Enqueue {
        /// Ordering scope.
        #[arg(long)]
        scope: String,
        /// Idempotency key within the scope.
        #[arg(long)]
        key: String,
        /// Lower numbers run first.
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Claim and run the next queued call.
    RunNext {
        /// Restrict to one scope.
        #[arg(long)]
        scope: Option<String>,
        /// Work class for the concurrency gate.
        #[arg(long, default_value = DEFAULT_CLASS)]
        class: String,
        /// Print the outcome as JSON instead of the bare result text.
        #[arg(long)]
        json: bool,
    },
    /// Fail items of a scope stuck in `running` past the stale threshold.
    Recover {
        /// Scope to sweep.
        #[arg(long)]
        scope: String,
    },
    /// Reset a completed or failed item to `queued`.
    Retry {
        /// Work item id.
        item_id: String,
    },
    /// Print the event log of a scope as JSON lines.
    Events {
        /// Scope to list.
        #[arg(long)]
        scope: String,
    },
    /// Close a session account.
    CloseAccount {
        /// Account id.
        account_id: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");

    // ── Start retention service ──────────────────────────
    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), config.retention_days, ct.clone());

    // ── Cancel in-flight calls on ctrl-c / SIGTERM ───────
    let cancel = CancelSignal::from_token(ct.child_token());
    let signal_cancel = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received, cancelling");
        signal_cancel.cancel();
    });

    let runner = Arc::new(ProcessRunner::new(config.process.clone()));
    let coordinator = CallCoordinator::new(&config, Arc::clone(&db), runner);

    let outcome = execute(&coordinator, args.command, &cancel).await;

    ct.cancel();
    signal_handle.abort();
    if let Err(err) = retention_handle.await {
        warn!(%err, "retention task ended abnormally");
    }
    db.close().await;

    outcome
}

async fn execute(
    coordinator: &CallCoordinator,
    command: Command,
    cancel: &CancelSignal,
) -> Result<()> {
    let hooks = CallHooks::default();

    match command {
        Command::Call {
            scope,
            key,
            class,
            account,
            json,
        } => {
            let prompt = read_prompt().await?;
            let mut request = CallRequest::new(scope, key, prompt).with_class(class);
            if let Some(account) = account {
                request = request.with_account(account);
            }
            let outcome = coordinator.call(&request, &hooks, cancel).await?;
            print_outcome(&outcome, json)?;
        }
        Command::Enqueue {
            scope,
            key,
            priority,
        } => {
            let prompt = read_prompt().await?;
            let item_id = coordinator
                .enqueue(&CallRequest::new(scope, key, prompt), priority)
                .await?;
            println!("{item_id}");
        }
        Command::RunNext { scope, class, json } => {
            match coordinator
                .run_next(scope.as_deref(), &class, &hooks, cancel)
                .await?
            {
                Some(outcome) => print_outcome(&outcome, json)?,
                None => info!("no queued work"),
            }
        }
        Command::Recover { scope } => {
            let recovered = coordinator
                .ledger()
                .recover_stale(&scope, coordinator.stale_threshold())
                .await?;
            println!("{recovered}");
        }
        Command::Retry { item_id } => {
            let ledger = coordinator.ledger();
            let reset = ledger.retry(&item_id).await?;
            if !reset {
                warn!(
                    item_id,
                    retry_ceiling = ledger.retry_ceiling(),
                    "not retried: item is unknown, not terminal, or at its retry ceiling"
                );
            }
            println!("{reset}");
        }
        Command::Events { scope } => {
            for event in coordinator.ledger().events(&scope).await? {
                let line = serde_json::to_string(&event)
                    .map_err(|err| AppError::Io(format!("failed to encode event: {err}")))?;
                println!("{line}");
            }
        }
        Command::CloseAccount { account_id } => {
            let closed = coordinator.accounts().close(&account_id).await?;
            println!("{closed}");
        }
    }

    Ok(())
}

async fn read_prompt() -> Result<String> {
    let mut prompt = String::new();
    tokio::io::stdin().read_to_string(&mut prompt).await?;
    if prompt.trim().is_empty() {
        return Err(AppError::Config("empty prompt on stdin".into()));
    }
    Ok(prompt)
}

fn print_outcome(outcome: &CallOutcome, json: bool) -> Result<()> {
    if !json {
        println!("{}", outcome.text);
        return Ok(());
    }

    let value = serde_json::json!({
        "item_id": outcome.item_id,
        "text": outcome.text,
        "usage": outcome.usage,
        "continuation_token": outcome.continuation_token,
        "duration_ms": outcome.duration_ms,
        "resumed": outcome.resumed,
        "fallback": outcome.fallback,
        "rolled_over": outcome.rolled_over,
        "truncated": outcome.truncated,
        "attempts": outcome.attempts,
        "retries": outcome.retries,
        "recorded": outcome.recorded,
    });
    println!("{value}");
    Ok(())
}

/// Initialize the tracing subscriber on stderr.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

/// Resolve on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}
