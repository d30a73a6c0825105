//! bobbin - run the claim-and-advance engine against a SQLite database.
//!
//! ```text
//! bobbin enqueue --item-type archive.result.v1 --payload '{"cmd":"echo hi"}'
//! bobbin orchestrate --exit-on-idle
//! bobbin status
//! ```

mod machines;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bobbin_core::app::{Engine, EngineConfig, Services};
use bobbin_core::domain::{ActorError, ItemType, OrchestratorError};
use bobbin_core::impls::{InProcessLauncher, SubprocessLauncher};
use bobbin_core::ports::ActorLauncher;
use bobbin_core::queue::{ClaimOrder, SqliteClaimStore};
use bobbin_core::EngineBuilder;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bobbin", version, about = "Claim-and-advance work item engine")]
struct Cli {
    /// SQLite database shared by the orchestrator and every actor
    #[arg(long, env = "BOBBIN_DB", default_value = "bobbin.db", global = true)]
    db: PathBuf,

    /// JSON engine config; missing fields use defaults
    #[arg(long, env = "BOBBIN_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scale actors up as work arrives
    Orchestrate {
        /// Exit once every queue is idle and no future work is scheduled
        #[arg(long)]
        exit_on_idle: bool,

        /// Run actors as tasks in this process instead of subprocesses
        #[arg(long)]
        in_process: bool,
    },

    /// Claim and tick items of one type until idle
    Actor {
        #[arg(long)]
        item_type: String,

        /// Per-type override, `key=value` (atomic, claim_from_top_n, claim_order, max_tick_time_secs)
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },

    /// Create new work items in their initial state
    Enqueue {
        #[arg(long)]
        item_type: String,

        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Show pending / active / stalled / finished counts per type
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn apply_override(config: &mut EngineConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "atomic" => config.atomic_claims = value.parse().context("atomic must be true/false")?,
        "claim_from_top_n" => {
            config.claim_from_top_n = value.parse().context("claim_from_top_n must be a number")?
        }
        "max_tick_time_secs" => {
            config.max_tick_time_secs = value.parse().context("max_tick_time_secs must be a number")?
        }
        "claim_order" => {
            config.claim_order = serde_json::from_value::<ClaimOrder>(serde_json::Value::String(
                value.to_string(),
            ))
            .with_context(|| format!("unknown claim_order '{value}'"))?
        }
        other => warn!(key = other, value, "ignoring unknown actor argument"),
    }
    Ok(())
}

fn build_engine(db: &Path, config: EngineConfig) -> Result<Engine> {
    let store = SqliteClaimStore::open(db)
        .with_context(|| format!("opening database {}", db.display()))?;
    let builder = machines::register_all(EngineBuilder::new(config))?;
    let engine = builder
        .expect_types(&[machines::SNAPSHOT, machines::RESULT])
        .build(Services::new(Arc::new(store)))?;
    Ok(engine)
}

/// Ctrl-C flips the returned receiver to `true`.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
        tx.send_replace(true);
    });
    rx
}

async fn orchestrate(cli: &Cli, mut config: EngineConfig, exit_on_idle: bool, in_process: bool) -> Result<()> {
    config.exit_on_idle |= exit_on_idle;
    let engine = build_engine(&cli.db, config)?;

    let launcher: Arc<dyn ActorLauncher> = if in_process {
        Arc::new(InProcessLauncher::new(
            engine.registry().clone(),
            engine.services().clone(),
            engine.poll_settings(),
        ))
    } else {
        let mut launcher = SubprocessLauncher::current_exe()?
            .arg("--db")
            .arg(cli.db.display().to_string());
        if let Some(path) = &cli.config {
            launcher = launcher.arg("--config").arg(path.display().to_string());
        }
        Arc::new(launcher)
    };

    let mut orchestrator = engine.orchestrator(launcher);
    match orchestrator.run(shutdown_on_ctrl_c()).await {
        Ok(()) | Err(OrchestratorError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn actor(cli: &Cli, mut config: EngineConfig, item_type: &str, args: &[(String, String)]) -> Result<()> {
    for (key, value) in args {
        apply_override(&mut config, key, value)?;
    }
    let engine = build_engine(&cli.db, config)?;
    let mut actor = engine.actor(&ItemType::new(item_type))?;

    match actor.run(shutdown_on_ctrl_c()).await {
        Ok(report) => {
            info!(ticked = report.ticked, failed = report.failed, "actor finished");
            Ok(())
        }
        Err(ActorError::Cancelled) => Ok(()),
    }
}

async fn enqueue(cli: &Cli, config: EngineConfig, item_type: &str, payload: &str, count: usize) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be valid JSON")?;
    if !payload.is_object() {
        bail!("--payload must be a JSON object");
    }
    let engine = build_engine(&cli.db, config)?;
    let item_type = ItemType::new(item_type);
    for _ in 0..count {
        let item = engine.create_item(&item_type, payload.clone()).await?;
        println!("{}", item.id);
    }
    Ok(())
}

async fn status(cli: &Cli, config: EngineConfig, json: bool) -> Result<()> {
    let engine = build_engine(&cli.db, config)?;
    let report = engine.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{:<24} {:>8} {:>8} {:>8} {:>8}",
        "ITEM TYPE", "PENDING", "ACTIVE", "STALLED", "FINISHED"
    );
    for t in &report.types {
        println!(
            "{:<24} {:>8} {:>8} {:>8} {:>8}",
            t.item_type.as_str(),
            t.counts.pending,
            t.counts.active,
            t.counts.stalled,
            t.counts.finished
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Orchestrate {
            exit_on_idle,
            in_process,
        } => orchestrate(&cli, config, *exit_on_idle, *in_process).await,
        Command::Actor { item_type, args } => actor(&cli, config, item_type, args).await,
        Command::Enqueue {
            item_type,
            payload,
            count,
        } => enqueue(&cli, config, item_type, payload, *count).await,
        Command::Status { json } => status(&cli, config, *json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("atomic=false", ("atomic", "false"))]
    #[case("claim_order = random", ("claim_order", "random"))]
    #[case("k=a=b", ("k", "a=b"))]
    fn parses_key_value_args(#[case] raw: &str, #[case] expected: (&str, &str)) {
        let (k, v) = parse_key_value(raw).unwrap();
        assert_eq!((k.as_str(), v.as_str()), expected);
    }

    #[rstest]
    #[case("novalue")]
    #[case("=x")]
    fn rejects_malformed_args(#[case] raw: &str) {
        assert!(parse_key_value(raw).is_err());
    }

    #[test]
    fn overrides_apply_to_config() {
        let mut config = EngineConfig::default();
        apply_override(&mut config, "atomic", "false").unwrap();
        apply_override(&mut config, "claim_order", "newest_first").unwrap();
        apply_override(&mut config, "claim_from_top_n", "5").unwrap();

        assert!(!config.atomic_claims);
        assert_eq!(config.claim_order, ClaimOrder::NewestFirst);
        assert_eq!(config.claim_from_top_n, 5);
        assert!(apply_override(&mut config, "atomic", "maybe").is_err());
    }

    #[test]
    fn cli_parses_global_db_after_subcommand() {
        let cli = Cli::try_parse_from([
            "bobbin",
            "actor",
            "--item-type",
            "archive.snapshot.v1",
            "--db",
            "/tmp/x.db",
            "--arg",
            "atomic=false",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        assert!(matches!(cli.command, Command::Actor { ref args, .. } if args.len() == 1));
    }
}
