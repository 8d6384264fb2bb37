//! mcp-sync - keep the MCP server catalog in step with its external sources

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mcp_sync::App;
use mcp_sync::config::{EnvOverrides, Settings, load_user_config, resolve_home};
use mcp_sync::logging::init_tracing;
use mcp_sync::model::{CatalogEntry, Scope};
use mcp_sync::monitor::{BackgroundMonitor, MonitorStatus, read_state_file};
use mcp_sync::ops::NewServer;
use mcp_sync::reconcile::{ReconcilePolicy, ReconciliationResult};

#[derive(Parser)]
#[command(name = "mcp-sync")]
#[command(about = "Reconcile MCP servers across the assistant and the container runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Sync {
        /// Detect changes without writing the catalog
        #[arg(long)]
        dry_run: bool,

        /// Do not add container-side servers to the assistant
        #[arg(long)]
        no_propagate: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Background monitoring
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },

    /// List catalog entries (orphaned entries are hidden unless --all)
    List {
        #[arg(long)]
        all: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a server by hand: mcp-sync add NAME -- COMMAND [ARGS...]
    Add {
        name: String,

        /// Environment variable for the server (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Scope inside the assistant (user, project)
        #[arg(long)]
        scope: Option<Scope>,

        /// Only record in the catalog
        #[arg(long)]
        no_propagate: bool,

        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Withdraw a server; hand-added entries are deleted, others kept disabled
    Remove { name: String },

    /// Re-enable a server in its source
    Enable { name: String },

    /// Disable a server in its source
    Disable { name: String },

    /// Delete orphaned catalog entries
    Compact,
}

#[derive(Subcommand)]
enum MonitorAction {
    /// Run in the foreground until Ctrl-C
    Run {
        /// Seconds between passes
        #[arg(long)]
        interval: Option<u64>,

        /// Apply detected changes instead of only reporting them
        #[arg(long)]
        auto_apply: bool,
    },

    /// Show the state written by a running monitor
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if k.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((k.to_string(), v.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let home = resolve_home();
    let user_cfg = load_user_config(&home)?;
    init_tracing(&home, user_cfg.as_ref().and_then(|c| c.logging.as_ref()));
    let settings = Settings::resolve(home, user_cfg.as_ref(), &EnvOverrides::from_env())?;
    tracing::debug!("mcp_sync_home={}", settings.home.display());

    let app = App::new(&settings);
    match cli.command {
        Commands::Sync {
            dry_run,
            no_propagate,
            json,
        } => {
            let policy = ReconcilePolicy {
                auto_apply: !dry_run,
                propagate: settings.propagate && !no_propagate,
            };
            let result = app.engine.reconcile(policy).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            if !result.failed.is_empty() {
                anyhow::bail!("{} change(s) could not be applied", result.failed.len());
            }
        }
        Commands::Monitor {
            action: MonitorAction::Run {
                interval,
                auto_apply,
            },
        } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.monitor_interval);
            let monitor = BackgroundMonitor::new(app.engine.clone())
                .with_grace(settings.monitor_grace)
                .with_propagation(settings.propagate)
                .with_state_file(settings.state_file.clone());
            monitor.start(interval, auto_apply || settings.monitor_auto_apply)?;
            eprintln!("monitoring every {}s; Ctrl-C to stop", interval.as_secs());
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            let status = monitor.stop().await?;
            print_status(&status);
        }
        Commands::Monitor {
            action: MonitorAction::Status { json },
        } => match read_state_file(&settings.state_file)? {
            Some(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
            Some(status) => print_status(&status),
            None => println!("no monitor state at {}", settings.state_file.display()),
        },
        Commands::List { all, json } => {
            let entries = app.catalog.read().await?;
            let shown: Vec<&CatalogEntry> =
                entries.values().filter(|e| all || !e.is_orphaned()).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else if shown.is_empty() {
                println!("catalog is empty");
            } else {
                for e in shown {
                    println!(
                        "{:<24} {:<9} {:<18} {} {}",
                        e.name,
                        e.status.to_string(),
                        e.source.to_string(),
                        e.command,
                        e.args.join(" ")
                    );
                }
            }
        }
        Commands::Add {
            name,
            env,
            scope,
            no_propagate,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .context("missing command after --")?;
            let server = NewServer {
                name,
                command: program.clone(),
                args: args.to_vec(),
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                scope,
            };
            let entry = app
                .ops
                .add(server, settings.propagate && !no_propagate)
                .await?;
            println!("added {}", entry.name);
        }
        Commands::Remove { name } => match app.ops.remove(&name).await? {
            Some(entry) => println!("removed {} (kept as {})", entry.name, entry.status),
            None => println!("removed {name}"),
        },
        Commands::Enable { name } => {
            let entry = app.ops.enable(&name).await?;
            println!("enabled {}", entry.name);
        }
        Commands::Disable { name } => {
            let entry = app.ops.disable(&name).await?;
            println!("disabled {}", entry.name);
        }
        Commands::Compact => {
            let removed = app.ops.compact().await?;
            if removed.is_empty() {
                println!("no orphaned entries");
            } else {
                println!("removed {}", removed.join(", "));
            }
        }
    }
    Ok(())
}

fn print_result(result: &ReconciliationResult) {
    if let Some(reason) = result.skipped_reason {
        println!("skipped: {reason}");
        return;
    }
    for source in &result.skipped_sources {
        println!("warning: {source} could not be read; its entries were left alone");
    }
    for event in &result.applied {
        println!("applied  {event}");
    }
    for event in &result.pending {
        println!("pending  {event}");
    }
    for failure in &result.failed {
        println!("failed   {} [{:?}]: {}", failure.event, failure.stage, failure.reason);
    }
    for name in &result.propagated {
        println!("propagated {name} to the assistant");
    }
    if result.applied.is_empty() && result.pending.is_empty() && result.failed.is_empty() {
        println!("no changes");
    }
}

fn print_status(status: &MonitorStatus) {
    println!("state:    {}", status.state);
    if let Some(secs) = status.interval_secs {
        println!("interval: {secs}s (auto-apply: {})", status.auto_apply);
    }
    if let Some(at) = status.last_tick_at {
        println!("last tick: {}", at.to_rfc3339());
    }
    println!(
        "ticks: {}  detected: {}  applied: {}  errors: {}  abandoned: {}",
        status.ticks,
        status.changes_detected,
        status.changes_applied,
        status.errors,
        status.abandoned_ticks
    );
    if let Some(last) = &status.last_result {
        match (&last.error, last.skipped_reason) {
            (Some(err), _) => println!("last result: error: {err}"),
            (None, Some(reason)) => println!("last result: skipped ({reason})"),
            (None, None) => println!(
                "last result: {} applied, {} pending, {} failed",
                last.applied, last.pending, last.failed
            ),
        }
    }
    for event in status.recent_changes.iter().rev().take(10) {
        println!("  {} {event}", event.detected_at.to_rfc3339());
    }
}
