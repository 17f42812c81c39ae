//! Tollgate CLI entry point.
//!
//! One-shot subcommands over the persistent kernel state: inspect the tool
//! registry and sessions, submit a proposal, read and verify the ledger, and
//! manage replay records. Every command prints JSON on stdout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use tollgate::config::TollgateConfig;
use tollgate::kernel::{Dispatch, Kernel, KernelSettings, ProposedAction, ReplayMode, ToolOutcome};
use tollgate::logging::{self, LoggingGuard};
use tollgate::store::sqlite::SqliteStore;
use tollgate::store::Backends;
use tollgate::tools::ToolRegistry;

/// Tollgate: authorization kernel for agent tool calls.
#[derive(Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Also write JSON logs to the configured logs directory.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// List the tool registry.
    Tools,
    /// Describe a session.
    World {
        /// Session id.
        #[arg(long)]
        session: String,
    },
    /// Submit one proposed action and print the dispatch.
    Invoke {
        /// Session id; a fresh one is generated when omitted.
        #[arg(long)]
        session: Option<String>,
        /// Tool name.
        #[arg(long)]
        tool: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Grant a tool before proposing. Repeatable.
        #[arg(long = "grant")]
        grants: Vec<String>,
        /// Enable the high-risk capability before proposing.
        #[arg(long)]
        enable_capability: bool,
        /// Byte estimate charged against the tool's byte budget.
        #[arg(long)]
        byte_estimate: Option<u64>,
        /// Outcome of the execution as a JSON object (`{"ok", "summary", "data"}`).
        /// Reported back when the proposal is allowed for live execution.
        #[arg(long)]
        outcome: Option<String>,
    },
    /// Ledger operations.
    Ledger {
        /// Ledger subcommand.
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Replay store operations.
    Replay {
        /// Replay subcommand.
        #[command(subcommand)]
        command: ReplayCommand,
    },
    /// List catalogued sessions, newest first.
    Sessions {
        /// Maximum number of sessions.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Ledger subcommands.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Print ledger entries.
    Show {
        /// Session id.
        #[arg(long)]
        session: String,
        /// First index to print.
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Stop before this index.
        #[arg(long)]
        to: Option<u64>,
    },
    /// Verify the hash chain. Exits non-zero when it does not verify.
    Verify {
        /// Session id.
        #[arg(long)]
        session: String,
    },
}

/// Replay subcommands.
#[derive(Subcommand)]
enum ReplayCommand {
    /// Show or set the replay mode.
    Mode {
        /// Session id.
        #[arg(long)]
        session: String,
        /// New mode: off, record or replay.
        mode: Option<String>,
    },
    /// Print records as newline-delimited JSON.
    Export {
        /// Session id.
        #[arg(long)]
        session: String,
    },
    /// Import records from a newline-delimited JSON file.
    Import {
        /// Session id.
        #[arg(long)]
        session: String,
        /// Input file.
        file: PathBuf,
    },
    /// Remove all records.
    Clear {
        /// Session id.
        #[arg(long)]
        session: String,
    },
    /// Print records with their count.
    Data {
        /// Session id.
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = TollgateConfig::load().context("failed to load configuration")?;
    let _logging_guard = init_logging(&config, cli.json_logs)?;

    let registry = Arc::new(
        ToolRegistry::builtin()
            .with_capability_tool(&config.kernel.capability_tool)
            .with_overrides(&config.tools),
    );

    if let Command::Tools = cli.command {
        let tools: Vec<_> = registry.iter().collect();
        return print_json(&tools);
    }

    let kernel = open_kernel(&config, registry).await?;
    match cli.command {
        Command::Tools => Ok(()),
        Command::World { session } => print_json(&kernel.world(&session).await?),
        Command::Invoke {
            session,
            tool,
            args,
            grants,
            enable_capability,
            byte_estimate,
            outcome,
        } => {
            handle_invoke(
                &kernel,
                InvokeArgs {
                    session,
                    tool,
                    args,
                    grants,
                    enable_capability,
                    byte_estimate,
                    outcome,
                },
            )
            .await
        }
        Command::Ledger { command } => handle_ledger(&kernel, command).await,
        Command::Replay { command } => handle_replay(&kernel, command).await,
        Command::Sessions { limit } => print_json(&kernel.list_sessions(limit).await?),
    }
}

fn init_logging(config: &TollgateConfig, json_logs: bool) -> anyhow::Result<Option<LoggingGuard>> {
    if json_logs {
        let logs_dir = config.paths.logs_dir()?;
        let guard = logging::init_production(&logs_dir, &config.kernel.log_level)?;
        Ok(Some(guard))
    } else {
        logging::init_cli(&config.kernel.log_level);
        Ok(None)
    }
}

async fn open_kernel(config: &TollgateConfig, registry: Arc<ToolRegistry>) -> anyhow::Result<Kernel> {
    let db_path = config.paths.database()?;
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    debug!(path = %db_path.display(), "database opened");
    let backends = Backends::from_store(Arc::new(store), db_path.display().to_string());
    Ok(Kernel::new(registry, backends, KernelSettings::from_config(config)))
}

struct InvokeArgs {
    session: Option<String>,
    tool: String,
    args: String,
    grants: Vec<String>,
    enable_capability: bool,
    byte_estimate: Option<u64>,
    outcome: Option<String>,
}

/// Printed by `invoke`: the session used plus the dispatch.
#[derive(Serialize)]
struct InvokeReport {
    session_id: String,
    #[serde(flatten)]
    dispatch: Dispatch,
    completed: bool,
}

async fn handle_invoke(kernel: &Kernel, invoke: InvokeArgs) -> anyhow::Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(&invoke.args).context("--args is not valid JSON")?;
    let outcome: Option<ToolOutcome> = invoke
        .outcome
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--outcome is not a valid outcome object")?;

    let session = kernel.open_session(invoke.session.as_deref()).await?;
    let session_id = session.id().to_string();
    for tool in &invoke.grants {
        kernel.grant(&session_id, tool).await?;
    }
    if invoke.enable_capability {
        kernel.set_capability_enabled(&session_id, true).await?;
    }

    let mut action = ProposedAction::new(invoke.tool, arguments);
    if let Some(bytes) = invoke.byte_estimate {
        action = action.with_byte_estimate(bytes);
    }

    let dispatch = kernel.propose(&session_id, action).await?;
    let dispatch = match (dispatch, outcome) {
        (Dispatch::Execute { decision, ticket }, Some(outcome)) => {
            let ledger_idx = ticket.ledger_idx;
            kernel.complete(ticket, outcome).await?;
            info!(session = %session_id, ledger_idx, "execution outcome reported");
            return print_json(&serde_json::json!({
                "session_id": session_id,
                "dispatch": "execute",
                "decision": decision,
                "ledger_idx": ledger_idx,
                "completed": true,
            }));
        }
        (dispatch, _) => dispatch,
    };
    print_json(&InvokeReport {
        session_id,
        dispatch,
        completed: false,
    })
}

async fn handle_ledger(kernel: &Kernel, command: LedgerCommand) -> anyhow::Result<()> {
    match command {
        LedgerCommand::Show { session, from, to } => {
            let view = match to {
                Some(to) => kernel.ledger(&session, from..to).await?,
                None => kernel.ledger(&session, from..).await?,
            };
            let entries: Vec<_> = view.map(|entry| entry.as_ref().clone()).collect();
            print_json(&entries)
        }
        LedgerCommand::Verify { session } => {
            let report = kernel.verify_report(&session).await?;
            print_json(&report)?;
            if report.ok {
                Ok(())
            } else {
                anyhow::bail!("ledger for session {session} failed verification")
            }
        }
    }
}

async fn handle_replay(kernel: &Kernel, command: ReplayCommand) -> anyhow::Result<()> {
    match command {
        ReplayCommand::Mode { session, mode } => {
            let mode = match mode {
                Some(label) => {
                    let mode: ReplayMode = label.parse()?;
                    kernel.set_replay_mode(&session, mode).await?
                }
                None => kernel.replay_mode(&session).await?,
            };
            print_json(&serde_json::json!({ "session_id": session, "mode": mode }))
        }
        ReplayCommand::Export { session } => {
            print!("{}", kernel.export_replay_jsonl(&session).await?);
            Ok(())
        }
        ReplayCommand::Import { session, file } => {
            let text = read_input(&file)?;
            print_json(&kernel.import_replay_jsonl(&session, &text).await?)
        }
        ReplayCommand::Clear { session } => {
            let removed = kernel.clear_replay(&session).await?;
            print_json(&serde_json::json!({ "session_id": session, "removed": removed }))
        }
        ReplayCommand::Data { session } => print_json(&kernel.replay_data(&session).await?),
    }
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
