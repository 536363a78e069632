mod bundle;
mod dispatch;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use leadflow_core::config::{home_config_path, AppConfig};
use leadflow_core::event::EventBus;
use leadflow_core::traits::{FlowStore, MessageDispatcher};
use leadflow_core::types::*;
use leadflow_engine::{validate_sequence, FlowEngine, FlowRunner};
use leadflow_store::SqliteStore;

use crate::bundle::{pipeline_starting, Bundle};
use crate::dispatch::{DryRunDispatcher, WebhookDispatcher};

#[derive(Parser)]
#[command(name = "leadflow", version, about = "Lead follow-up sequence engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "leadflow.toml")]
    config: PathBuf,

    /// Log outbound messages instead of sending them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: fire timers and read inbound messages from stdin (JSON lines)
    Serve,
    /// Import sequences, pipelines and leads from a JSON bundle
    Import {
        /// Bundle file
        file: PathBuf,
    },
    /// Check stored sequences for configuration errors
    Validate {
        /// Only this sequence
        sequence: Option<String>,
    },
    /// Place a stored lead in its pipeline's entry stage
    Enroll { lead: String },
    /// Start a sequence for a lead, replacing its active cursor
    Assign { lead: String, sequence: String },
    /// Pause a cursor
    Pause { cursor: String },
    /// Resume a paused cursor
    Resume { cursor: String },
    /// Stop a cursor for good
    Stop { cursor: String },
    /// Move a lead to another stage
    Move { lead: String, stage: String },
    /// Deliver an inbound message from a contact
    Inbound {
        contact: String,
        /// Message text
        body: Vec<String>,
        /// Message time (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Fire every timer due now
    Tick,
    /// Show a cursor, or every cursor of a lead with --lead
    Status {
        id: String,
        #[arg(long)]
        lead: bool,
    },
    /// Show a cursor's activity log
    Log { cursor: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// One line of `serve` input.
#[derive(Deserialize)]
struct InboundLine {
    contact_id: ContactId,
    body: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("leadflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "leadflow", &mut std::io::stdout());
        return Ok(());
    }

    // Load config
    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        match home_config_path() {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading config from home directory");
                AppConfig::load(&path)?
            }
            _ => {
                eprintln!("Warning: No config file found, using defaults.");
                eprintln!("See leadflow.toml.example for reference.");
                AppConfig::default()
            }
        }
    };

    if let Some(Commands::Config) = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(SqliteStore::open(&config.store_path())?);

    let dispatcher: Arc<dyn MessageDispatcher> = match (&config.webhook, cli.dry_run) {
        (Some(webhook), false) => Arc::new(WebhookDispatcher::new(webhook.clone())?),
        (None, false) => {
            warn!("No [webhook] configured, outbound messages will only be logged");
            Arc::new(DryRunDispatcher)
        }
        (_, true) => Arc::new(DryRunDispatcher),
    };
    info!(dispatcher = dispatcher.name(), "Dispatcher ready");

    let event_bus = Arc::new(EventBus::default());
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        store.clone(),
        dispatcher,
        event_bus,
        &config,
    ));

    let now = Utc::now();
    match cli.command {
        Some(Commands::Serve) | None => serve(engine).await?,
        Some(Commands::Import { file }) => {
            let mut bundle = Bundle::load(&file)?;
            let summary = bundle.import(&store)?;
            println!(
                "Imported {} sequence(s), {} pipeline(s)",
                summary.sequences, summary.pipelines
            );

            let mut enrolled = 0;
            for spec in bundle.leads {
                let enroll = spec.enroll;
                let lead = spec.into_lead(now);
                if enroll {
                    engine.enroll_lead(&lead, now).await?;
                    enrolled += 1;
                } else if store.load_lead(&lead.id)?.is_none() {
                    store.save_lead(&lead)?;
                }
            }
            if enrolled > 0 {
                println!("Enrolled {enrolled} lead(s)");
            }
        }
        Some(Commands::Validate { sequence }) => {
            let sequences = store.list_sequences()?;
            let pipelines = store.list_pipelines()?;
            let mut failed = 0;
            for seq in sequences
                .iter()
                .filter(|s| sequence.as_deref().map_or(true, |id| s.id.as_str() == id))
            {
                let issues = validate_sequence(seq, pipeline_starting(&pipelines, &seq.id));
                if issues.is_empty() {
                    println!("{}: ok", seq.id);
                } else {
                    failed += 1;
                    println!("{}: {} issue(s)", seq.id, issues.len());
                    for issue in issues {
                        println!("  - {issue}");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} sequence(s) failed validation");
            }
        }
        Some(Commands::Enroll { lead }) => {
            let lead = store
                .load_lead(&LeadId::from(lead.as_str()))?
                .ok_or_else(|| anyhow::anyhow!("Lead not found: {lead}"))?;
            print_status(engine.enroll_lead(&lead, now).await?.as_ref())?;
        }
        Some(Commands::Assign { lead, sequence }) => {
            let status = engine
                .assign_sequence(
                    &LeadId::from(lead.as_str()),
                    &SequenceId::from(sequence.as_str()),
                    now,
                )
                .await?;
            print_status(Some(&status))?;
        }
        Some(Commands::Pause { cursor }) => {
            let status = engine.pause(&CursorId::from(cursor.as_str()), now).await?;
            print_status(Some(&status))?;
        }
        Some(Commands::Resume { cursor }) => {
            let status = engine.resume(&CursorId::from(cursor.as_str()), now).await?;
            print_status(Some(&status))?;
        }
        Some(Commands::Stop { cursor }) => {
            let status = engine.stop(&CursorId::from(cursor.as_str()), now).await?;
            print_status(Some(&status))?;
        }
        Some(Commands::Move { lead, stage }) => {
            let status = engine
                .move_lead_to_stage(&LeadId::from(lead.as_str()), &stage, now)
                .await?;
            print_status(status.as_ref())?;
        }
        Some(Commands::Inbound { contact, body, at }) => {
            let message =
                MessageEvent::inbound(ContactId::from(contact.as_str()), body.join(" "), at.unwrap_or(now));
            let woken = engine.handle_inbound(&message).await?;
            println!("Woke {woken} cursor(s)");
        }
        Some(Commands::Tick) => {
            engine.recover(now).await?;
            let woken = engine.tick(now).await?;
            println!("Woke {woken} cursor(s)");
            if let Some(due) = engine.next_due() {
                println!("Next timer at {}", due.to_rfc3339());
            }
        }
        Some(Commands::Status { id, lead }) => {
            if lead {
                let cursors = engine.lead_cursors(&LeadId::from(id.as_str()))?;
                if cursors.is_empty() {
                    println!("No cursors for lead {id}");
                }
                for status in &cursors {
                    print_status(Some(status))?;
                }
            } else {
                print_status(Some(&engine.status(&CursorId::from(id.as_str()))?))?;
            }
        }
        Some(Commands::Log { cursor }) => {
            for entry in engine.log(&CursorId::from(cursor.as_str()))? {
                println!(
                    "{}  #{:<3} {:<10} {}",
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.position,
                    entry.kind,
                    entry.detail
                );
            }
        }
        Some(Commands::Config) => unreachable!("handled before store setup"),
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn serve(engine: Arc<FlowEngine>) -> anyhow::Result<()> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let (runner, inbound_tx) = FlowRunner::new(engine.clone(), cancel.clone());

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    // Engine events at debug level
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(?event, "Engine event");
        }
    });

    // Inbound messages as JSON lines on stdin
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed: InboundLine = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed inbound line");
                    continue;
                }
            };
            let message = MessageEvent::inbound(
                parsed.contact_id,
                parsed.body,
                parsed.timestamp.unwrap_or_else(Utc::now),
            );
            if inbound_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    info!("Serving; send inbound messages as JSON lines on stdin, Ctrl-C to stop");
    runner.run().await?;
    Ok(())
}

fn print_status(status: Option<&CursorStatus>) -> anyhow::Result<()> {
    match status {
        Some(status) => println!("{}", serde_json::to_string_pretty(status)?),
        None => println!("No active cursor"),
    }
    Ok(())
}
