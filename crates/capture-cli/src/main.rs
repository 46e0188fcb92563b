// ============================================================================
// capture-queue - CLI inspection tool for the offline capture queue
// ============================================================================
// Usage:
//   capture-queue status                         Queue depth, backlog age, last sync
//   capture-queue list [--state STATE]           List queued sessions
//   capture-queue show <SESSION>                 Print one queued session as JSON
//   capture-queue export --format json           Export queue and audit log
//   capture-queue drain                          Run one sync cycle now
//   capture-queue requeue <SESSION>              Retry a conflict/failed session
//   capture-queue discard <SESSION>              Drop a conflict/failed session
//   capture-queue prune --older-than 30          Prune old audit records
//   capture-queue check-schema <FILE> --kind K   Validate a dashboard/form schema
// ============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capture_core::schema::CompiledForm;
use capture_core::sync::HttpSubmitter;
use capture_core::{
    CoreConfig, DashboardSchema, FormSchema, OfflineQueue, StaticToken, SyncReconciler,
};

const STATES: [&str; 4] = ["enqueued", "in-flight", "conflict", "failed"];

/// Offline capture queue inspection tool
#[derive(Parser)]
#[command(name = "capture-queue", version, about = "Inspect and operate the offline capture queue")]
struct Cli {
    /// Path to the queue database (default: $CAPTURE_QUEUE_PATH or ~/.capture/queue.redb)
    #[arg(long, global = true)]
    queue_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depth, oldest pending age and last successful sync
    Status,

    /// List queued sessions with optional state filter
    List {
        /// Filter by state: enqueued, in-flight, conflict, failed
        #[arg(long)]
        state: Option<String>,
    },

    /// Print one queued session as JSON
    Show { session_id: String },

    /// Export queue entries and audit log as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Run one drain cycle against the configured backend
    Drain,

    /// Move a conflict/failed session back to enqueued
    Requeue { session_id: String },

    /// Permanently drop a conflict/failed session
    Discard { session_id: String },

    /// Prune audit records of synced sessions
    Prune {
        /// Delete audit records synced more than this many days ago
        #[arg(long, default_value = "30")]
        older_than: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a schema document
    CheckSchema {
        file: PathBuf,

        #[arg(long, value_enum)]
        kind: SchemaKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemaKind {
    Dashboard,
    Form,
}

fn parse_state(s: &str) -> Result<String> {
    let normalized = s.to_lowercase().replace('_', "-");
    let normalized = if normalized == "inflight" {
        "in-flight".to_string()
    } else {
        normalized
    };
    if STATES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        anyhow::bail!("Unknown state '{}'. Valid values: {}", s, STATES.join(", "))
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,capture_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = CoreConfig::from_env();
    if cli.queue_path.is_some() {
        config.queue_path = cli.queue_path.clone();
    }
    let open_queue = || -> Result<OfflineQueue> {
        let path = config.resolve_queue_path()?;
        OfflineQueue::open(&path)
            .with_context(|| format!("Failed to open queue at {}", path.display()))
    };

    match cli.command {
        Commands::Status => cmd_status(&open_queue()?),
        Commands::List { state } => cmd_list(&open_queue()?, state),
        Commands::Show { session_id } => cmd_show(&open_queue()?, &session_id),
        Commands::Export { format } => cmd_export(&open_queue()?, &format),
        Commands::Drain => cmd_drain(open_queue()?, &config).await,
        Commands::Requeue { session_id } => cmd_requeue(&open_queue()?, &session_id),
        Commands::Discard { session_id } => cmd_discard(&open_queue()?, &session_id),
        Commands::Prune {
            older_than,
            dry_run,
        } => cmd_prune(&open_queue()?, older_than, dry_run),
        Commands::CheckSchema { file, kind } => cmd_check_schema(&file, kind),
    }
}

fn cmd_status(queue: &OfflineQueue) -> Result<()> {
    let stats = queue.stats()?;

    println!("=== Offline Capture Queue ===");
    println!("Database: {}", queue.path().display());
    println!();
    println!("Depth:    {}", stats.depth);
    println!("  {:10} {}", "pending", stats.pending);
    println!("  {:10} {}", "in-flight", stats.in_flight);
    println!("  {:10} {}", "conflict", stats.conflict);
    println!("  {:10} {}", "failed", stats.failed);
    println!(
        "Oldest pending: {}",
        stats
            .oldest_pending_age_secs
            .map(format_age)
            .unwrap_or_else(|| "-".into())
    );
    println!(
        "Last sync:      {}",
        stats
            .last_sync_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".into())
    );
    println!("Synced total:   {}", stats.synced_total);

    Ok(())
}

fn cmd_list(queue: &OfflineQueue, state: Option<String>) -> Result<()> {
    let filter = state.as_deref().map(parse_state).transpose()?;
    let entries = queue.list(filter.as_deref())?;

    if entries.is_empty() {
        println!("No queued sessions.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:>8}  {:<22}  {}",
        "SESSION ID", "STATE", "ATTEMPTS", "ENQUEUED AT", "FORM / LAST ERROR"
    );
    println!("{}", "-".repeat(110));

    for entry in &entries {
        let detail = entry
            .last_error
            .as_deref()
            .map(|e| e.chars().take(30).collect::<String>())
            .unwrap_or_else(|| entry.session.schema_ref().to_string());
        println!(
            "{:<36}  {:<10}  {:>8}  {:<22}  {}",
            entry.session_id(),
            entry.state.name(),
            entry.attempts,
            format_timestamp(entry.enqueued_at),
            detail
        );
    }

    println!("\nTotal: {} sessions", entries.len());
    Ok(())
}

fn cmd_show(queue: &OfflineQueue, session_id: &str) -> Result<()> {
    if let Some(entry) = queue.get(session_id)? {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }
    match queue.audit_record(session_id)? {
        Some(record) => {
            println!("Session already synced:");
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => anyhow::bail!("No session '{}' in queue or audit log", session_id),
    }
}

fn cmd_export(queue: &OfflineQueue, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = serde_json::json!({
        "exportedAt": Utc::now().to_rfc3339(),
        "stats": queue.stats()?,
        "entries": queue.snapshot()?,
        "audit": queue.audit_log()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_drain(queue: OfflineQueue, config: &CoreConfig) -> Result<()> {
    let tokens = Arc::new(StaticToken::new(config.api_token.clone()));
    let submitter = Arc::new(HttpSubmitter::new(
        config.api_base_url.clone(),
        tokens,
        config.submit_timeout,
    ));
    let reconciler = SyncReconciler::from_config(Arc::new(queue), submitter, config);

    info!("Draining against {}", config.api_base_url);
    let report = reconciler.drain().await?;

    println!("Synced:        {}", report.synced);
    println!("Duplicates:    {}", report.duplicates);
    println!("Conflict:      {}", report.conflict);
    println!("Failed:        {}", report.failed);
    println!("Skipped:       {}", report.skipped);
    println!("Still pending: {}", report.still_pending);
    if let Some(halted) = &report.halted {
        println!("Halted:        {}", serde_json::to_string(halted)?);
    }
    Ok(())
}

fn cmd_requeue(queue: &OfflineQueue, session_id: &str) -> Result<()> {
    let entry = queue.requeue(session_id)?;
    println!("Requeued {} ({})", entry.session_id(), entry.state.name());
    Ok(())
}

fn cmd_discard(queue: &OfflineQueue, session_id: &str) -> Result<()> {
    let entry = queue.discard(session_id)?;
    println!(
        "Discarded {} (was {}, {} attempts)",
        entry.session_id(),
        entry.state.name(),
        entry.attempts
    );
    Ok(())
}

fn cmd_prune(queue: &OfflineQueue, older_than: i64, dry_run: bool) -> Result<()> {
    let pruned = queue.prune_audit(chrono::Duration::days(older_than), dry_run)?;

    if dry_run {
        println!("=== DRY RUN: no data will be deleted ===\n");
        println!(
            "Would prune {} audit records older than {} days",
            pruned, older_than
        );
    } else {
        println!("Pruned {} audit records (older than {} days)", pruned, older_than);
    }
    Ok(())
}

fn cmd_check_schema(file: &Path, kind: SchemaKind) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    match kind {
        SchemaKind::Dashboard => {
            let schema = DashboardSchema::from_json(&json)?;
            println!("OK: dashboard '{}' with {} widgets", schema.title, schema.widgets.len());
            for widget in &schema.widgets {
                println!(
                    "  {:<20} {:<8} {}",
                    widget.id,
                    serde_json::to_value(widget.kind)?.as_str().unwrap_or("-"),
                    widget.data_source
                );
            }
        }
        SchemaKind::Form => {
            let schema = FormSchema::from_json(&json)?;
            let compiled = CompiledForm::compile(&schema)?;
            println!(
                "OK: form {} with {} fields",
                schema.schema_ref(),
                compiled.nodes().len()
            );
            for node in compiled.nodes() {
                println!(
                    "  {}{:<20} {:<10}{}",
                    "  ".repeat(node.depth),
                    node.path,
                    node.spec.kind.name(),
                    if node.spec.required { " required" } else { "" }
                );
            }
        }
    }
    Ok(())
}
