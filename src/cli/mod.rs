//! Command-line interface for clipforge.
//!
//! Provides commands for extracting a single group, running the fan-out
//! pipeline, combining manifests, and inspecting or auditing past runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{
    FfmpegTranscoder, HttpUnitInvoker, JsonDirMetadataStore, LocalObjectStore, MetadataStore,
    NoDispatchInvoker, ObjectStore, PostgrestMetadataStore, SpawnUnitInvoker, UnitInvoker,
};
use crate::config::{self, MetadataKind, ResolvedConfig};
use crate::core::{
    load_run, AssemblyError, EventStore, ExtractionUnit, ManifestAssembler, Orchestrator,
    PipelineReport,
};
use crate::domain::{CombinedManifest, EventType, PipelineRun};

/// clipforge - Fan-out clip extraction and training manifest builder
#[derive(Parser, Debug)]
#[command(name = "clipforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract clips and write the manifest pair for one group
    Extract {
        /// Group (game) identifier
        group_id: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dispatch a unit per group, wait for completion, combine manifests
    Run {
        /// Groups to process (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        groups: Vec<String>,

        /// Polling budget (defaults to orchestrator.max_wait_minutes)
        #[arg(long)]
        max_wait_minutes: Option<u64>,

        /// Remote unit endpoint (units run in-process when unset)
        #[arg(long, env = "CLIPFORGE_UNIT_ENDPOINT")]
        endpoint: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Combine the latest manifest pair of each group
    Combine {
        /// Groups to combine (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        groups: Vec<String>,

        /// Dataset name for the combined files (random when unset)
        #[arg(short, long)]
        dataset: Option<String>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Re-check groups that did not complete and re-combine if any arrived late
    Audit {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Extract { group_id, json } => extract_group(&group_id, json).await,
            Commands::Run {
                groups,
                max_wait_minutes,
                endpoint,
                json,
            } => run_groups(groups, max_wait_minutes, endpoint, json).await,
            Commands::Combine { groups, dataset } => combine_groups(groups, dataset).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Audit { run_id } => audit_run(&run_id).await,
            Commands::Config => show_config().await,
        }
    }
}

fn build_store(cfg: &ResolvedConfig) -> Arc<dyn ObjectStore> {
    let store = LocalObjectStore::new(&cfg.storage.root);
    match &cfg.storage.uri_base {
        Some(base) => Arc::new(store.with_uri_base(base)),
        None => Arc::new(store),
    }
}

fn build_metadata(cfg: &ResolvedConfig) -> Result<Arc<dyn MetadataStore>> {
    let meta = &cfg.metadata;
    Ok(match meta.kind {
        MetadataKind::Postgrest => {
            let url = meta
                .url
                .as_deref()
                .context("metadata.url (or CLIPFORGE_METADATA_URL) is required for postgrest")?;
            let key = meta
                .api_key
                .as_deref()
                .context("metadata.api_key (or CLIPFORGE_METADATA_KEY) is required for postgrest")?;
            Arc::new(
                PostgrestMetadataStore::new(url, key, &meta.table)
                    .with_columns(&meta.group_column, &meta.order_column),
            )
        }
        MetadataKind::JsonDir => Arc::new(JsonDirMetadataStore::new(&meta.dir)),
    })
}

fn build_unit(cfg: &ResolvedConfig) -> Result<Arc<ExtractionUnit>> {
    let transcoder = FfmpegTranscoder::with_binary_path(&cfg.ffmpeg_binary);
    let unit = ExtractionUnit::new(build_metadata(cfg)?, build_store(cfg), Arc::new(transcoder))
    .with_angles(cfg.angles.clone())
    .with_layout(cfg.storage.layout.clone())
    .with_settings(cfg.extraction.clone());
    Ok(Arc::new(unit))
}

fn build_invoker(cfg: &ResolvedConfig, endpoint: Option<String>) -> Result<Arc<dyn UnitInvoker>> {
    let dispatch = &cfg.dispatch;
    Ok(match endpoint.or_else(|| dispatch.unit_endpoint.clone()) {
        Some(url) => {
            let invoker = HttpUnitInvoker::new(url, dispatch.dispatch_timeout);
            match &dispatch.unit_token {
                Some(token) => Arc::new(invoker.with_token(token)),
                None => Arc::new(invoker),
            }
        }
        None => Arc::new(SpawnUnitInvoker::new(
            build_unit(cfg)?,
            dispatch.max_concurrent_units,
        )),
    })
}

fn build_orchestrator(cfg: &ResolvedConfig, invoker: Arc<dyn UnitInvoker>) -> Result<Orchestrator> {
    Ok(Orchestrator::new(
        invoker,
        build_store(cfg),
        cfg.storage.layout.clone(),
        config::runs_dir()?,
    )
    .with_settings(cfg.orchestrator.clone()))
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Run one extraction unit in the foreground
async fn extract_group(group_id: &str, json: bool) -> Result<()> {
    let cfg = config::config()?;
    FfmpegTranscoder::with_binary_path(&cfg.ffmpeg_binary)
        .health_check()
        .await?;
    let unit = build_unit(cfg)?;

    let result = unit
        .run_extraction(group_id)
        .await
        .with_context(|| format!("Extraction failed for group {}", group_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Group:       {}", result.group_id);
    println!("Outcome:     {:?}", result.outcome);
    println!(
        "Records:     {} ({} rejected)",
        result.total_records, result.records_rejected
    );
    println!(
        "Clips:       {}/{} extracted, {} failed ({:.0}%)",
        result.clips_extracted,
        result.clips_needed,
        result.clips_failed,
        result.success_rate() * 100.0
    );
    println!(
        "Entries:     {} training, {} validation",
        result.training_entries, result.validation_entries
    );
    println!("Training:    {}", result.training_file_uri);
    println!("Validation:  {}", result.validation_file_uri);
    println!("Duration:    {}ms", result.duration_ms);

    Ok(())
}

/// Fan out over `groups` and combine whatever completes
async fn run_groups(
    groups: Vec<String>,
    max_wait_minutes: Option<u64>,
    endpoint: Option<String>,
    json: bool,
) -> Result<()> {
    let cfg = config::config()?;
    if endpoint.is_none() && cfg.dispatch.unit_endpoint.is_none() {
        // Units will run in this process
        FfmpegTranscoder::with_binary_path(&cfg.ffmpeg_binary)
            .health_check()
            .await?;
    }
    let invoker = build_invoker(cfg, endpoint)?;
    let orchestrator = build_orchestrator(cfg, invoker)?;

    let max_wait = max_wait_minutes
        .map(|m| Duration::from_secs(m * 60))
        .unwrap_or(cfg.dispatch.max_wait);

    let report = orchestrator.run_pipeline(&groups, max_wait).await?;
    print_report(&report, json)
}

/// Combine the newest committed pair of each group
async fn combine_groups(groups: Vec<String>, dataset: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let assembler = ManifestAssembler::new(build_store(cfg), cfg.storage.layout.clone())
        .with_retry_policy(cfg.extraction.retry.clone(), cfg.extraction.io_timeout);

    let (manifests, missing) = assembler
        .locate_latest(&groups)
        .await
        .context("Failed to list group manifests")?;
    for group in &missing {
        eprintln!("[skip] {}: {}", group.group_id, group.reason);
    }

    let dataset = dataset.unwrap_or_else(|| Uuid::new_v4().to_string());
    match assembler.assemble(&dataset, &manifests).await {
        Ok(combined) => {
            print_combined(&combined);
            if !missing.is_empty() {
                eprintln!("\n[{} of {} groups had no manifest pair]", missing.len(), groups.len());
            }
            Ok(())
        }
        Err(AssemblyError::PartialInput { combined }) => {
            print_combined(&combined);
            eprintln!(
                "\n[Combined with {} unreadable group(s)]",
                combined.groups_dropped.len()
            );
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let journal = EventStore::open(run_id).await?;
    let events = journal.replay().await?;
    let run = PipelineRun::from_events(&events)
        .with_context(|| format!("No events found for run {}", run_id))?;

    println!("Run ID:    {}", run.id);
    println!("State:     {:?}", run.state);
    println!("Started:   {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Max wait:  {}s", run.max_wait_seconds);
    println!("\nGroup statuses:");
    for (group, status) in &run.group_statuses {
        match run.manifests.get(group) {
            Some(manifest) => println!("  {}: {:?} ({})", group, status, manifest.timestamp),
            None => println!("  {}: {:?}", group, status),
        }
    }
    for event in events.iter().filter(|e| e.error.is_some()) {
        if let (Some(group), Some(error)) = (&event.group_id, &event.error) {
            println!("  ! {}: {}", group, error);
        }
    }
    if let Some(combined) = &run.combined {
        println!();
        print_combined(combined);
    }
    if let Some(finished) = journal.last_event_of_type(EventType::RunFinished).await? {
        println!("\n[{}]", finished.payload_summary);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs_dir = config::runs_dir()?;
    let run_ids = EventStore::list_runs().await?;

    if run_ids.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    let mut runs = Vec::new();
    for run_id in run_ids {
        if let Ok(run) = load_run(&runs_dir, run_id).await {
            runs.push(run);
        }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<20} {:<8} {:<20}", "RUN ID", "STARTED", "GROUPS", "STATE");
    println!("{}", "-".repeat(88));

    for run in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<20} {:<8} {:<20}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.groups.len(),
            format!("{:?}", run.state)
        );
    }

    Ok(())
}

/// Re-check a finished run for late manifests
async fn audit_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let cfg = config::config()?;

    // Audit only reads storage and the journal
    let orchestrator = build_orchestrator(cfg, Arc::new(NoDispatchInvoker))?;

    let report = orchestrator.audit(run_id).await?;
    print_report(&report, false)
}

fn print_report(report: &PipelineReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Run ID:    {}", report.run_id);
    println!("State:     {:?}", report.state);
    println!("Elapsed:   {:.1}s", report.elapsed.as_secs_f64());
    println!("Completed: {}", join_or_none(&report.completed));
    println!("Empty:     {}", join_or_none(&report.empty));
    println!("Pending:   {}", join_or_none(&report.pending));
    if report.failed.is_empty() {
        println!("Failed:    (none)");
    } else {
        println!("Failed:");
        for (group, reason) in &report.failed {
            println!("  {}: {}", group, reason);
        }
    }

    match &report.combined {
        Some(combined) => {
            println!();
            print_combined(combined);
        }
        None => println!("\nNo combined manifest (no group completed)"),
    }

    Ok(())
}

fn print_combined(combined: &CombinedManifest) {
    println!("Combined training:   {} ({} entries)", combined.training_uri, combined.training_entries);
    println!(
        "Combined validation: {} ({} entries)",
        combined.validation_uri, combined.validation_entries
    );
    println!("Groups included:     {}", join_or_none(&combined.groups_included));
    for dropped in &combined.groups_dropped {
        println!("Dropped {}: {}", dropped.group_id, dropped.reason);
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn display_or_default(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none - using defaults)".to_string())
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", display_or_default(cfg.config_file.as_deref()));
    println!();
    println!("Paths:");
    println!("  Home (journals): {}", cfg.home.display());
    println!("  Runs:            {}", config::runs_dir()?.display());
    println!(
        "  Work dir:        {}",
        cfg.extraction
            .work_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(system temp)".to_string())
    );
    println!();
    println!("Storage:");
    println!("  Root:            {}", cfg.storage.root.display());
    println!("  Source prefix:   {}", cfg.storage.layout.source_prefix);
    println!("  Output prefix:   {:?}", cfg.storage.layout.output_prefix);
    println!("  Combined prefix: {}", cfg.storage.layout.combined_prefix);
    println!();
    println!("Metadata:");
    println!("  Kind:  {:?}", cfg.metadata.kind);
    match cfg.metadata.kind {
        MetadataKind::Postgrest => {
            println!("  URL:   {}", cfg.metadata.url.as_deref().unwrap_or("(unset)"));
            println!("  Table: {}", cfg.metadata.table);
            println!(
                "  Key:   {}",
                if cfg.metadata.api_key.is_some() { "(set)" } else { "(unset)" }
            );
        }
        MetadataKind::JsonDir => println!("  Dir:   {}", cfg.metadata.dir.display()),
    }
    println!();
    println!("Extraction:");
    println!("  ffmpeg:            {}", cfg.ffmpeg_binary);
    println!("  Transcode timeout: {}s", cfg.extraction.transcode_timeout.as_secs());
    println!("  I/O timeout:       {}s", cfg.extraction.io_timeout.as_secs());
    println!("  Unit timeout:      {}s", cfg.extraction.unit_timeout.as_secs());
    println!("  File concurrency:  {}", cfg.extraction.file_concurrency);
    println!("  Validation ratio:  {}", cfg.extraction.validation_ratio);
    println!(
        "  Split seed:        {}",
        cfg.extraction
            .split_seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(random)".to_string())
    );
    println!("  Retry attempts:    {}", cfg.extraction.retry.max_attempts);
    println!();
    println!("Orchestrator:");
    println!("  Poll interval:     {}s", cfg.orchestrator.poll_interval.as_secs());
    println!("  Max wait:          {}m", cfg.dispatch.max_wait.as_secs() / 60);
    println!("  Max units:         {}", cfg.dispatch.max_concurrent_units);
    println!("  Dispatch timeout:  {}s", cfg.dispatch.dispatch_timeout.as_secs());
    println!("  Reuse manifests:   {}", cfg.orchestrator.reuse_existing_manifests);
    println!(
        "  Unit endpoint:     {}",
        cfg.dispatch.unit_endpoint.as_deref().unwrap_or("(in-process)")
    );
    println!();
    println!("Angles:");
    for (tag, roles) in &cfg.angles.angles {
        let roles: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
        println!("  {}: {}", tag, roles.join(", "));
    }

    Ok(())
}
