mod ai;
mod config;
mod db;
mod errors;
mod jobs;
mod logging;
mod mappings;
mod models;
mod operations;
mod orchestrator;
mod patterns;
mod ranking;
mod runs;
mod sources;
mod tui;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use ai::{resolve_model, AiRanker, AiRejectionAnalyzer};
use config::{RunConfig, Settings};
use db::Database;
use errors::RunError;
use mappings::{MappingDefinition, DEFAULT_BASE_CONFIDENCE};
use models::{AppliedMethod, Candidate, JobStatus, LeadCandidate, OperationKind};
use operations::{ApplyOperation, LeadScrapeOperation, SearchOperation};
use orchestrator::{BatchOperation, Orchestrator, StartRequest};
use patterns::{KeywordAnalyzer, RejectionAnalyzer, RejectionLearner};
use ranking::{KeywordRanker, Ranker};
use sources::{read_json, FileJobSource, FileLeadSource, ReplayDriver};

#[derive(Parser)]
#[command(name = "jobpilot")]
#[command(about = "Job application pipeline - discover, rank, apply, and learn from outcomes")]
struct Cli {
    /// Database file (defaults to JOBPILOT_DB or the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Model used for ranking and rejection analysis (defaults to JOBPILOT_MODEL; offline rules when unset)
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Ingest a JSON array of scraped candidates
    Ingest {
        /// Path to the candidates file
        file: PathBuf,
    },

    /// List jobs
    List {
        /// Filter by status (queued, applied, interview, rejected, skipped, reported)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show job details
    Show {
        /// Job ID (a unique prefix is enough)
        id: String,
    },

    /// Change a job's status
    Status {
        /// Job ID (a unique prefix is enough)
        id: String,

        /// New status
        status: String,

        /// How the application was sent (manual, automatic)
        #[arg(short, long)]
        method: Option<String>,

        /// Rejection reason, fed to the rejection learner
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show pipeline counts
    Stats,

    /// Browse the queue interactively
    Browse {
        /// Status to browse instead of the queue
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Manage recruiter leads
    Leads {
        #[command(subcommand)]
        command: LeadCommands,
    },

    /// Manage form label mappings
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },

    /// Inspect learned rejection patterns and weights
    Patterns {
        #[command(subcommand)]
        command: PatternCommands,
    },

    /// Run a batch operation and stream its log
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Inspect run history
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },

    /// Manage preferences and form answers (answer.<key>)
    Prefs {
        #[command(subcommand)]
        command: PrefCommands,
    },
}

#[derive(Subcommand)]
enum LeadCommands {
    /// Import leads from a JSON array
    Import {
        file: PathBuf,
    },

    /// List leads
    List {
        /// Include deleted leads
        #[arg(long)]
        all: bool,
    },

    /// Soft-delete a lead
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// List all mappings by confidence
    List,

    /// Show the mapping a label resolves to
    Show {
        label: String,
    },

    /// Create or redefine a mapping
    Learn {
        /// Form label as shown on the page
        label: String,

        /// Answer key; the value comes from preference answer.<key>
        answer_key: String,

        /// Locator used to fill the field
        locator: String,

        #[arg(long)]
        field_type: Option<String>,

        #[arg(long)]
        strategy: Option<String>,

        #[arg(long, default_value_t = DEFAULT_BASE_CONFIDENCE)]
        confidence: f64,
    },

    /// Record a successful fill
    Success {
        label: String,

        /// Locator that worked
        locator: String,
    },

    /// Record a failed fill
    Failure {
        label: String,
    },
}

#[derive(Subcommand)]
enum PatternCommands {
    /// List rejection patterns by occurrence
    List,

    /// Show current per-category weight adjustments
    Weights {
        /// Print the ledger instead of the totals
        #[arg(long)]
        history: bool,

        /// Restrict the ledger to one category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Clear all weight adjustments
    Reset,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON configuration, inline or @path
    #[arg(short, long)]
    config: Option<String>,

    /// Resume an interrupted run by ID
    #[arg(short, long)]
    resume: Option<i64>,
}

#[derive(Subcommand)]
enum RunCommands {
    /// Discover, rank and queue jobs
    Search(RunArgs),

    /// Collect recruiter leads
    Leads(RunArgs),

    /// Apply to queued jobs
    Apply(RunArgs),
}

#[derive(Subcommand)]
enum RunsCommands {
    /// List recent runs
    List {
        /// Filter by operation (search, leads, apply)
        #[arg(short, long)]
        operation: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show whether a run is active, and which process owns it
    Status,

    /// Ask the process that owns a run to stop it at its next safe point
    Stop {
        run_id: i64,
    },

    /// Mark a stale in-progress run as stopped
    Reconcile {
        run_id: i64,
    },
}

#[derive(Subcommand)]
enum PrefCommands {
    Get {
        key: String,
    },

    Set {
        key: String,
        value: String,
    },

    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_logging("jobpilot=warn");
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let db_path = cli.db.clone().or_else(|| settings.db_path.clone());
    let db = Database::open(db_path.as_deref())?;

    if let Commands::Init = cli.command {
        db.init()?;
        println!(
            "Database initialized at {}",
            db.path().map(|p| p.display().to_string()).unwrap_or_default()
        );
        return Ok(());
    }
    db.ensure_initialized()?;

    let model = cli.model.clone().or_else(|| settings.model.clone());
    let analyzer: Arc<dyn RejectionAnalyzer> = match &model {
        Some(name) => Arc::new(AiRejectionAnalyzer::new(resolve_model(name)?)),
        None => Arc::new(KeywordAnalyzer),
    };
    let learner = RejectionLearner::spawn(db.clone(), analyzer);
    let db = db.with_rejection_hook(learner.sender());

    let result = dispatch(cli.command, &db, &settings, model.as_deref()).await;

    drop(db);
    let stats = learner.shutdown().await;
    tracing::debug!(processed = stats.processed, failed = stats.failed, "Rejection learner stopped");
    result
}

async fn dispatch(command: Commands, db: &Database, settings: &Settings, model: Option<&str>) -> Result<()> {
    match command {
        Commands::Init => db.init()?,

        Commands::Ingest { file } => {
            let candidates: Vec<Candidate> = read_json(&file)?;
            let report = db.ingest(&candidates)?;
            println!(
                "Ingested {} candidate(s): {} new, {} re-queued, {} skipped",
                candidates.len(),
                report.inserted,
                report.requeued,
                report.skipped_count()
            );
            for skipped in &report.skipped {
                println!("  skipped {} ({})", skipped.url, skipped.reason);
            }
        }

        Commands::List { status, limit } => {
            let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
            let jobs = db.list_jobs(status, limit)?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<10} {:<10} {:>6} {:<32} {:<20}", "ID", "STATUS", "RANK", "TITLE", "COMPANY");
                println!("{}", "-".repeat(82));
                for job in jobs {
                    let rank = job.rank.map(|r| format!("{:.1}", r)).unwrap_or_else(|| "-".into());
                    println!(
                        "{:<10} {:<10} {:>6} {:<32} {:<20}",
                        &job.id[..8.min(job.id.len())],
                        job.status,
                        rank,
                        truncate(&job.title, 30),
                        truncate(&job.company, 18)
                    );
                }
            }
        }

        Commands::Show { id } => match db.get_job(&id)? {
            Some(job) => {
                println!("Job {}", job.id);
                println!("Title: {}", job.title);
                println!("Company: {}", job.company);
                println!("Status: {}", job.status);
                if let Some(method) = job.applied_method {
                    println!("Applied: {}", method.as_str());
                }
                if let Some(reason) = &job.rejection_reason {
                    println!("Rejection reason: {}", reason);
                }
                println!("URL: {}", job.url);
                if let Some(rank) = job.rank {
                    println!("Rank: {}", rank);
                }
                if let Some(profile) = &job.search_profile {
                    println!("Profile: {}", profile);
                }
                println!("Quick apply: {}", if job.quick_apply { "yes" } else { "no" });
                println!("Curated: {}", if job.curated { "yes" } else { "no" });
                println!("Created: {}", job.created_at);
                println!("Status changed: {}", job.status_updated_at);
                for (category, score) in &job.fit.category_scores {
                    println!("  {:<12} {:>5.1}", category, score);
                }
                print_list("Reasons", &job.fit.reasons);
                print_list("Must haves", &job.fit.must_haves);
                print_list("Blockers", &job.fit.blockers);
                print_list("Missing keywords", &job.fit.missing_keywords);
                if let Some(description) = &job.description {
                    println!("\n--- Description ---\n{}", textwrap::fill(description, 80));
                }
            }
            None => println!("Job {} not found.", id),
        },

        Commands::Status { id, status, method, reason } => {
            let status: JobStatus = status.parse()?;
            let method = method.as_deref().map(str::parse::<AppliedMethod>).transpose()?;
            let job = db.get_job(&id)?.ok_or_else(|| anyhow!("Job {} not found", id))?;
            if db.update_status(&job.id, status, method, reason.as_deref())? {
                println!("{} at {} -> {}", job.title, job.company, status);
            } else {
                println!("Job {} not found.", id);
            }
        }

        Commands::Stats => {
            let stats = db.job_stats()?;
            println!("Jobs: {}", stats.total);
            for status in JobStatus::ALL {
                let count = stats.by_status.get(status.as_str()).copied().unwrap_or(0);
                println!("  {:<10} {}", status, count);
            }
            println!("Applied manually:     {}", stats.applied_manual);
            println!("Applied automatically: {}", stats.applied_automatic);
            println!("Active leads: {}", stats.active_leads);
        }

        Commands::Browse { status } => {
            let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
            tui::run_browse(db, status)?;
        }

        Commands::Leads { command } => match command {
            LeadCommands::Import { file } => {
                let leads: Vec<LeadCandidate> = read_json(&file)?;
                let import = db.import_leads(&leads)?;
                println!("Imported {} lead(s), {} already known", import.inserted, import.skipped);
            }

            LeadCommands::List { all } => {
                let leads = db.list_leads(all)?;
                if leads.is_empty() {
                    println!("No leads found.");
                } else {
                    println!("{:<10} {:<24} {:<24} {:<30}", "ID", "NAME", "COMPANY", "PROFILE");
                    println!("{}", "-".repeat(90));
                    for lead in leads {
                        let deleted = if lead.deleted_at.is_some() { " (deleted)" } else { "" };
                        println!(
                            "{:<10} {:<24} {:<24} {:<30}{}",
                            &lead.id[..8.min(lead.id.len())],
                            truncate(&lead.name, 22),
                            truncate(lead.company.as_deref().unwrap_or("-"), 22),
                            truncate(&lead.profile_url, 28),
                            deleted
                        );
                    }
                }
            }

            LeadCommands::Delete { id } => {
                if db.soft_delete_lead(&id)? {
                    println!("Deleted lead {}.", id);
                } else {
                    println!("Lead {} not found.", id);
                }
            }
        },

        Commands::Mappings { command } => match command {
            MappingCommands::List => {
                let mappings = db.list_mappings()?;
                if mappings.is_empty() {
                    println!("No mappings learned yet.");
                } else {
                    println!("{:<30} {:<18} {:>6} {:>4} {:>4}  {}", "LABEL", "ANSWER", "CONF", "OK", "FAIL", "LOCATOR");
                    println!("{}", "-".repeat(90));
                    for m in mappings {
                        println!(
                            "{:<30} {:<18} {:>6.3} {:>4} {:>4}  {}",
                            truncate(&m.label, 28),
                            truncate(&m.answer_key, 16),
                            m.confidence(),
                            m.success_count,
                            m.failure_count,
                            m.locator
                        );
                    }
                }
            }

            MappingCommands::Show { label } => match db.lookup_mapping(&label)? {
                Some(m) => {
                    println!("Label: {}", m.label);
                    println!("Answer key: {}", m.answer_key);
                    println!("Locator: {}", m.locator);
                    println!("Confidence: {:.3} (base {:.2})", m.confidence(), m.base_confidence);
                    println!("Successes: {}  Failures: {}", m.success_count, m.failure_count);
                    if let Some(field_type) = &m.field_type {
                        println!("Field type: {}", field_type);
                    }
                    if let Some(strategy) = &m.input_strategy {
                        println!("Input strategy: {}", strategy);
                    }
                    println!("Last seen: {}", m.last_seen);
                    let others: Vec<_> = db
                        .candidates_for_key(&m.answer_key)?
                        .into_iter()
                        .filter(|c| c.label != m.label)
                        .collect();
                    if !others.is_empty() {
                        println!("\nOther labels for '{}':", m.answer_key);
                        for c in others {
                            println!("  {:<30} {:.3}", c.label, c.confidence());
                        }
                    }
                }
                None => println!("No mapping for '{}'.", label),
            },

            MappingCommands::Learn {
                label,
                answer_key,
                locator,
                field_type,
                strategy,
                confidence,
            } => {
                db.learn_mapping(&MappingDefinition {
                    label: &label,
                    answer_key: &answer_key,
                    locator: &locator,
                    field_type: field_type.as_deref(),
                    input_strategy: strategy.as_deref(),
                    base_confidence: confidence,
                })?;
                println!("Mapped '{}' -> {}", label, answer_key);
            }

            MappingCommands::Success { label, locator } => {
                if db.record_success(&label, &locator)? {
                    println!("Recorded success for '{}'.", label);
                } else {
                    println!("No mapping for '{}'.", label);
                }
            }

            MappingCommands::Failure { label } => {
                if db.record_failure(&label)? {
                    println!("Recorded failure for '{}'.", label);
                } else {
                    println!("No mapping for '{}'.", label);
                }
            }
        },

        Commands::Patterns { command } => match command {
            PatternCommands::List => {
                let patterns = db.list_patterns()?;
                if patterns.is_empty() {
                    println!("No rejection patterns yet.");
                } else {
                    println!("{:<12} {:<24} {:>6} {:>8} {:<12}", "TYPE", "VALUE", "COUNT", "WEIGHT", "CATEGORY");
                    println!("{}", "-".repeat(66));
                    for p in patterns {
                        println!(
                            "{:<12} {:<24} {:>6} {:>8.1} {:<12}",
                            p.pattern_type,
                            truncate(&p.pattern_value, 22),
                            p.occurrence_count,
                            p.weight_adjustment,
                            p.profile_category.as_deref().unwrap_or("-")
                        );
                    }
                }
            }

            PatternCommands::Weights { history, category } => {
                if history || category.is_some() {
                    let ledger = db.list_weight_adjustments(category.as_deref())?;
                    if ledger.is_empty() {
                        println!("No weight adjustments recorded.");
                    }
                    for entry in ledger {
                        println!(
                            "#{:<5} {:<12} {:>7.1} -> {:>7.1} ({:+.1})  {}",
                            entry.id,
                            entry.category,
                            entry.old_weight,
                            entry.new_weight,
                            entry.delta(),
                            entry.reason.as_deref().unwrap_or("")
                        );
                    }
                } else {
                    let totals = db.current_adjustments()?;
                    if totals.is_empty() {
                        println!("No weight adjustments recorded.");
                    }
                    for (category, total) in totals {
                        println!("{:<12} {:+.1}", category, total);
                    }
                }
            }

            PatternCommands::Reset => {
                let removed = db.reset_weight_adjustments()?;
                println!("Cleared {} weight adjustment(s).", removed);
            }
        },

        Commands::Run { command } => {
            let (kind, args) = match command {
                RunCommands::Search(args) => (OperationKind::Search, args),
                RunCommands::Leads(args) => (OperationKind::Leads, args),
                RunCommands::Apply(args) => (OperationKind::Apply, args),
            };
            run_batch(db, settings, model, kind, args).await?;
        }

        Commands::Runs { command } => match command {
            RunsCommands::List { operation, limit } => {
                let operation = operation.as_deref().map(str::parse::<OperationKind>).transpose()?;
                let runs = db.list_runs(operation, limit)?;
                if runs.is_empty() {
                    println!("No runs recorded.");
                } else {
                    println!(
                        "{:<6} {:<8} {:<12} {:>9} {:>6} {:>6}  {:<20} {}",
                        "ID", "OP", "STATUS", "PROCESSED", "ADDED", "FAILED", "STARTED", "CURSOR"
                    );
                    println!("{}", "-".repeat(90));
                    for run in runs {
                        println!(
                            "{:<6} {:<8} {:<12} {:>9} {:>6} {:>6}  {:<20} {}",
                            run.id,
                            run.operation,
                            run.status.as_str(),
                            run.items_processed,
                            run.items_added,
                            run.items_failed,
                            run.created_at.format("%Y-%m-%d %H:%M:%S"),
                            run.last_cursor.as_deref().unwrap_or("-")
                        );
                    }
                }
            }

            RunsCommands::Status => {
                let status = Orchestrator::new(db.clone(), settings.pace).status()?;
                println!("State:     {}", status.state);
                if let (Some(operation), Some(run_id)) = (status.operation, status.run_id) {
                    println!("Run:       {} #{}", operation, run_id);
                }
                if let Some(pid) = status.pid {
                    println!("Owner pid: {}", pid);
                }
                if let Some(error) = &status.error {
                    println!("Error:     {}", error);
                }
            }

            RunsCommands::Stop { run_id } => {
                if db.request_stop(run_id)? {
                    println!("Stop requested for run #{}; its process will stop at the next safe point.", run_id);
                } else {
                    println!("Run #{} is not in progress.", run_id);
                }
            }

            RunsCommands::Reconcile { run_id } => {
                let orchestrator = Orchestrator::new(db.clone(), settings.pace);
                let run = orchestrator.reconcile(run_id)?;
                println!("Run #{} marked {}.", run.id, run.status.as_str());
            }
        },

        Commands::Prefs { command } => match command {
            PrefCommands::Get { key } => match db.get_preference(&key)? {
                Some(value) => println!("{}", value),
                None => println!("Preference '{}' is not set.", key),
            },
            PrefCommands::Set { key, value } => {
                db.set_preference(&key, &value)?;
                println!("Set {}.", key);
            }
            PrefCommands::List => {
                for (key, value) in db.list_preferences()? {
                    println!("{} = {}", key, value);
                }
            }
        },
    }

    Ok(())
}

/// Starts a batch, echoes its log until it ends, and turns Ctrl-C into a
/// cooperative stop.
async fn run_batch(
    db: &Database,
    settings: &Settings,
    model: Option<&str>,
    kind: OperationKind,
    args: RunArgs,
) -> Result<()> {
    let config = match (&args.config, args.resume) {
        (Some(payload), _) => RunConfig::parse(payload)?,
        (None, Some(run_id)) => db
            .get_run(run_id)?
            .ok_or(RunError::RunNotFound(run_id))?
            .filters
            .unwrap_or_default(),
        (None, None) => return Err(anyhow!("--config is required unless resuming with --resume")),
    };

    let operation = build_operation(kind, &config, model)?;
    let orchestrator = Orchestrator::new(db.clone(), settings.pace);
    let mut logs = orchestrator.subscribe();
    let record = orchestrator.start(
        StartRequest {
            config,
            resume: args.resume,
        },
        operation,
    )?;

    let mut status = orchestrator.watch_status();
    let mut stopping = false;
    loop {
        tokio::select! {
            line = logs.recv() => match line {
                Ok(line) => println!("{}", line),
                Err(RecvError::Lagged(missed)) => eprintln!("... {} log line(s) dropped", missed),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal.context("Failed to listen for Ctrl-C")?;
                stopping = true;
                eprintln!("Stopping after the current item...");
                orchestrator.stop()?;
            }
            _ = status.wait_for(|s| !s.state.is_active()) => break,
        }
    }
    while let Ok(line) = logs.try_recv() {
        println!("{}", line);
    }

    let snapshot = orchestrator.wait().await?;
    let run = db.get_run(record.id)?.ok_or(RunError::RunNotFound(record.id))?;
    println!(
        "Run #{} {}: {} processed, {} added, {} failed",
        run.id,
        run.status.as_str(),
        run.items_processed,
        run.items_added,
        run.items_failed
    );
    match snapshot.error {
        Some(error) => Err(anyhow!(error)),
        None => Ok(()),
    }
}

fn build_operation(kind: OperationKind, config: &RunConfig, model: Option<&str>) -> Result<Box<dyn BatchOperation>> {
    Ok(match kind {
        OperationKind::Search => {
            let search = config.search();
            let feed = search
                .feed
                .ok_or_else(|| RunError::InvalidConfig("search.feed is required".into()))?;
            let ranker: Box<dyn Ranker> = match search.model.as_deref().or(model) {
                Some(name) => Box::new(AiRanker::new(resolve_model(name)?)),
                None => Box::new(KeywordRanker),
            };
            let source = FileJobSource::open(&feed)?;
            tracing::info!(feed = %feed.display(), pages = source.page_count(), "Loaded job feed");
            Box::new(SearchOperation::new(Box::new(source), ranker))
        }
        OperationKind::Leads => {
            let feed = config
                .leads()
                .feed
                .ok_or_else(|| RunError::InvalidConfig("leads.feed is required".into()))?;
            Box::new(LeadScrapeOperation::new(Box::new(FileLeadSource::open(&feed)?)))
        }
        OperationKind::Apply => {
            let replay = config
                .apply()
                .replay
                .ok_or_else(|| RunError::InvalidConfig("apply.replay is required".into()))?;
            Box::new(ApplyOperation::new(Box::new(ReplayDriver::open(&replay)?)))
        }
    })
}

fn print_list(heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{}:", heading);
    for item in items {
        println!("  - {}", item);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max.saturating_sub(3)).collect::<String>())
    }
}
