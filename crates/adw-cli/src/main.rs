use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use adw::allocator::ResourceAllocator;
use adw::broadcast::BroadcastHub;
use adw::config::AdwConfig;
use adw::events::EventLog;
use adw::history::HistoryRecorder;
use adw::orchestrator::Orchestrator;
use adw::queue::PhaseQueue;
use adw::state_store::RunStateStore;
use adw::webhook::{IntakePayload, WebhookGateway, WebhookSink, WorkflowCompletePayload};
use adw::webhook_store::WebhookEventStore;
use adw_types::{QueueStatus, WorkflowTemplate};

mod progress;

/// Process exited cleanly, nothing left to report.
const EXIT_OK: i32 = 0;
/// Unclassified failure surfaced as an `anyhow::Error`.
const EXIT_GENERAL: i32 = 1;
/// `adw.toml` failed to load or parse.
const EXIT_CONFIG: i32 = 2;
/// A phase's Requires/Produces contract was violated.
const EXIT_CONTRACT_BREACH: i32 = 3;
/// The named run id has no queue rows or state document.
const EXIT_NOT_FOUND: i32 = 4;
/// Bad CLI arguments caught before any orchestration work started.
const EXIT_USAGE: i32 = 5;

#[derive(Parser, Debug)]
#[command(name = "adw", version)]
#[command(about = "Ten-phase agentic development workflow orchestrator")]
struct Cli {
    /// Path to `adw.toml` (defaults to `<repo-root>/adw.toml` if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for run state documents, the event log, and worktrees.
    #[arg(long, global = true, default_value = ".adw")]
    state_dir: PathBuf,

    /// Path to the phase queue SQLite database (default: `<state-dir>/queue.db`).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Path to the history SQLite database (default: `<state-dir>/history.db`).
    #[arg(long, global = true)]
    history_db_path: Option<PathBuf>,

    /// Repository root the orchestrator provisions worktrees against.
    #[arg(long, global = true, default_value = ".")]
    repo_root: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WorkflowTemplateArg {
    SinglePhase,
    MultiPhase,
    FullSdlc,
}

impl From<WorkflowTemplateArg> for WorkflowTemplate {
    fn from(v: WorkflowTemplateArg) -> Self {
        match v {
            WorkflowTemplateArg::SinglePhase => WorkflowTemplate::SinglePhase,
            WorkflowTemplateArg::MultiPhase => WorkflowTemplate::MultiPhase,
            WorkflowTemplateArg::FullSdlc => WorkflowTemplate::FullSdlc,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed a new run and enqueue all ten phases (`Plan` starts ready).
    Plan {
        /// Run id to seed. Defaults to `adw-<issue>` if `--issue` is given.
        run_id: Option<String>,
        /// External issue id driving this run, if any.
        #[arg(long)]
        issue: Option<u64>,
        /// Workflow template to seed.
        #[arg(long, value_enum, default_value = "full-sdlc")]
        template: WorkflowTemplateArg,
    },
    /// Drive the phase queue, processing ready phases until none remain.
    Run {
        /// Exit once this run reaches a terminal state, instead of running
        /// until interrupted.
        run_id: Option<String>,
    },
    /// Start the Webhook Gateway and Broadcast Hub alongside the worker pool.
    Serve,
    /// Print the phase queue rows and run state document for a run.
    Status {
        run_id: String,
    },
    /// Print environment, configuration, and external-tool diagnostics.
    Doctor,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("[error] {e:#}");
            std::process::ExitCode::from(classify_error(&e) as u8)
        }
    }
}

fn classify_error(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<adw::error::ValidatorError>().is_some() {
        return EXIT_CONTRACT_BREACH;
    }
    if e.downcast_ref::<adw::error::StateStoreError>()
        .is_some_and(|e| matches!(e, adw::error::StateStoreError::NotFound(_)))
    {
        return EXIT_NOT_FOUND;
    }
    EXIT_GENERAL
}

fn dispatch(cli: Cli) -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let repo_root = cli
        .repo_root
        .canonicalize()
        .unwrap_or_else(|_| cli.repo_root.clone());

    let config = match &cli.config {
        Some(path) => AdwConfig::load_from_file(path).context("loading adw.toml")?,
        None => AdwConfig::load_from_workspace(&repo_root).context("loading adw.toml")?,
    }
    .apply_env_overrides();

    let state_dir = cli.state_dir.clone();
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| state_dir.join("queue.db"));
    let history_db_path = cli
        .history_db_path
        .clone()
        .unwrap_or_else(|| state_dir.join("history.db"));
    let worktree_base = repo_root.join(&config.resources.worktree_base_dir);

    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    match cli.cmd {
        Commands::Plan {
            run_id,
            issue,
            template,
        } => cmd_plan(
            &state_dir,
            &db_path,
            &worktree_base,
            run_id,
            issue,
            template.into(),
        ),
        Commands::Run { run_id } => cmd_run(
            &repo_root,
            &state_dir,
            &db_path,
            &history_db_path,
            &worktree_base,
            config,
            run_id,
        ),
        Commands::Serve => cmd_serve(
            &repo_root,
            &state_dir,
            &db_path,
            &history_db_path,
            &worktree_base,
            config,
        ),
        Commands::Status { run_id } => cmd_status(
            &repo_root,
            &state_dir,
            &db_path,
            &history_db_path,
            &worktree_base,
            config,
            &run_id,
        ),
        Commands::Doctor => cmd_doctor(&repo_root, &cli.config, &config),
    }
}

fn open_orchestrator(
    repo_root: &std::path::Path,
    state_dir: &std::path::Path,
    db_path: &std::path::Path,
    history_db_path: &std::path::Path,
    worktree_base: &std::path::Path,
    config: AdwConfig,
) -> Result<Arc<Orchestrator>> {
    let queue = PhaseQueue::open(db_path).context("opening phase queue database")?;
    let history = HistoryRecorder::open(history_db_path).context("opening history database")?;
    let state_store = RunStateStore::new(state_dir.to_path_buf());
    let allocator = ResourceAllocator::new(state_dir.to_path_buf(), worktree_base.to_path_buf());
    let events = EventLog::new(state_dir.to_path_buf());
    let broadcast = BroadcastHub::new();

    Ok(Orchestrator::new(
        queue,
        state_store,
        allocator,
        history,
        events,
        broadcast,
        config,
        repo_root.to_path_buf(),
    ))
}

fn cmd_plan(
    state_dir: &std::path::Path,
    db_path: &std::path::Path,
    worktree_base: &std::path::Path,
    run_id: Option<String>,
    issue: Option<u64>,
    template: WorkflowTemplate,
) -> Result<i32> {
    let run_id = match (run_id, issue) {
        (Some(id), _) => id,
        (None, Some(issue)) => format!("adw-{issue}"),
        (None, None) => bail!("either a run id or --issue must be given"),
    };

    let orchestrator = open_orchestrator(
        std::path::Path::new("."),
        state_dir,
        db_path,
        &state_dir.join("history.db"),
        worktree_base,
        AdwConfig::default(),
    )?;
    orchestrator.start_run(&run_id, issue, template)?;
    println!("seeded run {run_id} ({template:?})");
    Ok(EXIT_OK)
}

fn cmd_run(
    repo_root: &std::path::Path,
    state_dir: &std::path::Path,
    db_path: &std::path::Path,
    history_db_path: &std::path::Path,
    worktree_base: &std::path::Path,
    config: AdwConfig,
    run_id: Option<String>,
) -> Result<i32> {
    let orchestrator = open_orchestrator(
        repo_root, state_dir, db_path, history_db_path, worktree_base, config,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&orchestrator).run_forever(shutdown_rx));

        match run_id {
            Some(run_id) => {
                let mut reporter = progress::ProgressReporter::new(10);
                loop {
                    let (rows, _state) = orchestrator.run_snapshot(&run_id)?;
                    for row in &rows {
                        reporter.set_phase(
                            row.phase_number as usize,
                            &format!("{:?}", row.phase_name),
                            &format!("{:?}", row.status),
                        );
                    }
                    if rows.iter().all(|r| r.status.is_terminal()) && !rows.is_empty() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                reporter.finish();
            }
            None => {
                tokio::signal::ctrl_c().await.ok();
            }
        }

        let _ = shutdown_tx.send(true);
        let _ = worker.await;
        Ok::<_, anyhow::Error>(())
    })?;

    Ok(EXIT_OK)
}

struct OrchestratorSink {
    orchestrator: Arc<Orchestrator>,
}

impl WebhookSink for OrchestratorSink {
    fn on_intake(&self, payload: IntakePayload) -> anyhow::Result<()> {
        let run_id = format!("adw-{}", payload.issue_id);
        self.orchestrator
            .start_run(&run_id, Some(payload.issue_id), WorkflowTemplate::FullSdlc)
    }

    fn on_workflow_complete(&self, payload: WorkflowCompletePayload) -> anyhow::Result<()> {
        let status = match payload.status.to_ascii_lowercase().as_str() {
            "completed" | "success" | "ok" => QueueStatus::Completed,
            "failed" | "error" => QueueStatus::Failed,
            "cancelled" | "canceled" => QueueStatus::Cancelled,
            other => bail!("unrecognized workflow-complete status: {other}"),
        };
        self.orchestrator
            .report_external_completion(&payload.run_id, &payload.queue_id, status)
    }
}

fn cmd_serve(
    repo_root: &std::path::Path,
    state_dir: &std::path::Path,
    db_path: &std::path::Path,
    history_db_path: &std::path::Path,
    worktree_base: &std::path::Path,
    config: AdwConfig,
) -> Result<i32> {
    let bind_addr = config.webhook.bind_addr.clone();
    let secret = if config.webhook.secret.is_empty() {
        bail!("webhook secret not configured; set [webhook].secret in adw.toml or ADW_WEBHOOK_SECRET");
    } else {
        config.webhook.secret.clone()
    };
    let signature_header = config.webhook.signature_header.clone();

    let orchestrator = open_orchestrator(
        repo_root, state_dir, db_path, history_db_path, worktree_base, config,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let webhook_db_path = state_dir.join("webhook_events.db");
    let webhook_store =
        WebhookEventStore::open(&webhook_db_path).context("opening webhook events database")?;

    runtime.block_on(async move {
        let sink = OrchestratorSink {
            orchestrator: Arc::clone(&orchestrator),
        };
        let gateway = WebhookGateway::new(secret, signature_header, sink, webhook_store);
        let app = gateway.router().merge(BroadcastHub::new().router());

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding webhook gateway to {bind_addr}"))?;
        tracing::info!(bind_addr, "webhook gateway listening");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&orchestrator).run_forever(shutdown_rx));

        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        });

        let result = server.await;
        let _ = shutdown_tx.send(true);
        let _ = worker.await;
        result.context("webhook gateway server error")
    })?;

    Ok(EXIT_OK)
}

fn cmd_status(
    repo_root: &std::path::Path,
    state_dir: &std::path::Path,
    db_path: &std::path::Path,
    history_db_path: &std::path::Path,
    worktree_base: &std::path::Path,
    config: AdwConfig,
    run_id: &str,
) -> Result<i32> {
    let orchestrator = open_orchestrator(
        repo_root, state_dir, db_path, history_db_path, worktree_base, config,
    )?;
    let (rows, state) = orchestrator.run_snapshot(run_id)?;

    println!("run_id: {run_id}");
    println!("workflow_template: {:?}", state.workflow_template);
    println!();
    for row in &rows {
        println!(
            "{:>2}. {:<10} {:<10} attempt={}",
            row.phase_number,
            format!("{:?}", row.phase_name),
            format!("{:?}", row.status),
            row.retry_count + 1
        );
    }

    Ok(EXIT_OK)
}

fn cmd_doctor(
    repo_root: &std::path::Path,
    config_path: &Option<PathBuf>,
    config: &AdwConfig,
) -> Result<i32> {
    println!("repo_root: {}", repo_root.display());
    println!(
        "config: {}",
        config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{}/adw.toml (if present)", repo_root.display()))
    );
    println!("webhook.bind_addr: {}", config.webhook.bind_addr);
    println!(
        "webhook.secret: {}",
        if config.webhook.secret.is_empty() {
            "not configured"
        } else {
            "configured"
        }
    );
    println!(
        "resources: backend {}-{}, frontend {}-{}, max_concurrent_runs={}",
        config.resources.backend_port_start,
        config.resources.backend_port_end,
        config.resources.frontend_port_start,
        config.resources.frontend_port_end,
        config.resources.max_concurrent_runs,
    );
    println!();

    print_cmd_version("cargo");
    print_cmd_version("git");

    Ok(EXIT_OK)
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => {
            eprintln!(
                "[warn] {cmd} --version failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            );
        }
        Err(e) => {
            eprintln!("[warn] unable to run {cmd} --version: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_template_arg_converts_to_domain_enum() {
        assert!(matches!(
            WorkflowTemplate::from(WorkflowTemplateArg::FullSdlc),
            WorkflowTemplate::FullSdlc
        ));
        assert!(matches!(
            WorkflowTemplate::from(WorkflowTemplateArg::SinglePhase),
            WorkflowTemplate::SinglePhase
        ));
    }

    #[test]
    fn print_cmd_version_reports_missing_command() {
        print_cmd_version("definitely-not-a-real-command-adw");
    }

    #[test]
    fn classify_error_defaults_to_general() {
        let e = anyhow::anyhow!("boom");
        assert_eq!(classify_error(&e), EXIT_GENERAL);
    }
}
