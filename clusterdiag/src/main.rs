//! clusterdiag - request and collect diagnostics from every instance of a
//! horizontally scaled service that shares a file system
//!
//! Operators use `submit`, `list`, `show` and `complete`; every instance runs
//! `clusterdiag run --watch` as its scheduler.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/clusterdiag/config.toml (~/.config/clusterdiag/config.toml)
//! - Logs: $XDG_STATE_HOME/clusterdiag/clusterdiag.log (~/.local/state/clusterdiag/clusterdiag.log)
//! - Sessions: `storage.root` from config, default $XDG_DATA_HOME/clusterdiag/sessions

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use clusterdiag_core::format::{format_relative_time, format_session_duration, format_size};
use clusterdiag_core::logging;
use clusterdiag_core::{
    Config, DiagnosticTool, Error, PollAction, RunReport, Session, SessionCoordinator,
};
use process_lock::acquire_agent_guard;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "clusterdiag")]
#[command(about = "Cluster-wide diagnostics capture over a shared file system")]
#[command(version)]
struct Args {
    /// Verbose output (-v shows artifacts and errors, -vv also logs to stderr)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new diagnostics session
    Submit {
        /// Capture kind (memory-dump, profiler)
        #[arg(short, long)]
        tool: DiagnosticTool,

        /// Instance expected to collect (repeat for each instance)
        #[arg(short, long = "instance", required = true)]
        instances: Vec<String>,

        /// Parameters passed through to the capture tool
        #[arg(short, long, default_value = "")]
        params: String,
    },

    /// List all sessions
    List,

    /// Show one session as JSON
    Show {
        session_id: String,
    },

    /// Act as this instance's scheduler
    Run {
        /// Keep polling instead of running a single tick
        #[arg(short, long)]
        watch: bool,

        /// Poll interval in milliseconds (only with --watch)
        #[arg(long, default_value = "5000")]
        poll: u64,
    },

    /// Run the completion check for a session
    Complete {
        session_id: String,

        /// Complete even if some instances have not reported (marks it timed out)
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = logging::init(&config.logging, logging::console_level(args.verbose))
        .context("failed to initialize logging")?;

    let coordinator = SessionCoordinator::from_config(&config);
    tracing::info!(
        store = %coordinator.store().root().display(),
        instance = %coordinator.identity().full_instance_id(),
        "clusterdiag starting"
    );

    match args.command {
        Command::Submit {
            tool,
            instances,
            params,
        } => submit(&coordinator, tool, instances, params).await,
        Command::List => list(&coordinator, args.verbose).await,
        Command::Show { session_id } => show(&coordinator, &session_id).await,
        Command::Run { watch, poll } => {
            if watch {
                run_watch_mode(&coordinator, &config, poll, args.verbose).await
            } else {
                run_single_tick(&coordinator, args.verbose).await
            }
        }
        Command::Complete { session_id, force } => {
            complete(&coordinator, &session_id, force).await
        }
    }
}

async fn submit(
    coordinator: &SessionCoordinator,
    tool: DiagnosticTool,
    instances: Vec<String>,
    params: String,
) -> Result<()> {
    let request = Session::new(Some(tool), params, instances);
    let session_id = coordinator
        .submit_new_session(request)
        .await
        .context("failed to submit session")?;
    println!("{}", session_id);
    Ok(())
}

async fn list(coordinator: &SessionCoordinator, verbose: u8) -> Result<()> {
    let sessions = coordinator
        .get_all_sessions()
        .await
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    for session in &sessions {
        print_session_line(session);
        if verbose >= 1 {
            print_session_details(session);
        }
    }
    Ok(())
}

async fn show(coordinator: &SessionCoordinator, session_id: &str) -> Result<()> {
    let session = coordinator
        .get_session(session_id)
        .await
        .context("failed to read session")?
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

async fn complete(coordinator: &SessionCoordinator, session_id: &str, force: bool) -> Result<()> {
    let session = coordinator
        .get_session(session_id)
        .await
        .context("failed to read session")?
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

    if session.status.is_terminal() {
        println!("Session {} already {}", session_id, session.status);
        return Ok(());
    }

    if coordinator
        .check_and_complete_session_if_needed(&session, force)
        .await
    {
        println!("Session {} completed", session_id);
    } else {
        println!(
            "Session {} still waiting on: {}",
            session_id,
            session.pending_instances().join(", ")
        );
    }
    Ok(())
}

/// Run one scheduler tick
async fn run_single_tick(coordinator: &SessionCoordinator, verbose: u8) -> Result<()> {
    let cancel = CancellationToken::new();
    install_ctrlc(&cancel)?;

    let action = coordinator
        .poll_once(&cancel)
        .await
        .context("scheduler tick failed")?;
    print_poll_action(&action, verbose);
    Ok(())
}

/// Run continuous watch mode
async fn run_watch_mode(
    coordinator: &SessionCoordinator,
    config: &Config,
    poll: u64,
    verbose: u8,
) -> Result<()> {
    let _agent_guard = acquire_agent_guard(
        &config.storage.root(),
        coordinator.identity().full_instance_id(),
    )
    .context("failed to acquire agent lock")?;

    let shutdown = CancellationToken::new();
    install_ctrlc(&shutdown)?;

    let poll_duration = Duration::from_millis(poll);
    println!(
        "Watching for sessions as {} (poll every {}ms). Press Ctrl+C to stop.",
        coordinator.identity().full_instance_id(),
        poll
    );

    let mut iteration = 0u64;
    while !shutdown.is_cancelled() {
        iteration += 1;

        match coordinator.poll_once(&shutdown).await {
            Ok(PollAction::Idle) | Ok(PollAction::NotInScope { .. }) => {}
            Ok(action) => {
                let timestamp = chrono::Local::now().format("%H:%M:%S");
                print!("[{}] ", timestamp);
                print_poll_action(&action, verbose);
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                // Unknown tool and the like are fatal for this session only
                tracing::error!(iteration, error = %e, "Scheduler tick failed");
                eprintln!("Error: {}", e);
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_duration) => {}
        }
    }

    println!("Watch mode stopped.");
    tracing::info!(iterations = iteration, "clusterdiag watch mode stopped");
    Ok(())
}

fn install_ctrlc(token: &CancellationToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        token.cancel();
    })
    .context("failed to set Ctrl+C handler")
}

fn print_poll_action(action: &PollAction, verbose: u8) {
    match action {
        PollAction::Idle => println!("No active session"),
        PollAction::NotInScope { session_id } => {
            println!("Session {}: this instance is not a participant", session_id)
        }
        PollAction::AlreadyCollected {
            session_id,
            session_completed,
        } => {
            if *session_completed {
                println!("Session {}: completed", session_id);
            } else {
                println!("Session {}: already collected, waiting on others", session_id);
            }
        }
        PollAction::Collected(report) => print_run_report(report, verbose),
        PollAction::ForcedCompletion {
            session_id,
            completed,
        } => {
            if *completed {
                println!("Session {}: timed out and closed", session_id);
            } else {
                println!("Session {}: timed out, could not close yet", session_id);
            }
        }
    }
}

fn print_run_report(report: &RunReport, verbose: u8) {
    println!(
        "Session {}: collected {} artifact(s) on {}{}",
        report.session_id,
        report.archived,
        report.instance,
        if report.session_completed {
            ", session completed"
        } else {
            ""
        }
    );
    if report.dropped > 0 {
        println!("  {} artifact(s) could not be archived", report.dropped);
    }
    if verbose >= 1 {
        for (step, outcome) in [
            ("start", &report.started),
            ("record", &report.artifacts_recorded),
            ("complete", &report.marked_complete),
        ] {
            println!("  {}: {:?}", step, outcome);
        }
        for error in &report.tool_errors {
            println!("  tool error: {}", error);
        }
    }
}

fn print_session_line(session: &Session) {
    let tool = session
        .tool
        .map(|t| t.display_name())
        .unwrap_or("(none)");
    let done = session.completed_instances().len();
    println!(
        "{}  {:<10} {:<12} {}/{} instances  started {}  ({})",
        session.session_id,
        session.status,
        tool,
        done,
        session.instances.len(),
        format_relative_time(session.start_time),
        format_session_duration(session.start_time, session.end_time)
    );
}

fn print_session_details(session: &Session) {
    for instance in &session.active_instances {
        println!("    {} [{}]", instance.name, instance.status);
        for log in &instance.logs {
            println!(
                "      {} ({}) {}",
                log.name,
                format_size(log.size),
                log.relative_path.as_deref().unwrap_or("")
            );
        }
        for error in &instance.errors {
            println!("      error: {}", error);
        }
    }
    let pending = session.pending_instances();
    if !pending.is_empty() && !session.status.is_terminal() {
        println!("    waiting on: {}", pending.join(", "));
    }
}
