//! Backspace CLI - sandboxed, validated code changes
//!
//! Usage:
//!   backspace run --repo-url <url> --prompt <text>   Run one job, stream its progress
//!   backspace serve                                   Start the HTTP/SSE server
//!   backspace reap                                    Remove orphaned workspaces once
//!   backspace init-config [path]                      Write a default backspace.toml

use anyhow::{bail, Context, Result};
use backspace_agent::{CircuitBreaker, LlmGenerator, PatchGenerator};
use backspace_core::{
    config::CONFIG_FILE, BackspaceConfig, JobOutcome, JobRequest, RepositoryRef,
    ValidationCommand,
};
use backspace_github::{GitHubPublisher, Publisher};
use backspace_orchestrator::{AgentLoop, EventKind, JobService, ProgressEvent, StreamItem};
use backspace_sandbox::{
    reap_orphans, spawn_reaper, RepositorySource, ResourceQuotas, WorkspaceManager,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "backspace")]
#[command(author, version, about = "Sandboxed, validated code changes")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./backspace.toml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job in the foreground and print its progress
    Run {
        /// Repository URL or local directory
        #[arg(long = "repo-url", value_name = "URL")]
        repository: String,

        /// What to change, in plain language
        #[arg(long = "prompt", value_name = "TEXT")]
        description: String,

        /// Validation command (repeatable); detected from the tree when absent
        #[arg(long = "check", value_name = "COMMAND")]
        checks: Vec<String>,

        /// Attempts before giving up
        #[arg(long)]
        retries: Option<u32>,

        /// Wall-clock limit for the whole job, in seconds
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,

        /// Workspace size quota in MiB
        #[arg(long = "quota-mb", value_name = "MB", value_parser = parse_quota_mb)]
        quota_bytes: Option<u64>,

        /// Branch to publish on
        #[arg(long)]
        branch: Option<String>,

        /// Stop after validation; do not open a pull request
        #[arg(long)]
        dry_run: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Serve the job API over HTTP with SSE progress streams
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Remove workspace directories with no live job
    Reap {
        /// Minimum age in seconds (overrides config)
        #[arg(long, value_name = "SECS")]
        max_age: Option<u64>,
    },

    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// `--quota-mb` in bytes
fn parse_quota_mb(raw: &str) -> std::result::Result<u64, String> {
    let mb: u64 = raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    if mb == 0 {
        return Err("quota must be at least 1 MiB".to_string());
    }
    mb.checked_mul(MIB)
        .ok_or_else(|| format!("{} MiB does not fit in 64 bits of bytes", mb))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::InitConfig { path, force } = &cli.command {
        return cmd_init_config(path, *force);
    }

    let config = BackspaceConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            repository,
            description,
            checks,
            retries,
            deadline,
            quota_bytes,
            branch,
            dry_run,
            json,
        } => {
            let mut request = JobRequest::new(RepositoryRef::parse(&repository), description);
            for (i, check) in checks.into_iter().enumerate() {
                let name = format!("check-{}", i + 1);
                request = request.with_command(ValidationCommand::new(name, check));
            }
            if let Some(retries) = retries {
                request = request.with_retry_budget(retries);
            }
            if let Some(secs) = deadline {
                request = request.with_deadline(Duration::from_secs(secs));
            }
            if let Some(bytes) = quota_bytes {
                request = request.with_size_quota(bytes);
            }
            if let Some(branch) = branch {
                request = request.with_branch(branch);
            }
            if dry_run {
                request = request.dry_run();
            }
            cmd_run(&config, request, json).await
        }
        Commands::Serve { addr } => cmd_serve(&config, addr).await,
        Commands::Reap { max_age } => cmd_reap(&config, max_age).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn build_workspaces(config: &BackspaceConfig) -> Result<Arc<WorkspaceManager>> {
    std::fs::create_dir_all(&config.sandbox.root).with_context(|| {
        format!(
            "Failed to create sandbox root {}",
            config.sandbox.root.display()
        )
    })?;
    let quotas = ResourceQuotas::new(
        config.sandbox.max_concurrent_jobs,
        config.sandbox.total_budget_bytes,
    );
    Ok(Arc::new(WorkspaceManager::new(
        config.sandbox.root.clone(),
        quotas,
        Arc::new(RepositorySource::new()),
    )))
}

fn build_service(
    config: &BackspaceConfig,
    workspaces: Arc<WorkspaceManager>,
) -> Result<Arc<JobService>> {
    let generator: Arc<dyn PatchGenerator> = Arc::new(
        LlmGenerator::from_config(&config.model)
            .context("Failed to configure the model backend")?
            .with_circuit_breaker(Arc::new(CircuitBreaker::default())),
    );
    let publisher: Arc<dyn Publisher> = Arc::new(GitHubPublisher::from_config(&config.github));
    let agent = AgentLoop::from_config(config, workspaces, generator, publisher);
    Ok(JobService::new(config, Arc::new(agent)))
}

async fn cmd_run(config: &BackspaceConfig, request: JobRequest, json: bool) -> Result<()> {
    let workspaces = build_workspaces(config)?;
    let service = build_service(config, workspaces)?;

    let job_id = service.submit(request).context("Job was rejected")?;
    info!(%job_id, "Job started");

    let mut subscription = service.subscribe(job_id, 0)?;
    let mut interrupted = false;
    loop {
        tokio::select! {
            item = subscription.next() => match item {
                Some(StreamItem::Event(event)) => print_event(&event, json)?,
                Some(StreamItem::ReplayUnavailable { requested, earliest }) => {
                    warn!("Events {}..{} were dropped", requested, earliest);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling job {}", job_id);
                service.cancel(job_id)?;
            }
        }
    }

    let report = service.wait(job_id).await?;
    if json {
        println!("{}", serde_json::to_string(&*report)?);
    } else {
        println!("\n{}", report.outcome.describe());
        match &report.outcome {
            JobOutcome::Accepted { diff, .. } | JobOutcome::PublishFailed { diff, .. } => {
                println!("\n{}", diff.diff);
            }
            JobOutcome::Aborted {
                last_diagnostics: Some(diagnostics),
                ..
            } => println!("\n{}", diagnostics),
            JobOutcome::Aborted { .. } => {}
        }
    }

    if !report.outcome.is_accepted() {
        bail!("Job {} was not accepted", job_id);
    }
    Ok(())
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let line = match &event.kind {
        EventKind::JobStarted {
            repository,
            retry_budget,
            ..
        } => format!("Starting job on {} ({} attempts)", repository, retry_budget),
        EventKind::Materialized { bytes } => format!("Workspace ready ({} KiB)", bytes / 1024),
        EventKind::AttemptStarted { attempt } => format!("Attempt {}", attempt),
        EventKind::GenerationComplete { edits, summary, .. } => match summary {
            Some(summary) => format!("  generated {} edits: {}", edits, summary),
            None => format!("  generated {} edits", edits),
        },
        EventKind::ApplyConflict { detail, .. } => format!("  apply conflict: {}", detail),
        EventKind::ApplyComplete { files, .. } => {
            let paths: Vec<String> = files
                .iter()
                .map(|f| format!("{} ({})", f.path, f.kind))
                .collect();
            format!("  applied: {}", paths.join(", "))
        }
        EventKind::CommandFinished {
            name,
            passed,
            exit_code,
            timed_out,
        } => {
            let status = if *passed {
                "ok".to_string()
            } else if *timed_out {
                "timed out".to_string()
            } else {
                match exit_code {
                    Some(code) => format!("exit {}", code),
                    None => "killed".to_string(),
                }
            };
            format!("  check {}: {}", name, status)
        }
        EventKind::ValidationComplete { passed, .. } => {
            format!("  validation {}", if *passed { "passed" } else { "failed" })
        }
        EventKind::AttemptRevising { attempt, .. } => {
            format!("  revising after attempt {}", attempt)
        }
        EventKind::JobAccepted { diff } => format!("Accepted: {}", diff.summary()),
        EventKind::PublishStarted => "Publishing".to_string(),
        EventKind::Published { reference } => format!("Published {}", reference.url),
        EventKind::PublishFailed { reason } => format!("Publishing failed: {}", reason),
        EventKind::JobAborted { reason, message, .. } => {
            format!("Aborted ({}): {}", reason, message)
        }
        EventKind::WorkspaceTornDown => "Workspace removed".to_string(),
    };
    println!("[{:>3}] {}", event.seq, line);
    Ok(())
}

async fn cmd_serve(config: &BackspaceConfig, addr: Option<String>) -> Result<()> {
    let workspaces = build_workspaces(config)?;
    let service = build_service(config, Arc::clone(&workspaces))?;
    let mut server = config.server.clone();
    if let Some(addr) = addr {
        server.addr = addr;
    }

    let stop = CancellationToken::new();
    let reaper = spawn_reaper(
        Arc::clone(&workspaces),
        Duration::from_secs(config.sandbox.orphan_max_age_secs),
        Duration::from_secs(60),
        stop.clone(),
    );
    let sweeper = service.spawn_sweeper(Duration::from_secs(60));

    let shutdown = {
        let service = Arc::clone(&service);
        let stop = stop.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
            service.shutdown();
            stop.cancel();
        }
    };

    backspace_server::serve(service, &server, shutdown)
        .await
        .with_context(|| format!("Server on {} failed", server.addr))?;

    stop.cancel();
    reaper.await.ok();
    sweeper.await.ok();
    Ok(())
}

async fn cmd_reap(config: &BackspaceConfig, max_age: Option<u64>) -> Result<()> {
    let workspaces = build_workspaces(config)?;
    let max_age = Duration::from_secs(max_age.unwrap_or(config.sandbox.orphan_max_age_secs));

    let removed = reap_orphans(&workspaces, max_age)
        .await
        .context("Failed to reap workspaces")?;
    if removed.is_empty() {
        println!("No orphaned workspaces");
    } else {
        for path in &removed {
            println!("Removed {}", path.display());
        }
        println!("Reaped {} workspace(s)", removed.len());
    }
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    BackspaceConfig::write_default(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "backspace",
            "run",
            "--repo-url",
            "https://github.com/acme/api",
            "--prompt",
            "Add a health endpoint",
            "--check",
            "pytest -q",
            "--check",
            "ruff check .",
            "--retries",
            "5",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Run {
                repository,
                checks,
                retries,
                dry_run,
                ..
            } => {
                assert_eq!(repository, "https://github.com/acme/api");
                assert_eq!(checks, vec!["pytest -q", "ruff check ."]);
                assert_eq!(retries, Some(5));
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_quota_is_converted_to_bytes() {
        let cli = Cli::parse_from([
            "backspace",
            "run",
            "--repo-url",
            "https://github.com/acme/api",
            "--prompt",
            "Add a health endpoint",
            "--quota-mb",
            "512",
        ]);
        match cli.command {
            Commands::Run { quota_bytes, .. } => assert_eq!(quota_bytes, Some(512 * MIB)),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_oversized_quota_is_a_usage_error() {
        let result = Cli::try_parse_from([
            "backspace",
            "run",
            "--repo-url",
            "https://github.com/acme/api",
            "--prompt",
            "Add a health endpoint",
            "--quota-mb",
            "18446744073709551615",
        ]);
        let error = match result {
            Err(error) => error,
            Ok(_) => panic!("u64::MAX MiB was accepted"),
        };
        assert_eq!(error.kind(), clap::error::ErrorKind::ValueValidation);
        assert!(error.to_string().contains("does not fit"));

        assert!(parse_quota_mb("0").is_err());
        assert!(parse_quota_mb("-1").is_err());
        assert_eq!(parse_quota_mb(&(u64::MAX / MIB).to_string()), Ok((u64::MAX / MIB) * MIB));
    }

    #[test]
    fn test_init_config_writes_then_refuses() {
        let dir = std::env::temp_dir().join(format!("backspace-cli-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        let _ = std::fs::remove_dir_all(&dir);

        cmd_init_config(&path, false).unwrap();
        assert!(BackspaceConfig::load_or_default(Some(&path)).is_ok());
        assert!(cmd_init_config(&path, false).is_err());
        assert!(cmd_init_config(&path, true).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
