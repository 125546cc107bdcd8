use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use scpsync_core::{spawn_task, SyncConfig, SyncError};
use scpsync_remote_ssh::SshSession;
use std::{fs, path::Path};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scpsync", version, about = "scpsync – copy files to a remote host over SSH")]
struct Cli {
    /// Path to config file (YAML / JSON)
    #[arg(short, long, default_value = "scpsync.yaml")]
    config: String,

    /// Only run the job with this name
    #[arg(short, long)]
    job: Option<String>,

    /// Remove each target folder before copying
    #[arg(long)]
    clean: bool,

    /// Number of uploads in flight per job
    #[arg(long)]
    concurrency: Option<usize>,

    /// Log level: error, warn, info, debug, trace
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

fn setup_logging(verbosity: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_jobs(path: &str) -> Result<Vec<SyncConfig>> {
    let text = fs::read_to_string(path).map_err(|e| anyhow!("read config {path} failed: {e}"))?;

    // Detect format by extension
    let ext = Path::new(path).extension().and_then(|s| s.to_str()).unwrap_or("");
    let jobs: Vec<SyncConfig> = match ext {
        "json" => serde_json::from_str(&text).with_context(|| format!("parse {path}"))?,
        // default to yaml
        _ => serde_yaml::from_str(&text).with_context(|| format!("parse {path}"))?,
    };
    if jobs.is_empty() {
        bail!("no jobs defined in config");
    }
    Ok(jobs)
}

fn select_jobs(jobs: Vec<SyncConfig>, cli: &Cli) -> Result<Vec<SyncConfig>> {
    let mut jobs: Vec<SyncConfig> = match &cli.job {
        Some(name) => jobs.into_iter().filter(|j| &j.name == name).collect(),
        None => jobs,
    };
    if jobs.is_empty() {
        bail!("no job named {:?} in {}", cli.job.as_deref().unwrap_or_default(), cli.config);
    }
    for job in &mut jobs {
        if cli.clean {
            job.clean_target = true;
        }
        if let Some(n) = cli.concurrency {
            job.concurrency = n.max(1);
        }
        job.validate()?;
    }
    Ok(jobs)
}

/// Flip the cancel flag on Ctrl-C (and SIGTERM on unix).
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot listen for SIGTERM: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        warn!("Stopping: waiting for in-flight transfers to finish or abort");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, &cli.log_format);

    let jobs = select_jobs(load_jobs(&cli.config)?, &cli)?;
    let cancel = setup_signal_handler();

    let mut failed = 0usize;
    for job in jobs {
        let name = job.name.clone();
        let session = SshSession::new(job.connection.clone())?;
        info!(job = %name, source = %job.source.display(), target = %job.target, "starting");
        let handle = spawn_task(job, session, Some(cancel.clone()));
        match handle.wait().await.and_then(|report| report.into_result()) {
            Ok(report) => info!(
                job = %name,
                copied = report.succeeded(),
                folders = report.directories_created,
                "job succeeded"
            ),
            Err(e @ SyncError::Cancelled { .. }) => {
                error!(job = %name, "job cancelled: {e}");
                bail!("cancelled");
            }
            Err(e) => {
                error!(job = %name, "job failed: {e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}
