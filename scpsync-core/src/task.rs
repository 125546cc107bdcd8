use crate::{
    command,
    config::SyncConfig,
    error::{Result, SyncError},
    filter,
    mapper::PathMapper,
    remote::RemoteSession,
};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch::{self, Ref};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stage of a run. A run only ever moves forward through these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Resolving,
    Cleaning,
    Provisioning,
    Transferring { index: usize, total: usize },
    Done { success: bool },
}

#[derive(Debug)]
pub enum TransferStatus {
    Succeeded,
    Failed(SyncError),
    /// never attempted, or aborted before completion
    Skipped,
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub local: PathBuf,
    pub remote_dir: String,
    pub status: TransferStatus,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// one entry per resolved file, in resolved order
    pub outcomes: Vec<TransferOutcome>,
    pub cleaned: bool,
    pub directories_created: usize,
    /// the run was cancelled before every file was attempted
    pub cancelled: bool,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, TransferStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TransferStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, TransferStatus::Skipped))
    }

    fn count(&self, f: impl Fn(&TransferStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.status)).count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.succeeded() == self.outcomes.len()
    }

    pub fn first_error(&self) -> Option<&SyncError> {
        self.outcomes.iter().find_map(|o| match &o.status {
            TransferStatus::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Fold the report into a single verdict: `SyncError::Cancelled` for a
    /// cancelled run, `SyncError::Incomplete` for failed uploads. Both carry
    /// the first upload failure.
    pub fn into_result(self) -> Result<SyncReport> {
        if self.is_success() {
            return Ok(self);
        }
        let failed = self.failed();
        let total = self.outcomes.len();
        let cancelled = self.cancelled;
        let first = self.outcomes.into_iter().find_map(|o| match o.status {
            TransferStatus::Failed(e) => Some(e),
            _ => None,
        });
        match first {
            Some(first) if !cancelled => Err(SyncError::Incomplete {
                failed,
                total,
                first: Box::new(first),
            }),
            first => Err(SyncError::Cancelled {
                first: first.map(Box::new),
            }),
        }
    }

    fn skip_remaining(&mut self, plan: Vec<(PathBuf, String)>) {
        self.cancelled = true;
        self.outcomes
            .extend(plan.into_iter().map(|(local, remote_dir)| TransferOutcome {
                local,
                remote_dir,
                status: TransferStatus::Skipped,
            }));
    }
}

/// Remote folders already created (or found) during this run.
#[derive(Debug, Default)]
struct DirCache {
    known: HashSet<String>,
}

impl DirCache {
    fn contains(&self, dir: &str) -> bool {
        self.known.contains(dir)
    }

    fn insert(&mut self, dir: String) {
        self.known.insert(dir);
    }
}

/// Public handle returned to callers for a spawned sync run.
#[derive(Debug)]
pub struct SyncTaskHandle {
    cfg: SyncConfig,
    state_rx: watch::Receiver<SyncState>,
    join: JoinHandle<Result<SyncReport>>,
}

impl SyncTaskHandle {
    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn state(&self) -> Ref<'_, SyncState> {
        self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    pub async fn wait(self) -> Result<SyncReport> {
        self.join
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }
}

/// One run of a copy job against one remote session.
pub struct SyncTask<R: RemoteSession> {
    cfg: SyncConfig,
    session: R,
    mapper: PathMapper,
    state_tx: watch::Sender<SyncState>,
}

impl<R: RemoteSession> SyncTask<R> {
    pub fn new(cfg: SyncConfig, session: R) -> Self {
        let mapper = PathMapper::new(&cfg.source, &cfg.target, cfg.flatten_folders);
        let (state_tx, _) = watch::channel(SyncState::Idle);
        Self {
            cfg,
            session,
            mapper,
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Run the job to completion.
    ///
    /// Resolution, clean and provisioning errors abort the run and are
    /// returned as `Err`. Upload failures and cancellation are recorded in
    /// the report; use [`SyncReport::into_result`] for a single verdict.
    pub async fn run(self, cancel: Option<watch::Receiver<bool>>) -> Result<SyncReport> {
        let mut cancel = cancel.unwrap_or_else(|| {
            let (_, rx) = watch::channel(false);
            rx
        });
        let result = self.run_stages(&mut cancel).await;
        let success = matches!(&result, Ok(report) if report.is_success());
        match &result {
            Ok(report) if report.cancelled => warn!(
                job = %self.cfg.name,
                copied = report.succeeded(),
                failed = report.failed(),
                skipped = report.skipped(),
                "sync cancelled"
            ),
            Ok(report) => info!(
                job = %self.cfg.name,
                copied = report.succeeded(),
                failed = report.failed(),
                skipped = report.skipped(),
                "sync finished"
            ),
            Err(e) => error!(job = %self.cfg.name, "sync aborted: {e}"),
        }
        self.set_state(SyncState::Done { success });
        result
    }

    async fn run_stages(&self, cancel: &mut watch::Receiver<bool>) -> Result<SyncReport> {
        self.set_state(SyncState::Resolving);
        let files = filter::resolve(&self.cfg.source, &self.cfg.contents)?;
        if files.is_empty() {
            info!(job = %self.cfg.name, "no files matched the patterns, nothing to copy");
            return Ok(SyncReport::default());
        }
        info!(job = %self.cfg.name, files = files.len(), "resolved files to copy");

        // map everything before the first remote side effect
        let plan = files
            .into_iter()
            .map(|local| {
                let dir = self.mapper.remote_dir(&local)?;
                Ok((local, dir))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = SyncReport::default();
        let target = self.mapper.target().to_string();

        if self.cfg.clean_target {
            if *cancel.borrow() {
                report.skip_remaining(plan);
                return Ok(report);
            }
            self.set_state(SyncState::Cleaning);
            info!(target = %target, "cleaning target folder");
            self.run_checked(&command::remove_recursive(&target)).await?;
            report.cleaned = true;
        }

        if *cancel.borrow() {
            report.skip_remaining(plan);
            return Ok(report);
        }
        self.set_state(SyncState::Provisioning);
        let mut cache = DirCache::default();
        if self.provision(&mut cache, &target).await? {
            report.directories_created += 1;
        }

        if self.cfg.concurrency <= 1 {
            self.transfer_sequential(plan, &mut cache, &mut report, cancel)
                .await?;
        } else {
            for (_, dir) in &plan {
                if *cancel.borrow() {
                    break;
                }
                if self.provision(&mut cache, dir).await? {
                    report.directories_created += 1;
                }
            }
            if *cancel.borrow() {
                report.skip_remaining(plan);
                return Ok(report);
            }
            report.outcomes = self.transfer_concurrent(plan, cancel).await;
        }

        // a cancel that arrives after the last upload changes nothing
        report.cancelled = *cancel.borrow() && report.skipped() > 0;
        Ok(report)
    }

    async fn transfer_sequential(
        &self,
        plan: Vec<(PathBuf, String)>,
        cache: &mut DirCache,
        report: &mut SyncReport,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let total = plan.len();
        let mut abort = false;
        for (i, (local, remote_dir)) in plan.into_iter().enumerate() {
            if abort || *cancel.borrow() {
                report.outcomes.push(TransferOutcome {
                    local,
                    remote_dir,
                    status: TransferStatus::Skipped,
                });
                continue;
            }
            self.set_state(SyncState::Transferring { index: i + 1, total });
            if self.provision(cache, &remote_dir).await? {
                report.directories_created += 1;
            }
            let status = self.upload_with_retry(&local, &remote_dir, cancel).await;
            if let TransferStatus::Failed(e) = &status {
                abort = e.is_fatal();
            }
            report.outcomes.push(TransferOutcome {
                local,
                remote_dir,
                status,
            });
        }
        Ok(())
    }

    /// Every folder already exists here, so uploads are independent.
    async fn transfer_concurrent(
        &self,
        plan: Vec<(PathBuf, String)>,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<TransferOutcome> {
        let total = plan.len();
        let abort = AtomicBool::new(false);
        let done = AtomicUsize::new(0);
        debug!(concurrency = self.cfg.concurrency, total, "uploading concurrently");
        // `buffered` yields in input order, whatever order uploads finish in
        stream::iter(plan)
            .map(|(local, remote_dir)| {
                let mut cancel = cancel.clone();
                let abort = &abort;
                let done = &done;
                async move {
                    if abort.load(Ordering::SeqCst) || *cancel.borrow() {
                        return TransferOutcome {
                            local,
                            remote_dir,
                            status: TransferStatus::Skipped,
                        };
                    }
                    let status = self.upload_with_retry(&local, &remote_dir, &mut cancel).await;
                    if matches!(&status, TransferStatus::Failed(e) if e.is_fatal()) {
                        abort.store(true, Ordering::SeqCst);
                    }
                    let index = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(SyncState::Transferring { index, total });
                    TransferOutcome {
                        local,
                        remote_dir,
                        status,
                    }
                }
            })
            .buffered(self.cfg.concurrency)
            .collect()
            .await
    }

    /// Create `dir` unless this run already did. Returns whether a command was sent.
    async fn provision(&self, cache: &mut DirCache, dir: &str) -> Result<bool> {
        if cache.contains(dir) {
            return Ok(false);
        }
        self.run_checked(&command::mkdir_if_absent(dir)).await?;
        debug!(dir, "remote folder ready");
        cache.insert(dir.to_string());
        Ok(true)
    }

    async fn run_checked(&self, cmd: &str) -> Result<()> {
        debug!(command = cmd, "running remote command");
        let out = self.session.run_command(cmd).await?;
        if !out.is_success() {
            return Err(SyncError::command(cmd, out.combined()));
        }
        Ok(())
    }

    async fn upload_with_retry(
        &self,
        local: &Path,
        remote_dir: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> TransferStatus {
        let mut attempt: u32 = 0;
        let mut backoff = self.cfg.retry_backoff_ms;
        loop {
            let res = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => return TransferStatus::Skipped,
                res = self.session.upload_file(local, remote_dir) => res,
            };
            match res {
                Ok(()) => {
                    info!(file = %local.display(), dir = remote_dir, "copied");
                    return TransferStatus::Succeeded;
                }
                Err(e) if e.is_fatal() || attempt >= self.cfg.retry_max => {
                    warn!(file = %local.display(), dir = remote_dir, "copy failed: {e}");
                    return TransferStatus::Failed(e);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(file = %local.display(), attempt, "copy failed, retrying: {e}");
                    tokio::select! {
                        biased;
                        _ = wait_cancelled(cancel) => return TransferStatus::Skipped,
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    fn set_state(&self, state: SyncState) {
        debug!(state = ?state, "sync state");
        self.state_tx.send_replace(state);
    }
}

/// Resolves once the flag is set. Never resolves if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn spawn_task<R: RemoteSession>(
    cfg: SyncConfig,
    session: R,
    cancel: Option<watch::Receiver<bool>>,
) -> SyncTaskHandle {
    let task = SyncTask::new(cfg.clone(), session);
    let state_rx = task.subscribe();
    let join = tokio::spawn(task.run(cancel));
    SyncTaskHandle {
        cfg,
        state_rx,
        join,
    }
}

/// Run a job and fold the outcome into a single result.
pub async fn sync<R: RemoteSession>(cfg: SyncConfig, session: R) -> Result<SyncReport> {
    SyncTask::new(cfg, session).run(None).await?.into_result()
}
