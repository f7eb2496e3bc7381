//! Job Service - submission, status, cancellation and event subscription
//!
//! Each submitted job runs on its own task holding a [`JobPermit`]. The
//! service never touches a job's workspace; it only signals the run and, if
//! the run ignores the signal past the grace period, drops it.

use backspace_core::config::JobDefaults;
use backspace_core::{
    validate_branch_name, AbortReason, BackspaceConfig, BackspaceError, Job, JobId, JobOutcome,
    JobRequest, Result,
};
use backspace_sandbox::JobPermit;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_loop::{AgentLoop, JobReport};
use crate::events::{EventEmitter, EventHub, EventKind, Subscription};
use crate::state_machine::JobState;

/// Snapshot of one job for status queries
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub repository: String,
    pub change_description: String,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    pub retry_budget: u32,
    /// Attempts recorded so far (final once the job is done)
    pub attempts: usize,
    pub next_event_seq: u64,
    pub outcome: Option<JobOutcome>,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
    report: watch::Receiver<Option<Arc<JobReport>>>,
    finished_at: Arc<OnceLock<Instant>>,
    emitter: Arc<EventEmitter>,
}

impl JobEntry {
    fn finished_for(&self, now: Instant) -> Option<Duration> {
        self.finished_at.get().map(|at| now.saturating_duration_since(*at))
    }
}

/// Accepts jobs and runs them concurrently
pub struct JobService {
    agent: Arc<AgentLoop>,
    hub: EventHub,
    defaults: JobDefaults,
    default_quota_bytes: u64,
    cancel_grace: Duration,
    finished_ttl: Duration,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    shutdown: CancellationToken,
}

impl JobService {
    pub fn new(config: &BackspaceConfig, agent: Arc<AgentLoop>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            hub: EventHub::new(config.events.retention),
            defaults: config.jobs.clone(),
            default_quota_bytes: config.sandbox.default_quota_bytes,
            cancel_grace: config.jobs.cancel_grace(),
            finished_ttl: config.jobs.finished_ttl(),
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve request defaults into an immutable job
    pub fn resolve(&self, request: JobRequest) -> Result<Job> {
        let change_description = request.change_description.trim().to_string();
        if change_description.is_empty() {
            return Err(BackspaceError::Other(
                "change description must not be empty".to_string(),
            ));
        }
        if let Some(branch) = &request.branch {
            validate_branch_name(branch).map_err(|reason| {
                BackspaceError::Other(format!("invalid branch name {:?}: {}", branch, reason))
            })?;
        }

        Ok(Job {
            id: JobId::new(),
            repository: request.repository,
            change_description,
            validation_commands: request.validation_commands,
            size_quota_bytes: request.size_quota_bytes.unwrap_or(self.default_quota_bytes),
            retry_budget: request.retry_budget.unwrap_or(self.defaults.retry_budget),
            deadline: request
                .deadline_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.defaults.deadline()),
            branch: request.branch,
            dry_run: request.dry_run,
            created_at: Utc::now(),
        })
    }

    /// Accept a job and start it in the background
    ///
    /// Fails with `ResourceExhausted` when the concurrent job limit is reached.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let job = self.resolve(request)?;
        let permit = self.agent.workspaces().quotas().acquire_job()?;
        let job_id = job.id;

        let emitter = self.hub.register(job_id);
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        let (report_tx, report_rx) = watch::channel(None);
        let finished_at = Arc::new(OnceLock::new());

        self.jobs().insert(
            job_id,
            JobEntry {
                job: job.clone(),
                cancel: cancel.clone(),
                state: state_rx,
                report: report_rx,
                finished_at: Arc::clone(&finished_at),
                emitter: Arc::clone(&emitter),
            },
        );
        info!(%job_id, "Job submitted: {}", job.change_description);

        let agent = Arc::clone(&self.agent);
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            let report =
                supervise(&agent, &job, &emitter, &state_tx, &cancel, grace, permit).await;
            let _ = finished_at.set(Instant::now());
            report_tx.send_replace(Some(Arc::new(report)));
        });

        Ok(job_id)
    }

    /// Ask a job to stop; returns false if it had already finished
    pub fn cancel(&self, job_id: JobId) -> Result<bool> {
        let jobs = self.jobs();
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| BackspaceError::JobNotFound(job_id.to_string()))?;
        if entry.report.borrow().is_some() || entry.cancel.is_cancelled() {
            return Ok(false);
        }
        info!(%job_id, "Cancelling job");
        entry.cancel.cancel();
        Ok(true)
    }

    pub fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let jobs = self.jobs();
        jobs.get(&job_id)
            .map(status_of)
            .ok_or_else(|| BackspaceError::JobNotFound(job_id.to_string()))
    }

    /// All known jobs, oldest first
    pub fn list(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.jobs().values().map(status_of).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Terminal report, if the job has finished
    pub fn report(&self, job_id: JobId) -> Result<Option<Arc<JobReport>>> {
        let jobs = self.jobs();
        jobs.get(&job_id)
            .map(|entry| entry.report.borrow().clone())
            .ok_or_else(|| BackspaceError::JobNotFound(job_id.to_string()))
    }

    /// Wait for a job to reach its terminal outcome
    pub async fn wait(&self, job_id: JobId) -> Result<Arc<JobReport>> {
        let mut receiver = {
            let jobs = self.jobs();
            let entry = jobs
                .get(&job_id)
                .ok_or_else(|| BackspaceError::JobNotFound(job_id.to_string()))?;
            entry.report.clone()
        };

        let report = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackspaceError::Other(format!("job {} task went away", job_id)))?
            .clone();
        report.ok_or_else(|| BackspaceError::Other(format!("job {} has no report", job_id)))
    }

    /// Ordered events for a job from sequence number `from`
    pub fn subscribe(&self, job_id: JobId, from: u64) -> Result<Subscription> {
        self.hub.subscribe(job_id, from)
    }

    /// Forget jobs that finished at least `ttl` ago, with their events
    ///
    /// Running jobs are never evicted. Returns how many jobs were dropped.
    pub fn evict_finished(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<JobId> = {
            let mut jobs = self.jobs();
            let expired: Vec<JobId> = jobs
                .iter()
                .filter(|(_, entry)| entry.finished_for(now).is_some_and(|age| age >= ttl))
                .map(|(id, _)| *id)
                .collect();
            for job_id in &expired {
                jobs.remove(job_id);
            }
            expired
        };

        for job_id in &expired {
            self.hub.remove(*job_id);
            debug!(%job_id, "Evicted finished job");
        }
        if !expired.is_empty() {
            info!("Evicted {} finished job(s)", expired.len());
        }
        expired.len()
    }

    /// Evict jobs older than the configured TTL every `interval`
    ///
    /// Stops on [`JobService::shutdown`] or once the service is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service: Weak<Self> = Arc::downgrade(self);
        let stop = self.shutdown.clone();
        let ttl = self.finished_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => match service.upgrade() {
                        Some(service) => {
                            service.evict_finished(ttl);
                        }
                        None => break,
                    },
                }
            }
            debug!("Job sweeper stopped");
        })
    }

    /// Cancel every running job
    pub fn shutdown(&self) {
        info!("Shutting down job service");
        self.shutdown.cancel();
    }
}

fn status_of(entry: &JobEntry) -> JobStatus {
    let report = entry.report.borrow().clone();
    JobStatus {
        job_id: entry.job.id,
        repository: entry.job.repository.to_string(),
        change_description: entry.job.change_description.clone(),
        created_at: entry.job.created_at,
        state: *entry.state.borrow(),
        retry_budget: entry.job.retry_budget,
        attempts: report.as_ref().map(|r| r.attempts.len()).unwrap_or_else(|| {
            entry.state.borrow().attempt().unwrap_or_default() as usize
        }),
        next_event_seq: entry.emitter.next_seq(),
        outcome: report.map(|r| r.outcome.clone()),
    }
}

/// Run the agent loop under [`bounded`], holding the job's permit
async fn supervise(
    agent: &AgentLoop,
    job: &Job,
    emitter: &EventEmitter,
    state: &watch::Sender<JobState>,
    cancel: &CancellationToken,
    grace: Duration,
    permit: JobPermit,
) -> JobReport {
    let _permit = permit;
    bounded(agent.run(job, emitter, state, cancel), job, emitter, state, cancel, grace).await
}

/// Drive `run`; drop it if it outlives an interruption by `grace`
///
/// A dropped run still ends its stream with exactly one `JobAborted` and a
/// `WorkspaceTornDown`, in that order.
async fn bounded<R>(
    run: R,
    job: &Job,
    emitter: &EventEmitter,
    state: &watch::Sender<JobState>,
    cancel: &CancellationToken,
    grace: Duration,
) -> JobReport
where
    R: Future<Output = JobReport>,
{
    let mut run = Box::pin(run);

    let overdue = async {
        tokio::select! {
            _ = cancel.cancelled() => {
                tokio::time::sleep(grace).await;
                AbortReason::Cancelled
            }
            _ = tokio::time::sleep(job.deadline + grace) => AbortReason::DeadlineExceeded,
        }
    };

    tokio::select! {
        report = &mut run => report,
        reason = overdue => {
            warn!(job_id = %job.id, "Job did not stop within {:?}; dropping it", grace);
            // Dropping the run drops its workspace, which removes the tree
            drop(run);
            let message = format!("Job did not stop within {}ms of interruption", grace.as_millis());
            if !emitter.has_aborted() {
                emitter.emit(EventKind::JobAborted {
                    reason,
                    message: message.clone(),
                    diagnostics: None,
                });
            }
            emitter.emit(EventKind::WorkspaceTornDown);
            emitter.close();
            let final_state = JobState::Aborted { reason };
            state.send_replace(final_state);
            JobReport {
                outcome: JobOutcome::aborted(reason, message),
                final_state,
                attempts: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backspace_core::RepositoryRef;
    use backspace_sandbox::{LocalDirSource, ResourceQuotas, Workspace, WorkspaceManager};
    use tempfile::TempDir;

    fn job(deadline: Duration) -> Job {
        Job {
            id: JobId::new(),
            repository: RepositoryRef::Local {
                path: std::path::PathBuf::from("/srv/app"),
            },
            change_description: "add a health-check endpoint".to_string(),
            validation_commands: Vec::new(),
            size_quota_bytes: 1_000,
            retry_budget: 1,
            deadline,
            branch: None,
            dry_run: true,
            created_at: Utc::now(),
        }
    }

    async fn workspace(sandbox: &TempDir, job: &Job) -> Workspace {
        let manager = WorkspaceManager::new(
            sandbox.path(),
            ResourceQuotas::new(1, 1_000_000),
            Arc::new(LocalDirSource::new()),
        );
        let workspace = manager.create(job.id, 1_000).await.unwrap();
        std::fs::write(workspace.root().join("app.py"), "print('hi')\n").unwrap();
        workspace
    }

    fn names(emitter: &EventEmitter) -> Vec<&'static str> {
        emitter.history(0).iter().map(|e| e.kind.name()).collect()
    }

    fn assert_contiguous(emitter: &EventEmitter) {
        let seqs: Vec<u64> = emitter.history(0).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_ignoring_cancel_is_dropped_after_grace() {
        let sandbox = TempDir::new().unwrap();
        let job = job(Duration::from_secs(60));
        let workspace = workspace(&sandbox, &job).await;
        let root = workspace.root().to_path_buf();
        let emitter = EventEmitter::new(job.id, 64);
        let (state, state_rx) = watch::channel(JobState::Pending);
        let cancel = CancellationToken::new();

        // Never looks at the token
        let stubborn = {
            let emitter = Arc::clone(&emitter);
            async move {
                let _workspace = workspace;
                emitter.emit(EventKind::AttemptStarted { attempt: 1 });
                std::future::pending::<JobReport>().await
            }
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let grace = Duration::from_millis(100);
        let report = bounded(stubborn, &job, &emitter, &state, &cancel, grace).await;

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(report.outcome.abort_reason(), Some(AbortReason::Cancelled));
        assert_eq!(
            *state_rx.borrow(),
            JobState::Aborted {
                reason: AbortReason::Cancelled
            }
        );
        assert!(!root.exists());
        assert!(emitter.is_closed());
        assert_eq!(
            names(&emitter),
            vec!["attempt_started", "job_aborted", "workspace_torn_down"]
        );
        assert_contiguous(&emitter);
    }

    #[tokio::test]
    async fn test_run_stuck_after_abort_gets_single_abort_event() {
        let sandbox = TempDir::new().unwrap();
        let job = job(Duration::from_millis(50));
        let workspace = workspace(&sandbox, &job).await;
        let root = workspace.root().to_path_buf();
        let emitter = EventEmitter::new(job.id, 64);
        let (state, _state_rx) = watch::channel(JobState::Pending);
        let cancel = CancellationToken::new();

        // Reports the deadline itself, then hangs before teardown
        let stuck = {
            let emitter = Arc::clone(&emitter);
            async move {
                let _workspace = workspace;
                emitter.emit(EventKind::AttemptStarted { attempt: 1 });
                tokio::time::sleep(Duration::from_millis(50)).await;
                emitter.emit(EventKind::JobAborted {
                    reason: AbortReason::DeadlineExceeded,
                    message: "Job deadline exceeded".to_string(),
                    diagnostics: None,
                });
                std::future::pending::<JobReport>().await
            }
        };

        let grace = Duration::from_millis(100);
        let report = bounded(stuck, &job, &emitter, &state, &cancel, grace).await;

        assert_eq!(
            report.outcome.abort_reason(),
            Some(AbortReason::DeadlineExceeded)
        );
        assert!(!root.exists());
        assert_eq!(
            names(&emitter),
            vec!["attempt_started", "job_aborted", "workspace_torn_down"]
        );
        assert_contiguous(&emitter);
    }

    #[tokio::test]
    async fn test_finished_run_is_returned_untouched() {
        let job = job(Duration::from_secs(60));
        let emitter = EventEmitter::new(job.id, 64);
        let (state, _state_rx) = watch::channel(JobState::Pending);
        let cancel = CancellationToken::new();
        let final_state = JobState::Aborted {
            reason: AbortReason::GenerationExhausted,
        };

        let report = bounded(
            async move {
                JobReport {
                    outcome: JobOutcome::aborted(AbortReason::GenerationExhausted, "no edits"),
                    final_state,
                    attempts: Vec::new(),
                }
            },
            &job,
            &emitter,
            &state,
            &cancel,
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(report.final_state, final_state);
        assert!(names(&emitter).is_empty());
        assert!(!emitter.is_closed());
    }
}
