//! Agent Loop - generate, apply, validate until accepted or out of budget
//!
//! One run owns one job end to end:
//! 1. Reserve and create the workspace
//! 2. Materialize the repository (failures here are never retried)
//! 3. Per attempt: snapshot, generate, apply, validate
//! 4. A failed attempt is reverted and its diagnostics feed the next one
//! 5. On acceptance, publish the accepted diff unless this is a dry run
//! 6. Tear the workspace down exactly once, whatever happened
//!
//! Control flow is decided by [`transition`]; this module only performs the
//! work each state implies and reports it as [`EventKind`]s.

use backspace_agent::{GenerationRequest, PatchGenerator};
use backspace_core::fail_open::fail_open;
use backspace_core::{
    AbortReason, AppliedDiff, Attempt, AttemptOutcome, BackspaceConfig, BackspaceError, EditSet,
    Job, JobOutcome, ValidationCommand, ValidationResult,
};
use backspace_github::{PublishRequest, Publisher};
use backspace_sandbox::{
    detect_commands, format_diagnostics, ApplyOutcome, FileSnapshot, PatchApplicator,
    SnapshotLimits, UndoLog, Validator, Workspace, WorkspaceManager,
};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventEmitter, EventKind};
use crate::state_machine::{transition, JobState, LoopEvent};

/// Diff text carried into the next prompt after a failed validation
const MAX_DIFF_FEEDBACK_CHARS: usize = 4000;

/// Everything one run produced
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub final_state: JobState,
    pub attempts: Vec<Attempt>,
}

/// Drives jobs through the state machine
///
/// Shared across jobs; every per-job value lives in the run itself.
pub struct AgentLoop {
    workspaces: Arc<WorkspaceManager>,
    generator: Arc<dyn PatchGenerator>,
    publisher: Arc<dyn Publisher>,
    applicator: PatchApplicator,
    validator: Validator,
    snapshot_limits: SnapshotLimits,
    attempt_timeout: Duration,
}

impl AgentLoop {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        generator: Arc<dyn PatchGenerator>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            workspaces,
            generator,
            publisher,
            applicator: PatchApplicator::default(),
            validator: Validator::new(Duration::from_secs(300)),
            snapshot_limits: SnapshotLimits::default(),
            attempt_timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(
        config: &BackspaceConfig,
        workspaces: Arc<WorkspaceManager>,
        generator: Arc<dyn PatchGenerator>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self::new(workspaces, generator, publisher)
            .with_applicator(PatchApplicator::new(&config.sandbox.protected_paths))
            .with_validator(Validator::new(config.jobs.command_timeout()))
            .with_attempt_timeout(config.jobs.attempt_timeout())
    }

    pub fn with_applicator(mut self, applicator: PatchApplicator) -> Self {
        self.applicator = applicator;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_snapshot_limits(mut self, limits: SnapshotLimits) -> Self {
        self.snapshot_limits = limits;
        self
    }

    /// Upper bound on a single generator call
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    /// Run `job` to a terminal outcome
    ///
    /// Never returns early without emitting a terminal event and closing
    /// `emitter`. `cancel` and the job deadline both interrupt the run.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn run(
        &self,
        job: &Job,
        emitter: &EventEmitter,
        status: &watch::Sender<JobState>,
        cancel: &CancellationToken,
    ) -> JobReport {
        let mut run = Run {
            job,
            emitter,
            status,
            interrupt: Interrupt::arm(cancel, job.deadline),
            state: JobState::Pending,
            attempts: Vec::new(),
            diagnostics: None,
        };

        info!("Starting job: {}", job.change_description);
        run.emit(EventKind::JobStarted {
            repository: job.repository.to_string(),
            change_description: job.change_description.clone(),
            retry_budget: job.retry_budget,
        });
        run.advance(LoopEvent::Start);

        let created = run
            .interrupt
            .guard(self.workspaces.create(job.id, job.size_quota_bytes))
            .await;
        let workspace = match created {
            Ok(Ok(workspace)) => workspace,
            Ok(Err(e)) => {
                let finish = run.fail(e.abort_reason(), e.to_string());
                let outcome = run.abort(finish);
                return run.finish(outcome);
            }
            Err(reason) => {
                let finish = run.interrupted(reason);
                let outcome = run.abort(finish);
                return run.finish(outcome);
            }
        };

        let finish = self.drive(&mut run, &workspace).await;
        let outcome = match finish {
            Finish::Accepted(diff) => self.publish(&mut run, &workspace, diff).await,
            aborted => run.abort(aborted),
        };

        // Exactly once, on every path that created a workspace
        fail_open("workspace teardown", || workspace.teardown()).await;
        run.emit(EventKind::WorkspaceTornDown);

        run.finish(outcome)
    }

    async fn drive(&self, run: &mut Run<'_>, workspace: &Workspace) -> Finish {
        let job = run.job;

        match run
            .interrupt
            .guard(self.workspaces.materialize(workspace, &job.repository))
            .await
        {
            Err(reason) => return run.interrupted(reason),
            Ok(Err(e)) => {
                warn!("Materialization failed: {}", e);
                return run.fail(e.abort_reason(), e.to_string());
            }
            Ok(Ok(bytes)) => {
                run.emit(EventKind::Materialized { bytes });
                run.advance(LoopEvent::Materialized);
            }
        }

        let commands = if job.validation_commands.is_empty() {
            let detected = detect_commands(workspace.root());
            if detected.is_empty() {
                warn!("No validation commands given or detected; applied edits are accepted as-is");
            } else {
                info!("Detected {} validation commands", detected.len());
            }
            detected
        } else {
            job.validation_commands.clone()
        };

        loop {
            if run.interrupt.is_triggered() {
                let reason = run.interrupt.reason();
                return run.interrupted(reason);
            }
            let attempt = match run.state {
                JobState::Generating { attempt } => attempt,
                JobState::Aborted { reason } => return run.exhausted(reason),
                other => {
                    return run.fail(
                        AbortReason::IoFailure,
                        format!("Agent loop reached unexpected state {}", other),
                    )
                }
            };

            match self.attempt(run, workspace, &commands, attempt).await {
                Step::Next => continue,
                Step::Done(finish) => return finish,
            }
        }
    }

    /// One generate, apply, validate cycle
    async fn attempt(
        &self,
        run: &mut Run<'_>,
        workspace: &Workspace,
        commands: &[ValidationCommand],
        attempt: u32,
    ) -> Step {
        let job = run.job;
        let started_at = Utc::now();
        info!("=== Attempt {} of {} ===", attempt, job.retry_budget);
        run.emit(EventKind::AttemptStarted { attempt });

        let mut record = AttemptRecord {
            seq: attempt,
            started_at,
            edit_set: None,
            applied: None,
            validation: None,
        };

        // Generate
        let snapshot = match self.snapshot(workspace).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Step::Done(run.fail(AbortReason::IoFailure, e.to_string())),
        };
        let request = GenerationRequest {
            job_id: job.id,
            attempt,
            change_description: &job.change_description,
            snapshot: &snapshot,
            prior_diagnostics: run.diagnostics.as_deref(),
        };
        let generated = run
            .interrupt
            .guard(tokio::time::timeout(
                self.attempt_timeout,
                self.generator.generate(&request),
            ))
            .await;
        let edit_set = match generated {
            Err(reason) => return Step::Done(run.interrupted(reason)),
            Ok(Err(_)) => Err(format!(
                "Generation timed out after {}s",
                self.attempt_timeout.as_secs()
            )),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(set))) if set.is_empty() => {
                Err("Generator returned an empty edit set".to_string())
            }
            Ok(Ok(Ok(set))) => Ok(set),
        };
        let edit_set = match edit_set {
            Ok(set) => set,
            Err(message) => {
                warn!("Attempt {} generation failed: {}", attempt, message);
                let diagnostics = match &run.diagnostics {
                    Some(previous) => format!(
                        "{}\n\nThe last response could not be used: {}",
                        previous, message
                    ),
                    None => format!("The last response could not be used: {}", message),
                };
                run.record(record, AttemptOutcome::GenerationFailed, message);
                return run.revise(LoopEvent::GenerationFailed, diagnostics);
            }
        };
        run.emit(EventKind::GenerationComplete {
            attempt,
            edits: edit_set.len(),
            summary: edit_set.summary().map(str::to_string),
        });
        record.edit_set = Some(edit_set.clone());
        run.advance(LoopEvent::EditSetReady);

        // Apply
        let (diff, undo) = match self.apply(workspace, edit_set).await {
            Ok(ApplyOutcome::Applied { diff, undo }) => (diff, undo),
            Ok(ApplyOutcome::Conflict(conflict)) => {
                info!("Attempt {} apply conflict: {}", attempt, conflict);
                run.emit(EventKind::ApplyConflict {
                    attempt,
                    detail: conflict.to_string(),
                });
                let diagnostics = format!(
                    "## Apply Conflict\n\nThe edit set could not be applied, nothing was changed: {}",
                    conflict
                );
                run.record(record, AttemptOutcome::ApplyConflict, diagnostics.clone());
                return run.revise(LoopEvent::ApplyConflict, diagnostics);
            }
            Err(e) => return Step::Done(run.fail(AbortReason::IoFailure, e.to_string())),
        };
        record.applied = Some(diff.clone());
        run.emit(EventKind::ApplyComplete {
            attempt,
            files: diff.files.clone(),
        });
        run.advance(LoopEvent::Applied);

        // Validate
        let emitter = run.emitter;
        let validated = self
            .validator
            .validate(workspace.root(), commands, run.interrupt.token(), |outcome| {
                emitter.emit(EventKind::CommandFinished {
                    name: outcome.name.clone(),
                    passed: outcome.passed,
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                });
            })
            .await;
        let validation = match validated {
            Ok(result) => result,
            Err(BackspaceError::Cancelled) => {
                let reason = run.interrupt.reason();
                return Step::Done(run.interrupted(reason));
            }
            Err(e) => return Step::Done(run.fail(e.abort_reason(), e.to_string())),
        };
        run.emit(EventKind::ValidationComplete {
            attempt,
            passed: validation.passed,
        });
        record.validation = Some(validation.clone());

        if validation.passed {
            info!("Attempt {} accepted ({})", attempt, diff.summary());
            run.record(record, AttemptOutcome::Accepted, String::new());
            run.advance(LoopEvent::ValidationPassed);
            return Step::Done(Finish::Accepted(diff));
        }

        let diagnostics = validation_feedback(&validation, &diff);
        if let Err(e) = self.revert(workspace, undo).await {
            return Step::Done(run.fail(AbortReason::IoFailure, e.to_string()));
        }
        run.record(record, AttemptOutcome::ValidationFailed, diagnostics.clone());
        run.revise(LoopEvent::ValidationFailed, diagnostics)
    }

    async fn snapshot(&self, workspace: &Workspace) -> backspace_core::Result<FileSnapshot> {
        let root = workspace.root().to_path_buf();
        let limits = self.snapshot_limits;
        blocking(move || FileSnapshot::capture(&root, limits)).await
    }

    async fn apply(
        &self,
        workspace: &Workspace,
        edit_set: EditSet,
    ) -> backspace_core::Result<ApplyOutcome> {
        let applicator = self.applicator.clone();
        let root = workspace.root().to_path_buf();
        blocking(move || applicator.apply(&root, &edit_set)).await
    }

    async fn revert(&self, workspace: &Workspace, undo: UndoLog) -> backspace_core::Result<()> {
        let root: PathBuf = workspace.root().to_path_buf();
        blocking(move || undo.revert(&root)).await
    }

    async fn publish(&self, run: &mut Run<'_>, workspace: &Workspace, diff: AppliedDiff) -> JobOutcome {
        let job = run.job;
        run.emit(EventKind::JobAccepted { diff: diff.clone() });

        if job.dry_run {
            info!("Dry run, not publishing");
            return JobOutcome::Accepted {
                diff,
                published: None,
            };
        }

        run.emit(EventKind::PublishStarted);
        let request = PublishRequest {
            job_id: job.id,
            repository: &job.repository,
            diff: &diff,
            description: &job.change_description,
            workspace_root: workspace.root(),
            branch: job.branch.as_deref(),
        };
        let published = run.interrupt.guard(self.publisher.publish(&request)).await;

        match published {
            Ok(Ok(reference)) => {
                info!("Published: {}", reference.url);
                run.emit(EventKind::Published {
                    reference: reference.clone(),
                });
                JobOutcome::Accepted {
                    diff,
                    published: Some(reference),
                }
            }
            Ok(Err(e)) => {
                warn!("Publish failed: {}", e);
                run.emit(EventKind::PublishFailed {
                    reason: e.to_string(),
                });
                JobOutcome::PublishFailed {
                    diff,
                    reason: e.to_string(),
                }
            }
            Err(reason) => {
                let message = format!(
                    "{} while publishing; the remote branch may be incomplete",
                    interruption_message(reason, job.deadline)
                );
                run.abort(Finish::Aborted { reason, message })
            }
        }
    }
}

/// Feedback for the next generation after a failed validation
fn validation_feedback(validation: &ValidationResult, diff: &AppliedDiff) -> String {
    let mut feedback = format_diagnostics(validation);
    let shown: String = diff.diff.chars().take(MAX_DIFF_FEEDBACK_CHARS).collect();
    feedback.push_str("\n## Rejected Diff\n\nThis diff was reverted; the files below are unchanged.\n\n```diff\n");
    feedback.push_str(&shown);
    if shown.len() < diff.diff.len() {
        feedback.push_str("\n... (truncated)");
    }
    feedback.push_str("\n```\n");
    feedback
}

fn interruption_message(reason: AbortReason, deadline: Duration) -> String {
    match reason {
        AbortReason::DeadlineExceeded => format!("Deadline of {}s exceeded", deadline.as_secs()),
        _ => "Job cancelled".to_string(),
    }
}

/// Run blocking filesystem work off the async workers
async fn blocking<F, T>(f: F) -> backspace_core::Result<T>
where
    F: FnOnce() -> backspace_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackspaceError::Workspace(format!("Blocking task failed: {}", e)))?
}

/// How the attempt loop ended, before publishing
#[derive(Debug)]
enum Finish {
    Accepted(AppliedDiff),
    Aborted { reason: AbortReason, message: String },
}

enum Step {
    Next,
    Done(Finish),
}

/// Fields of an attempt gathered while it runs
struct AttemptRecord {
    seq: u32,
    started_at: chrono::DateTime<Utc>,
    edit_set: Option<EditSet>,
    applied: Option<AppliedDiff>,
    validation: Option<ValidationResult>,
}

/// Per-job mutable state of a run
struct Run<'a> {
    job: &'a Job,
    emitter: &'a EventEmitter,
    status: &'a watch::Sender<JobState>,
    interrupt: Interrupt,
    state: JobState,
    attempts: Vec<Attempt>,
    /// Feedback from the latest failed attempt
    diagnostics: Option<String>,
}

impl Run<'_> {
    fn emit(&self, kind: EventKind) {
        self.emitter.emit(kind);
    }

    fn advance(&mut self, event: LoopEvent) -> JobState {
        let next = transition(self.state, event, self.job.retry_budget);
        debug!("{} --{:?}--> {}", self.state, event, next);
        self.state = next;
        self.status.send_replace(next);
        next
    }

    fn record(&mut self, record: AttemptRecord, outcome: AttemptOutcome, diagnostics: String) {
        self.attempts.push(Attempt {
            seq: record.seq,
            edit_set: record.edit_set,
            applied: record.applied,
            validation: record.validation,
            outcome,
            diagnostics,
            started_at: record.started_at,
            finished_at: Utc::now(),
        });
    }

    /// Move past a failed attempt; the next state decides whether to retry
    fn revise(&mut self, event: LoopEvent, diagnostics: String) -> Step {
        let attempt = self.state.attempt().unwrap_or_default();
        self.diagnostics = Some(diagnostics.clone());

        if let JobState::Revising { .. } = self.advance(event) {
            self.emit(EventKind::AttemptRevising {
                attempt,
                diagnostics,
            });
            self.advance(LoopEvent::Retry);
        }
        Step::Next
    }

    fn fail(&mut self, reason: AbortReason, message: String) -> Finish {
        self.advance(LoopEvent::Failed { reason });
        Finish::Aborted { reason, message }
    }

    fn interrupted(&mut self, reason: AbortReason) -> Finish {
        info!("Interrupted: {}", reason);
        self.advance(LoopEvent::Interrupted { reason });
        Finish::Aborted {
            reason,
            message: interruption_message(reason, self.job.deadline),
        }
    }

    fn exhausted(&self, reason: AbortReason) -> Finish {
        Finish::Aborted {
            reason,
            message: format!(
                "No acceptable change after {} attempt(s)",
                self.attempts.len()
            ),
        }
    }

    /// Emit the abort event and build the terminal outcome
    fn abort(&mut self, finish: Finish) -> JobOutcome {
        let (reason, message) = match finish {
            Finish::Aborted { reason, message } => (reason, message),
            Finish::Accepted(_) => (
                AbortReason::IoFailure,
                "Accepted change reached the abort path".to_string(),
            ),
        };
        warn!("Job aborted ({}): {}", reason, message);
        self.emit(EventKind::JobAborted {
            reason,
            message: message.clone(),
            diagnostics: self.diagnostics.clone(),
        });
        JobOutcome::Aborted {
            reason,
            message,
            last_diagnostics: self.diagnostics.clone(),
        }
    }

    fn finish(self, outcome: JobOutcome) -> JobReport {
        info!("Job finished: {}", outcome.describe());
        self.emitter.close();
        JobReport {
            outcome,
            final_state: self.state,
            attempts: self.attempts,
        }
    }
}

/// Cancellation and deadline folded into one token
struct Interrupt {
    token: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl Interrupt {
    fn arm(cancel: &CancellationToken, deadline: Duration) -> Self {
        let token = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));

        let timer = tokio::spawn({
            let token = token.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        deadline_hit.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            }
        });

        Self {
            token,
            deadline_hit,
            timer,
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> AbortReason {
        if self.deadline_hit.load(Ordering::SeqCst) {
            AbortReason::DeadlineExceeded
        } else {
            AbortReason::Cancelled
        }
    }

    /// Race `future` against the interruption; the future is dropped if it loses
    async fn guard<F: Future>(&self, future: F) -> Result<F::Output, AbortReason> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.reason()),
            output = future => Ok(output),
        }
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backspace_core::{ChangeKind, ChangedFile, CommandOutcome};

    #[test]
    fn test_validation_feedback_includes_failures_and_diff() {
        let validation = ValidationResult {
            passed: false,
            commands: vec![CommandOutcome {
                name: "tests".into(),
                command: "pytest".into(),
                passed: false,
                exit_code: Some(1),
                timed_out: false,
                stdout: String::new(),
                stderr: "ImportError: missing import".into(),
                duration_ms: 5,
            }],
        };
        let diff = AppliedDiff {
            diff: "+import os\n".into(),
            files: vec![ChangedFile {
                path: "app.py".into(),
                kind: ChangeKind::Modified,
            }],
            digest: "d".into(),
        };

        let feedback = validation_feedback(&validation, &diff);
        assert!(feedback.contains("missing import"));
        assert!(feedback.contains("## Rejected Diff"));
        assert!(feedback.contains("+import os"));
        assert!(!feedback.contains("truncated"));
    }

    #[test]
    fn test_interruption_messages() {
        assert_eq!(
            interruption_message(AbortReason::DeadlineExceeded, Duration::from_secs(90)),
            "Deadline of 90s exceeded"
        );
        assert_eq!(
            interruption_message(AbortReason::Cancelled, Duration::from_secs(90)),
            "Job cancelled"
        );
    }

    #[tokio::test]
    async fn test_interrupt_reports_deadline() {
        let cancel = CancellationToken::new();
        let interrupt = Interrupt::arm(&cancel, Duration::from_millis(20));
        let result = interrupt
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(AbortReason::DeadlineExceeded));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupt_reports_cancel() {
        let cancel = CancellationToken::new();
        let interrupt = Interrupt::arm(&cancel, Duration::from_secs(60));
        cancel.cancel();
        let result = interrupt.guard(async { 1 }).await;
        assert_eq!(result, Err(AbortReason::Cancelled));
        assert!(interrupt.is_triggered());
    }
}
