//! Core type definitions for Backspace jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex characters, used for directory and branch names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid job id {}: {}", s, e))
    }
}

/// Where the repository to change lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepositoryRef {
    /// Anything `git clone` understands
    Remote { url: String },
    /// A directory on this machine, copied into the workspace
    Local { path: PathBuf },
}

/// URL schemes that fetch over the network
const NETWORK_PREFIXES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "git@"];

impl RepositoryRef {
    /// Interpret a user-supplied reference
    ///
    /// URLs (`https://`, `http://`, `ssh://`, `git@`, `file://`) are remote;
    /// everything else is a local path.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let is_remote = reference.starts_with("file://")
            || NETWORK_PREFIXES
                .iter()
                .any(|prefix| reference.starts_with(prefix));

        if is_remote {
            Self::Remote {
                url: reference.to_string(),
            }
        } else {
            Self::Local {
                path: PathBuf::from(reference),
            }
        }
    }

    /// True if fetching reads the host's own filesystem
    ///
    /// Local paths, `file://` URLs and anything else that is not a network
    /// URL (bare paths, option-like strings) count as host-local.
    pub fn is_host_local(&self) -> bool {
        match self {
            Self::Local { .. } => true,
            Self::Remote { url } => !NETWORK_PREFIXES
                .iter()
                .any(|prefix| url.starts_with(prefix)),
        }
    }

    /// Short repository name (last path segment without `.git`)
    pub fn name(&self) -> String {
        let raw = match self {
            Self::Remote { url } => url.trim_end_matches('/').to_string(),
            Self::Local { path } => path.display().to_string(),
        };
        let last = raw
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(raw.as_str())
            .trim_end_matches(".git");
        if last.is_empty() {
            "repo".to_string()
        } else {
            last.to_string()
        }
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { url } => write!(f, "{}", url),
            Self::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Check a branch name against git's ref-name rules
///
/// Covers what `git check-ref-format --branch` rejects, plus a leading `-`
/// so the name can never be read as an option.
pub fn validate_branch_name(name: &str) -> std::result::Result<(), String> {
    let invalid = |why: &str| Err(format!("Invalid branch name {:?}: {}", name, why));

    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('-') {
        return invalid("starts with '-'");
    }
    if name == "@" || name.contains("@{") {
        return invalid("contains '@{' or is '@'");
    }
    if name.contains("..") {
        return invalid("contains '..'");
    }
    if name.ends_with('.') || name.ends_with('/') || name.starts_with('/') {
        return invalid("starts with '/' or ends with '.' or '/'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return invalid(&format!("contains {:?}", c));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return invalid("contains '//'");
        }
        if component.starts_with('.') || component.ends_with(".lock") {
            return invalid("a component starts with '.' or ends with '.lock'");
        }
    }
    Ok(())
}

/// A shell command run against the workspace to judge an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCommand {
    /// Short label used in events and diagnostics
    pub name: String,
    /// Command line, run through `sh -c` in the workspace root
    pub command: String,
    /// Per-command timeout; the job default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ValidationCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_secs: None,
        }
    }

    /// Use the command line itself as the label
    pub fn shell(command: impl Into<String>) -> Self {
        let command = command.into();
        Self::new(command.clone(), command)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// A change request as submitted by a caller
///
/// Optional fields fall back to configured job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub repository: RepositoryRef,
    pub change_description: String,
    #[serde(default)]
    pub validation_commands: Vec<ValidationCommand>,
    #[serde(default)]
    pub size_quota_bytes: Option<u64>,
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Branch to publish on; derived from the job id when absent
    #[serde(default)]
    pub branch: Option<String>,
    /// Run the loop but skip publishing
    #[serde(default)]
    pub dry_run: bool,
}

impl JobRequest {
    pub fn new(repository: RepositoryRef, change_description: impl Into<String>) -> Self {
        Self {
            repository,
            change_description: change_description.into(),
            validation_commands: Vec::new(),
            size_quota_bytes: None,
            retry_budget: None,
            deadline_secs: None,
            branch: None,
            dry_run: false,
        }
    }

    pub fn with_command(mut self, command: ValidationCommand) -> Self {
        self.validation_commands.push(command);
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn with_size_quota(mut self, bytes: u64) -> Self {
        self.size_quota_bytes = Some(bytes);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// One change request with every default resolved
///
/// Immutable once created; the agent loop owns the mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repository: RepositoryRef,
    pub change_description: String,
    pub validation_commands: Vec<ValidationCommand>,
    pub size_quota_bytes: u64,
    /// Maximum attempts (at least 1)
    pub retry_budget: u32,
    /// Overall wall-clock budget
    pub deadline: Duration,
    pub branch: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

/// What a single edit does to its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileChange {
    /// Create or overwrite with the given content
    Write { content: String },
    /// Remove an existing file
    Delete,
}

/// One file-level operation of an edit set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Relative path inside the workspace
    pub path: String,
    #[serde(flatten)]
    pub change: FileChange,
}

impl FileEdit {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change: FileChange::Write {
                content: content.into(),
            },
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change: FileChange::Delete,
        }
    }
}

/// A proposed, not yet applied transformation of the workspace
///
/// Immutable once produced: edits are only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSet {
    edits: Vec<FileEdit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

impl EditSet {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        Self {
            edits,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn edits(&self) -> &[FileEdit] {
        &self.edits
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.edits.iter().map(|e| e.path.as_str())
    }
}

/// How a file changed between before and after an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A file touched by an applied edit set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub kind: ChangeKind,
}

/// Unified diff of an applied edit set against the pre-apply state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiff {
    /// Unified diff text
    pub diff: String,
    /// Files touched, in edit order
    pub files: Vec<ChangedFile>,
    /// SHA-256 of `diff`, hex encoded
    pub digest: String,
}

impl AppliedDiff {
    pub fn summary(&self) -> String {
        let count = |kind: ChangeKind| self.files.iter().filter(|f| f.kind == kind).count();
        let mut parts = Vec::new();
        for (kind, label) in [
            (ChangeKind::Created, "created"),
            (ChangeKind::Modified, "modified"),
            (ChangeKind::Deleted, "deleted"),
        ] {
            let n = count(kind);
            if n > 0 {
                parts.push(format!("{} {}", n, label));
            }
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Result of one validation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub name: String,
    pub command: String,
    pub passed: bool,
    /// None when the process was killed or could not start
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Result of running every validation command once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub commands: Vec<CommandOutcome>,
}

impl ValidationResult {
    pub fn exit_codes(&self) -> Vec<Option<i32>> {
        self.commands.iter().map(|c| c.exit_code).collect()
    }

    /// Combined output of every command keyed by name
    pub fn per_command_output(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .map(|c| {
                let mut out = c.stdout.clone();
                if !c.stderr.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(&c.stderr);
                }
                (c.name.clone(), out)
            })
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &CommandOutcome> {
        self.commands.iter().filter(|c| !c.passed)
    }
}

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    GenerationFailed,
    ApplyConflict,
    ValidationFailed,
    Accepted,
}

/// One generate → apply → validate cycle; never mutated after completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based sequence number
    pub seq: u32,
    pub edit_set: Option<EditSet>,
    pub applied: Option<AppliedDiff>,
    pub validation: Option<ValidationResult>,
    pub outcome: AttemptOutcome,
    /// Feedback carried into the next generation call
    pub diagnostics: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Why a job ended without a published change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ResourceExhausted,
    IoFailure,
    SourceUnavailable,
    GenerationExhausted,
    ApplyExhausted,
    ValidationExhausted,
    PublishFailed,
    Cancelled,
    DeadlineExceeded,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceExhausted => "resource_exhausted",
            Self::IoFailure => "io_failure",
            Self::SourceUnavailable => "source_unavailable",
            Self::GenerationExhausted => "generation_exhausted",
            Self::ApplyExhausted => "apply_exhausted",
            Self::ValidationExhausted => "validation_exhausted",
            Self::PublishFailed => "publish_failed",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Where a published change can be found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedReference {
    /// Pull request (or equivalent) URL
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Validation passed; `published` is None for dry runs
    Accepted {
        diff: AppliedDiff,
        published: Option<PublishedReference>,
    },
    /// Validation passed but the publisher failed
    PublishFailed { diff: AppliedDiff, reason: String },
    Aborted {
        reason: AbortReason,
        message: String,
        last_diagnostics: Option<String>,
    },
}

impl JobOutcome {
    pub fn aborted(reason: AbortReason, message: impl Into<String>) -> Self {
        Self::Aborted {
            reason,
            message: message.into(),
            last_diagnostics: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted { reason, .. } => Some(*reason),
            Self::PublishFailed { .. } => Some(AbortReason::PublishFailed),
            Self::Accepted { .. } => None,
        }
    }

    /// The diff that passed validation, if any
    pub fn accepted_diff(&self) -> Option<&AppliedDiff> {
        match self {
            Self::Accepted { diff, .. } | Self::PublishFailed { diff, .. } => Some(diff),
            Self::Aborted { .. } => None,
        }
    }

    /// Human-readable one-line reason
    pub fn describe(&self) -> String {
        match self {
            Self::Accepted {
                diff,
                published: Some(r),
            } => format!("Accepted ({}), published at {}", diff.summary(), r.url),
            Self::Accepted {
                diff,
                published: None,
            } => format!("Accepted ({}), not published", diff.summary()),
            Self::PublishFailed { reason, .. } => {
                format!("Change validated but publishing failed: {}", reason)
            }
            Self::Aborted {
                reason, message, ..
            } => format!("Aborted ({}): {}", reason, message),
        }
    }
}
