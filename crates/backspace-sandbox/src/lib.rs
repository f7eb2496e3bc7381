//! Sandbox for Backspace jobs
//!
//! Owns everything that touches a job's filesystem tree:
//! - [`WorkspaceManager`]: create, materialize and tear down isolated workspaces
//! - [`ResourceQuotas`]: global job-count and byte budgets
//! - [`PatchApplicator`]: all-or-nothing edit set application with unified diffs
//! - [`Validator`]: sequential check commands with timeouts and cancellation
//! - [`FileSnapshot`]: the read-only view handed to the generator
//! - [`reap_orphans`]: cleanup of workspaces that outlived their job

pub mod applicator;
pub mod quota;
pub mod reaper;
pub mod snapshot;
pub mod source;
pub mod validator;
pub mod workspace;

pub use applicator::{ApplyConflict, ApplyOutcome, PatchApplicator, UndoLog};
pub use quota::{BytePermit, JobPermit, QuotaUsage, ResourceQuotas};
pub use reaper::{reap_orphans, spawn_reaper};
pub use snapshot::{FileSnapshot, SnapshotLimits};
pub use source::{GitSource, LocalDirSource, RepositorySource, SourceFetcher};
pub use validator::{detect_commands, format_diagnostics, Validator};
pub use workspace::{tree_size, Workspace, WorkspaceManager};
