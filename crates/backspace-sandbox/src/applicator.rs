//! Patch Applicator - all-or-nothing application of edit sets
//!
//! Every path is validated before anything is written. Operations then run
//! in order against an undo journal; the first failing operation rolls the
//! journal back so the workspace is byte-identical to its pre-apply state.

use backspace_core::{
    AppliedDiff, BackspaceError, ChangeKind, ChangedFile, EditSet, FileChange, Result,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// The first operation of an edit set that could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyConflict {
    /// Zero-based position in the edit set
    pub index: usize,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ApplyConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edit #{} ({}): {}", self.index + 1, self.path, self.reason)
    }
}

/// Result of a completed apply call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { diff: AppliedDiff, undo: UndoLog },
    /// Nothing was changed
    Conflict(ApplyConflict),
}

/// Pre-apply state of every path an applied edit set touched
///
/// Reverting restores the workspace to exactly what it was before the apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoLog(Journal);

impl UndoLog {
    pub fn revert(self, root: &Path) -> Result<()> {
        self.0.rollback(root)?;
        debug!("Reverted applied edit set");
        Ok(())
    }
}

/// Prior state of a path, recorded before its first modification
#[derive(Debug, Clone, PartialEq, Eq)]
enum Prior {
    Absent,
    File(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Journal {
    /// (relative path, state before the apply), in first-touch order
    touched: Vec<(String, Prior)>,
    /// Directories created by the apply, parents first
    created_dirs: Vec<PathBuf>,
}

impl Journal {
    fn record(&mut self, relative: &str, absolute: &Path) -> std::io::Result<()> {
        if self.touched.iter().any(|(p, _)| p == relative) {
            return Ok(());
        }
        let prior = match fs::read(absolute) {
            Ok(bytes) => Prior::File(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Prior::Absent,
            Err(e) => return Err(e),
        };
        self.touched.push((relative.to_string(), prior));
        Ok(())
    }

    fn rollback(self, root: &Path) -> Result<()> {
        let mut failures = Vec::new();

        for (relative, prior) in self.touched.iter().rev() {
            let absolute = root.join(relative);
            let restored = match prior {
                Prior::File(bytes) => fs::write(&absolute, bytes),
                Prior::Absent => match fs::remove_file(&absolute) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                failures.push(format!("{}: {}", relative, e));
            }
        }

        for dir in self.created_dirs.iter().rev() {
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failures.push(format!("{}: {}", dir.display(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackspaceError::Workspace(format!(
                "Rollback incomplete: {}",
                failures.join("; ")
            )))
        }
    }
}

/// Applies edit sets to a workspace tree
#[derive(Debug, Clone)]
pub struct PatchApplicator {
    protected: Vec<String>,
    patterns: Vec<glob::Pattern>,
}

impl PatchApplicator {
    /// `protected` entries are path prefixes (`.git`), bare file names
    /// (`.env`, matched at any depth) or glob patterns (`secrets/*.key`)
    pub fn new<S: AsRef<str>>(protected: &[S]) -> Self {
        let protected: Vec<String> = protected.iter().map(|s| s.as_ref().to_string()).collect();
        let patterns = protected
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        Self {
            protected,
            patterns,
        }
    }

    /// Check that `path` is relative, stays inside `root` and is not protected
    ///
    /// Returns the normalized relative path.
    pub fn validate_path(&self, root: &Path, path: &str) -> std::result::Result<String, String> {
        let trimmed = path.trim();
        let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err("empty path".to_string());
        }

        let candidate = Path::new(trimmed);
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(format!("path traversal not allowed: {}", path));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("absolute paths not allowed: {}", path));
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(format!("path names the workspace root: {}", path));
        }

        if let Some(rule) = self.protected_rule(&normalized) {
            return Err(format!("protected path ({}): {}", rule, path));
        }

        // Every existing ancestor, and the target itself, must be a real
        // directory/file; a symlink could point outside the root
        let mut current = root.to_path_buf();
        for component in normalized.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(format!("path goes through a symlink: {}", path));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        Ok(normalized.to_string_lossy().replace('\\', "/"))
    }

    fn protected_rule(&self, path: &Path) -> Option<&str> {
        let file_name = path.file_name().and_then(|n| n.to_str());
        for rule in &self.protected {
            if path.starts_with(rule) || file_name == Some(rule.as_str()) {
                return Some(rule);
            }
        }
        self.patterns
            .iter()
            .find(|p| p.matches_path(path))
            .map(|p| p.as_str())
    }

    /// Apply every edit or none
    ///
    /// `Err` is returned only if a rollback itself failed, which leaves the
    /// workspace in an unknown state and is fatal to the job.
    pub fn apply(&self, root: &Path, edits: &EditSet) -> Result<ApplyOutcome> {
        let mut validated = Vec::with_capacity(edits.len());
        for (index, edit) in edits.edits().iter().enumerate() {
            match self.validate_path(root, &edit.path) {
                Ok(path) => validated.push((path, &edit.change)),
                Err(reason) => {
                    debug!("Rejected edit {}: {}", index, reason);
                    return Ok(ApplyOutcome::Conflict(ApplyConflict {
                        index,
                        path: edit.path.clone(),
                        reason,
                    }));
                }
            }
        }

        let mut journal = Journal::default();
        for (index, (relative, change)) in validated.iter().enumerate() {
            if let Err(reason) = apply_one(root, relative, change, &mut journal) {
                warn!("Edit {} on {} failed, rolling back: {}", index, relative, reason);
                journal.rollback(root)?;
                return Ok(ApplyOutcome::Conflict(ApplyConflict {
                    index,
                    path: relative.clone(),
                    reason,
                }));
            }
        }

        let diff = build_diff(root, &journal);
        info!("Applied {} edits ({})", edits.len(), diff.summary());
        Ok(ApplyOutcome::Applied {
            diff,
            undo: UndoLog(journal),
        })
    }
}

impl Default for PatchApplicator {
    fn default() -> Self {
        Self::new(&[".git"])
    }
}

fn apply_one(
    root: &Path,
    relative: &str,
    change: &FileChange,
    journal: &mut Journal,
) -> std::result::Result<(), String> {
    let absolute = root.join(relative);

    match change {
        FileChange::Write { content } => {
            if absolute.is_dir() {
                return Err("target is a directory".to_string());
            }
            journal
                .record(relative, &absolute)
                .map_err(|e| format!("cannot read existing file: {}", e))?;
            if let Some(parent) = absolute.parent() {
                create_parents(parent, &mut journal.created_dirs)
                    .map_err(|e| format!("cannot create parent directory: {}", e))?;
            }
            fs::write(&absolute, content).map_err(|e| format!("write failed: {}", e))
        }
        FileChange::Delete => {
            match fs::symlink_metadata(&absolute) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => return Err("deletion target is not a regular file".to_string()),
                Err(_) => return Err("deletion target does not exist".to_string()),
            }
            journal
                .record(relative, &absolute)
                .map_err(|e| format!("cannot read existing file: {}", e))?;
            fs::remove_file(&absolute).map_err(|e| format!("delete failed: {}", e))
        }
    }
}

/// `create_dir_all` that remembers which directories it made
fn create_parents(dir: &Path, created: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.exists() {
            break;
        }
        missing.push(path.to_path_buf());
        cursor = path.parent();
    }
    for path in missing.into_iter().rev() {
        fs::create_dir(&path)?;
        created.push(path);
    }
    Ok(())
}

fn build_diff(root: &Path, journal: &Journal) -> AppliedDiff {
    let mut diff = String::new();
    let mut files = Vec::new();

    for (relative, prior) in &journal.touched {
        let before = match prior {
            Prior::File(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Prior::Absent => None,
        };
        let after = fs::read(root.join(relative))
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let kind = match (&before, &after) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), None) => ChangeKind::Deleted,
            (Some(b), Some(a)) if b != a => ChangeKind::Modified,
            _ => continue,
        };

        let old_header = match kind {
            ChangeKind::Created => "/dev/null".to_string(),
            _ => format!("a/{}", relative),
        };
        let new_header = match kind {
            ChangeKind::Deleted => "/dev/null".to_string(),
            _ => format!("b/{}", relative),
        };

        let old_text = before.unwrap_or_default();
        let new_text = after.unwrap_or_default();
        diff.push_str(&format!("diff --git a/{0} b/{0}\n", relative));
        diff.push_str(
            &similar::TextDiff::from_lines(&old_text, &new_text)
                .unified_diff()
                .header(&old_header, &new_header)
                .to_string(),
        );

        files.push(ChangedFile {
            path: relative.clone(),
            kind,
        });
    }

    let digest = hex::encode(Sha256::digest(diff.as_bytes()));
    AppliedDiff {
        diff,
        files,
        digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backspace_core::FileEdit;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::create_dir_all(temp.path().join(".git")).unwrap();
        fs::write(temp.path().join("src/app.py"), "def main():\n    pass\n").unwrap();
        fs::write(temp.path().join("README.md"), "# Demo\n").unwrap();
        fs::write(temp.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        temp
    }

    /// Every file under `root` with its bytes
    fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let bytes = if e.file_type().is_file() {
                    fs::read(e.path()).unwrap()
                } else {
                    b"<dir>".to_vec()
                };
                (rel, bytes)
            })
            .collect()
    }

    fn applicator() -> PatchApplicator {
        PatchApplicator::new(&[".git", ".env"])
    }

    #[test]
    fn test_validate_path_rules() {
        let temp = fixture();
        let app = applicator();
        let root = temp.path();

        assert_eq!(app.validate_path(root, "./src/app.py").unwrap(), "src/app.py");
        assert_eq!(app.validate_path(root, "src/new/mod.rs").unwrap(), "src/new/mod.rs");
        assert!(app.validate_path(root, "/etc/passwd").is_err());
        assert!(app.validate_path(root, "../outside.txt").is_err());
        assert!(app.validate_path(root, "src/../../outside.txt").is_err());
        assert!(app.validate_path(root, ".git/config").is_err());
        assert!(app.validate_path(root, "config/.env").is_err());
        assert!(app.validate_path(root, "").is_err());
        assert!(app.validate_path(root, ".").is_err());
    }

    #[test]
    fn test_glob_protection() {
        let temp = fixture();
        let app = PatchApplicator::new(&["secrets/*.key"]);
        assert!(app.validate_path(temp.path(), "secrets/prod.key").is_err());
        assert!(app.validate_path(temp.path(), "secrets/notes.md").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let temp = fixture();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        let edits = EditSet::new(vec![FileEdit::write("link/pwned.txt", "x")]);
        let outcome = applicator().apply(temp.path(), &edits).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Conflict(ref c) if c.reason.contains("symlink")));
        assert!(!outside.path().join("pwned.txt").exists());
    }

    #[test]
    fn test_apply_create_modify_delete() {
        let temp = fixture();
        let edits = EditSet::new(vec![
            FileEdit::write("src/app.py", "def main():\n    print('hi')\n"),
            FileEdit::write("src/health/check.py", "def health():\n    return 'ok'\n"),
            FileEdit::delete("README.md"),
        ]);

        let outcome = applicator().apply(temp.path(), &edits).unwrap();
        let diff = match outcome {
            ApplyOutcome::Applied { diff, .. } => diff,
            other => panic!("expected applied, got {:?}", other),
        };

        assert_eq!(
            diff.files,
            vec![
                ChangedFile {
                    path: "src/app.py".into(),
                    kind: ChangeKind::Modified
                },
                ChangedFile {
                    path: "src/health/check.py".into(),
                    kind: ChangeKind::Created
                },
                ChangedFile {
                    path: "README.md".into(),
                    kind: ChangeKind::Deleted
                },
            ]
        );
        assert!(diff.diff.contains("--- a/src/app.py"));
        assert!(diff.diff.contains("+    print('hi')"));
        assert!(diff.diff.contains("--- /dev/null"));
        assert!(diff.diff.contains("+++ b/src/health/check.py"));
        assert!(diff.diff.contains("-# Demo"));
        assert_eq!(diff.digest.len(), 64);
        assert!(!temp.path().join("README.md").exists());
    }

    #[test]
    fn test_failure_on_last_edit_restores_everything() {
        let temp = fixture();
        let before = tree(temp.path());

        let edits = EditSet::new(vec![
            FileEdit::write("src/app.py", "broken"),
            FileEdit::write("pkg/deep/nested/new.py", "x = 1\n"),
            FileEdit::delete("README.md"),
            FileEdit::delete("does/not/exist.py"),
        ]);

        let outcome = applicator().apply(temp.path(), &edits).unwrap();
        match outcome {
            ApplyOutcome::Conflict(conflict) => {
                assert_eq!(conflict.index, 3);
                assert_eq!(conflict.path, "does/not/exist.py");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn test_write_through_file_parent_rolls_back() {
        let temp = fixture();
        let before = tree(temp.path());

        let edits = EditSet::new(vec![
            FileEdit::write("notes.txt", "new"),
            FileEdit::write("README.md/child.txt", "cannot exist"),
        ]);
        let outcome = applicator().apply(temp.path(), &edits).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Conflict(ref c) if c.index == 1));
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn test_traversal_rejected_before_any_write() {
        let temp = fixture();
        let before = tree(temp.path());

        let edits = EditSet::new(vec![
            FileEdit::write("ok.txt", "fine"),
            FileEdit::write("../escape.txt", "nope"),
        ]);
        let outcome = applicator().apply(temp.path(), &edits).unwrap();

        assert!(matches!(outcome, ApplyOutcome::Conflict(ref c) if c.index == 1));
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn test_same_path_twice_reports_net_change() {
        let temp = fixture();
        let edits = EditSet::new(vec![
            FileEdit::write("tmp.txt", "first"),
            FileEdit::delete("tmp.txt"),
            FileEdit::write("src/app.py", "one"),
            FileEdit::write("src/app.py", "two"),
        ]);

        let diff = match applicator().apply(temp.path(), &edits).unwrap() {
            ApplyOutcome::Applied { diff, .. } => diff,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].kind, ChangeKind::Modified);
        assert_eq!(fs::read_to_string(temp.path().join("src/app.py")).unwrap(), "two");
    }

    #[test]
    fn test_undo_log_restores_pre_apply_tree() {
        let temp = fixture();
        let before = tree(temp.path());
        let edits = EditSet::new(vec![
            FileEdit::write("src/app.py", "changed"),
            FileEdit::write("src/new/deep/mod.py", "x = 1\n"),
            FileEdit::delete("README.md"),
        ]);

        let undo = match applicator().apply(temp.path(), &edits).unwrap() {
            ApplyOutcome::Applied { undo, .. } => undo,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_ne!(tree(temp.path()), before);

        undo.revert(temp.path()).unwrap();
        assert_eq!(tree(temp.path()), before);
    }
}
