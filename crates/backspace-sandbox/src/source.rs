//! Source materialization
//!
//! A [`SourceFetcher`] populates an empty workspace directory with the
//! contents of a repository. Fetches must be cancel-safe: dropping the future
//! stops the work (subprocesses are spawned with `kill_on_drop`).

use async_trait::async_trait;
use backspace_core::{BackspaceError, RepositoryRef, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Populate `destination` with the repository contents
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, repository: &RepositoryRef, destination: &Path) -> Result<()>;
}

/// Shallow `git clone` of remote repositories
#[derive(Debug, Clone)]
pub struct GitSource {
    program: String,
}

impl GitSource {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Use a different git binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[instrument(skip(self), fields(program = %self.program))]
    async fn clone_into(&self, url: &str, destination: &Path) -> Result<()> {
        debug!("Cloning {} into {}", url, destination.display());

        let output = Command::new(&self.program)
            .args(["clone", "--depth", "1", "--single-branch", "--quiet", "--"])
            .arg(url)
            .arg(destination)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackspaceError::SourceUnavailable(format!("Failed to run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackspaceError::SourceUnavailable(format!(
                "git clone {} failed: {}",
                url,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Default for GitSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for GitSource {
    async fn fetch(&self, repository: &RepositoryRef, destination: &Path) -> Result<()> {
        match repository {
            RepositoryRef::Remote { url } => self.clone_into(url, destination).await,
            RepositoryRef::Local { path } => Err(BackspaceError::SourceUnavailable(format!(
                "{} is a local path, not a clonable URL",
                path.display()
            ))),
        }
    }
}

/// Copies a local directory tree into the workspace
///
/// Symlinks are never followed or copied.
#[derive(Debug, Clone, Default)]
pub struct LocalDirSource;

impl LocalDirSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceFetcher for LocalDirSource {
    async fn fetch(&self, repository: &RepositoryRef, destination: &Path) -> Result<()> {
        let source = match repository {
            RepositoryRef::Local { path } => path.clone(),
            RepositoryRef::Remote { url } => {
                return Err(BackspaceError::SourceUnavailable(format!(
                    "{} is a remote URL, not a local directory",
                    url
                )))
            }
        };

        if !tokio::fs::metadata(&source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(BackspaceError::SourceUnavailable(format!(
                "{} is not a readable directory",
                source.display()
            )));
        }

        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &destination))
            .await
            .map_err(|e| BackspaceError::Workspace(format!("Copy task failed: {}", e)))?
    }
}

/// Dispatches remote references to git and local paths to a directory copy
#[derive(Debug, Clone, Default)]
pub struct RepositorySource {
    git: GitSource,
    local: LocalDirSource,
}

impl RepositorySource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceFetcher for RepositorySource {
    async fn fetch(&self, repository: &RepositoryRef, destination: &Path) -> Result<()> {
        match repository {
            RepositoryRef::Remote { .. } => self.git.fetch(repository, destination).await,
            RepositoryRef::Local { .. } => self.local.fetch(repository, destination).await,
        }
    }
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let source = source.canonicalize()?;
    let skip: Option<PathBuf> = destination.canonicalize().ok();

    let walker = WalkDir::new(&source).follow_links(false).min_depth(1);
    for entry in walker.into_iter().filter_entry(|e| {
        // Never copy the workspace into itself when the sandbox lives inside the source
        skip.as_deref().map(|s| !e.path().starts_with(s)).unwrap_or(true)
    }) {
        let entry = entry.map_err(|e| BackspaceError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(&source)
            .map_err(|e| BackspaceError::Workspace(e.to_string()))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!("Skipping symlink {}", entry.path().display());
        } else if file_type.is_dir() {
            // Non-recursive: a torn-down destination stops the copy
            std::fs::create_dir(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local(path: &Path) -> RepositoryRef {
        RepositoryRef::Local {
            path: path.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_local_copy() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("src/nested")).unwrap();
        std::fs::write(src.path().join("README.md"), "hello").unwrap();
        std::fs::write(src.path().join("src/nested/lib.rs"), "fn x() {}").unwrap();

        let dst = TempDir::new().unwrap();
        LocalDirSource::new()
            .fetch(&local(src.path()), dst.path())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dst.path().join("src/nested/lib.rs")).unwrap(),
            "fn x() {}"
        );
        assert!(dst.path().join("README.md").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_copy_skips_symlinks() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", src.path().join("escape")).unwrap();

        let dst = TempDir::new().unwrap();
        LocalDirSource::new()
            .fetch(&local(src.path()), dst.path())
            .await
            .unwrap();

        assert!(dst.path().join("real.txt").exists());
        assert!(std::fs::symlink_metadata(dst.path().join("escape")).is_err());
    }

    #[tokio::test]
    async fn test_missing_local_dir_is_source_unavailable() {
        let dst = TempDir::new().unwrap();
        let result = LocalDirSource::new()
            .fetch(&local(Path::new("/definitely/not/here")), dst.path())
            .await;
        assert!(matches!(result, Err(BackspaceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_git_rejects_local_reference() {
        let dst = TempDir::new().unwrap();
        let result = GitSource::new().fetch(&local(dst.path()), dst.path()).await;
        assert!(matches!(result, Err(BackspaceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_git_binary_is_source_unavailable() {
        let dst = TempDir::new().unwrap();
        let repo = RepositoryRef::Remote {
            url: "https://example.invalid/repo.git".to_string(),
        };
        let result = GitSource::new()
            .with_program("backspace-no-such-git")
            .fetch(&repo, &dst.path().join("clone"))
            .await;
        assert!(matches!(result, Err(BackspaceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_option_like_url_is_not_parsed_as_flag() {
        let dst = TempDir::new().unwrap();
        // Without the separator `git clone --version` exits 0
        let repo = RepositoryRef::Remote {
            url: "--version".to_string(),
        };
        let result = GitSource::new()
            .fetch(&repo, &dst.path().join("clone"))
            .await;
        assert!(matches!(result, Err(BackspaceError::SourceUnavailable(_))));
    }
}
