//! Workspace lifecycle: create, materialize, teardown
//!
//! Each job gets one directory under the sandbox root, named
//! `job-<short id>-<timestamp>`. The directory's byte quota is reserved from
//! the shared [`ResourceQuotas`] when it is created and released when it is
//! torn down. Teardown happens at most once per workspace; if the owner never
//! calls it, `Drop` removes the tree synchronously.

use backspace_core::{BackspaceError, JobId, RepositoryRef, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::quota::{BytePermit, ResourceQuotas};
use crate::source::SourceFetcher;

/// Directory prefix of every workspace
pub const WORKSPACE_PREFIX: &str = "job-";

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

type LiveSet = Arc<Mutex<HashSet<PathBuf>>>;

/// One isolated filesystem tree bound to a job
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    root: PathBuf,
    quota_bytes: u64,
    created_at: DateTime<Utc>,
    torn_down: AtomicBool,
    reservation: Mutex<Option<BytePermit>>,
    live: LiveSet,
}

impl Workspace {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Remove the tree and release the quota
    ///
    /// Returns `Ok(true)` for the call that performed the teardown and
    /// `Ok(false)` for every later call. Removal errors are returned but the
    /// workspace still counts as torn down; the reaper reclaims leftovers.
    #[instrument(skip(self), fields(job_id = %self.job_id, root = %self.root.display()))]
    pub async fn teardown(&self) -> Result<bool> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.release();

        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!("Workspace torn down");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(BackspaceError::Workspace(format!(
                "Failed to remove {}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    fn release(&self) {
        self.reservation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.root);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "Workspace {} dropped without teardown, removing synchronously",
            self.root.display()
        );
        self.release();
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Creates and populates workspaces under one sandbox root
pub struct WorkspaceManager {
    root: PathBuf,
    quotas: Arc<ResourceQuotas>,
    fetcher: Arc<dyn SourceFetcher>,
    probe_interval: Duration,
    live: LiveSet,
}

impl WorkspaceManager {
    pub fn new(
        root: impl Into<PathBuf>,
        quotas: Arc<ResourceQuotas>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            root: root.into(),
            quotas,
            fetcher,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// How often the tree size is sampled while materializing
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quotas(&self) -> &Arc<ResourceQuotas> {
        &self.quotas
    }

    /// True if `path` is the root of a workspace that has not been torn down
    pub fn is_live(&self, path: &Path) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    /// Reserve quota and allocate a fresh directory for `job_id`
    #[instrument(skip(self), fields(sandbox = %self.root.display()))]
    pub async fn create(&self, job_id: JobId, size_quota_bytes: u64) -> Result<Workspace> {
        let reservation = self.quotas.reserve_bytes(size_quota_bytes)?;

        tokio::fs::create_dir_all(&self.root).await?;
        let name = format!(
            "{}{}-{}",
            WORKSPACE_PREFIX,
            job_id.short(),
            Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        let root = self.root.join(name);
        // create_dir (not _all) so a name collision is an error
        tokio::fs::create_dir(&root).await?;

        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(root.clone());
        debug!("Created workspace {}", root.display());

        Ok(Workspace {
            job_id,
            root,
            quota_bytes: size_quota_bytes,
            created_at: Utc::now(),
            torn_down: AtomicBool::new(false),
            reservation: Mutex::new(Some(reservation)),
            live: Arc::clone(&self.live),
        })
    }

    /// Populate the workspace, enforcing its byte quota while the fetch runs
    ///
    /// Returns the materialized size in bytes. Exceeding the quota stops the
    /// fetch and tears the workspace down before returning `ResourceExhausted`.
    #[instrument(skip(self, workspace), fields(job_id = %workspace.job_id()))]
    pub async fn materialize(
        &self,
        workspace: &Workspace,
        repository: &RepositoryRef,
    ) -> Result<u64> {
        let result = self.fetch_within_quota(workspace, repository).await;

        if let Err(BackspaceError::ResourceExhausted(_)) = &result {
            if let Err(e) = workspace.teardown().await {
                warn!("Teardown after quota breach failed: {}", e);
            }
        }
        result
    }

    async fn fetch_within_quota(
        &self,
        workspace: &Workspace,
        repository: &RepositoryRef,
    ) -> Result<u64> {
        let quota = workspace.quota_bytes();
        let fetch = self.fetcher.fetch(repository, workspace.root());
        tokio::pin!(fetch);

        let mut probe = tokio::time::interval(self.probe_interval);
        loop {
            tokio::select! {
                fetched = &mut fetch => {
                    fetched?;
                    break;
                }
                _ = probe.tick() => {
                    let size = tree_size(workspace.root()).await?;
                    if size > quota {
                        return Err(quota_error(size, quota));
                    }
                }
            }
        }

        let size = tree_size(workspace.root()).await?;
        if size > quota {
            return Err(quota_error(size, quota));
        }
        info!("Materialized {} ({} bytes)", repository, size);
        Ok(size)
    }

    /// Tear down a workspace; see [`Workspace::teardown`]
    pub async fn teardown(&self, workspace: &Workspace) -> Result<bool> {
        workspace.teardown().await
    }
}

fn quota_error(size: u64, quota: u64) -> BackspaceError {
    BackspaceError::ResourceExhausted(format!(
        "repository size {} bytes exceeds workspace quota of {} bytes",
        size, quota
    ))
}

/// Total size of regular files under `root`, without following symlinks
pub async fn tree_size(root: &Path) -> Result<u64> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            // Entries vanish mid-walk while a fetch is writing
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum::<u64>()
    })
    .await
    .map_err(|e| BackspaceError::Workspace(format!("Size probe failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalDirSource;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Writes `chunks` files of `chunk` bytes, pausing between writes
    struct SlowWriter {
        chunks: usize,
        chunk: usize,
    }

    #[async_trait]
    impl SourceFetcher for SlowWriter {
        async fn fetch(&self, _: &RepositoryRef, destination: &Path) -> Result<()> {
            for i in 0..self.chunks {
                tokio::fs::write(destination.join(format!("blob-{}", i)), vec![b'x'; self.chunk])
                    .await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(())
        }
    }

    fn manager(root: &Path, fetcher: Arc<dyn SourceFetcher>) -> WorkspaceManager {
        WorkspaceManager::new(root, ResourceQuotas::new(4, 10_000), fetcher)
            .with_probe_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_create_reserves_and_teardown_releases() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path(), Arc::new(LocalDirSource::new()));

        let ws = manager.create(JobId::new(), 4_000).await.unwrap();
        assert!(ws.root().is_dir());
        assert!(ws.root().starts_with(sandbox.path()));
        assert!(manager.is_live(ws.root()));
        assert_eq!(manager.quotas().usage().bytes, 4_000);

        assert!(manager.teardown(&ws).await.unwrap());
        assert!(!ws.root().exists());
        assert!(!manager.is_live(ws.root()));
        assert_eq!(manager.quotas().usage().bytes, 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path(), Arc::new(LocalDirSource::new()));
        let ws = manager.create(JobId::new(), 100).await.unwrap();

        assert!(ws.teardown().await.unwrap());
        assert!(!ws.teardown().await.unwrap());
        assert!(!ws.teardown().await.unwrap());
        assert!(ws.is_torn_down());
    }

    #[tokio::test]
    async fn test_create_over_budget() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path(), Arc::new(LocalDirSource::new()));
        let _held = manager.create(JobId::new(), 8_000).await.unwrap();

        let result = manager.create(JobId::new(), 8_000).await;
        assert!(matches!(result, Err(BackspaceError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_drop_removes_tree() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path(), Arc::new(LocalDirSource::new()));
        let ws = manager.create(JobId::new(), 100).await.unwrap();
        let root = ws.root().to_path_buf();

        drop(ws);
        assert!(!root.exists());
        assert_eq!(manager.quotas().usage().bytes, 0);
    }

    #[tokio::test]
    async fn test_materialize_local_dir() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("main.py"), "print('hi')\n").unwrap();

        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path(), Arc::new(LocalDirSource::new()));
        let ws = manager.create(JobId::new(), 1_000).await.unwrap();

        let size = manager
            .materialize(
                &ws,
                &RepositoryRef::Local {
                    path: src.path().to_path_buf(),
                },
            )
            .await
            .unwrap();
        assert_eq!(size, 12);
        assert!(ws.root().join("main.py").exists());
        ws.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_breach_aborts_and_tears_down() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(
            sandbox.path(),
            Arc::new(SlowWriter {
                chunks: 50,
                chunk: 200,
            }),
        );
        let ws = manager.create(JobId::new(), 1_000).await.unwrap();

        let result = manager
            .materialize(
                &ws,
                &RepositoryRef::Remote {
                    url: "https://example.invalid/big.git".into(),
                },
            )
            .await;

        assert!(matches!(result, Err(BackspaceError::ResourceExhausted(_))));
        assert!(ws.is_torn_down());
        assert!(!ws.root().exists());
        // A later teardown from the owner is a no-op
        assert!(!ws.teardown().await.unwrap());
    }
}
