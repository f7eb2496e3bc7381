//! Background reclamation of orphaned workspaces
//!
//! Teardown is best effort, so directories can outlive their job (failed
//! removal, crashed process). The reaper deletes workspace directories under
//! the sandbox root that are older than a cutoff and not owned by a live job.

use backspace_core::fail_open::fail_open_with_retries;
use backspace_core::{BackspaceError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::{WorkspaceManager, WORKSPACE_PREFIX};

/// Removal attempts per orphan before leaving it for the next sweep
const REMOVE_ATTEMPTS: usize = 3;

/// Remove orphaned workspaces older than `max_age`
///
/// Returns the directories that were removed.
pub async fn reap_orphans(manager: &WorkspaceManager, max_age: Duration) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(manager.root()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };
    let now = SystemTime::now();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_workspace = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(WORKSPACE_PREFIX))
            .unwrap_or(false);
        if !is_workspace || manager.is_live(&path) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            debug!("Keeping {} (age {:?})", path.display(), age);
            continue;
        }

        let result = fail_open_with_retries(
            "reap_workspace",
            || {
                let target = path.clone();
                async move {
                    match tokio::fs::remove_dir_all(&target).await {
                        Ok(()) => Ok(()),
                        // Removed between attempts
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(BackspaceError::from(e)),
                    }
                }
            },
            REMOVE_ATTEMPTS,
        )
        .await;
        if result.is_some() {
            info!("Reaped orphaned workspace {}", path.display());
            removed.push(path);
        }
    }

    Ok(removed)
}

/// Run [`reap_orphans`] every `interval` until `cancel` fires
pub fn spawn_reaper(
    manager: Arc<WorkspaceManager>,
    max_age: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = reap_orphans(&manager, max_age).await {
                        warn!("Orphan reaping failed: {}", e);
                    }
                }
            }
        }
        debug!("Reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ResourceQuotas;
    use crate::source::LocalDirSource;
    use backspace_core::JobId;
    use tempfile::TempDir;

    fn manager(root: &std::path::Path) -> WorkspaceManager {
        WorkspaceManager::new(
            root,
            ResourceQuotas::new(4, 1_000_000),
            Arc::new(LocalDirSource::new()),
        )
    }

    #[tokio::test]
    async fn test_reaps_only_orphans() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path());

        let live = manager.create(JobId::new(), 100).await.unwrap();
        let orphan = sandbox.path().join("job-deadbeef-20240101000000000");
        std::fs::create_dir_all(orphan.join("src")).unwrap();
        let unrelated = sandbox.path().join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        let removed = reap_orphans(&manager, Duration::ZERO).await.unwrap();

        assert_eq!(removed, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(live.root().exists());
        assert!(unrelated.exists());
        live.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_young_orphans_survive() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path());
        let orphan = sandbox.path().join("job-cafebabe-20240101000000000");
        std::fs::create_dir_all(&orphan).unwrap();

        let removed = reap_orphans(&manager, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert!(orphan.exists());
    }

    #[tokio::test]
    async fn test_reaps_every_orphan_in_one_sweep() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(sandbox.path());
        let orphans: Vec<PathBuf> = [
            "job-00000001-20240101000000000",
            "job-00000002-20240101000000000",
        ]
        .iter()
        .map(|name| sandbox.path().join(name))
        .collect();
        for orphan in &orphans {
            std::fs::create_dir_all(orphan.join("node_modules/.bin")).unwrap();
            std::fs::write(orphan.join("node_modules/.bin/tool"), "#!/bin/sh\n").unwrap();
        }

        let mut removed = reap_orphans(&manager, Duration::ZERO).await.unwrap();
        removed.sort();

        assert_eq!(removed, orphans);
        assert!(orphans.iter().all(|o| !o.exists()));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let sandbox = TempDir::new().unwrap();
        let manager = manager(&sandbox.path().join("never-created"));
        assert!(reap_orphans(&manager, Duration::ZERO).await.unwrap().is_empty());
    }
}
