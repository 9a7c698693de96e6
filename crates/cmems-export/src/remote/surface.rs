//! Pre-run consistency check of the remote data tree.
//!
//! The ingestion service empties the data tree as it ingests, so between runs
//! the tree holds at most empty date folders. Anything else is left over
//! from an overlapping or aborted run.

use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

use super::{join, RemoteResult, RemoteStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceReport {
    /// Empty folders removed during the check
    pub removed_dirs: Vec<String>,
    /// Files still waiting below the data root
    pub stranded_files: Vec<String>,
}

impl SurfaceReport {
    pub fn is_clean(&self) -> bool {
        self.stranded_files.is_empty()
    }
}

/// Remove empty folders below `data_root` and report any stranded files.
///
/// `data_root` itself is created when missing and never removed.
pub async fn check_remote_surface(
    store: &dyn RemoteStore,
    data_root: &str,
) -> RemoteResult<SurfaceReport> {
    let mut report = SurfaceReport::default();

    if !store.is_dir(data_root).await? {
        debug!(%data_root, "Data root missing, creating it");
        store.ensure_dir(data_root).await?;
        return Ok(report);
    }

    sweep(store, data_root.to_string(), &mut report).await?;

    for path in &report.stranded_files {
        warn!(remote_path = %path, "Uningested file found on push server");
    }
    Ok(report)
}

/// Depth-first sweep; returns whether `dir` still has content afterwards
fn sweep<'a>(
    store: &'a dyn RemoteStore,
    dir: String,
    report: &'a mut SurfaceReport,
) -> Pin<Box<dyn Future<Output = RemoteResult<bool>> + Send + 'a>> {
    Box::pin(async move {
        let mut occupied = false;
        for entry in store.list(&dir).await? {
            let path = join(&dir, &entry.name);
            if entry.is_directory {
                if sweep(store, path.clone(), report).await? {
                    occupied = true;
                } else {
                    debug!(remote_path = %path, "Removing empty directory");
                    store.rmdir(&path).await?;
                    report.removed_dirs.push(path);
                }
            } else {
                occupied = true;
                report.stranded_files.push(path);
            }
        }
        Ok(occupied)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    #[tokio::test]
    async fn test_missing_root_is_created() {
        let store = MemoryRemoteStore::new();
        let report = check_remote_surface(&store, "/P/D/latest").await.unwrap();
        assert!(report.is_clean());
        assert!(store.is_dir("/P/D/latest").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_folders_are_removed() {
        let store = MemoryRemoteStore::new();
        store.ensure_dir("/P/D/latest/20240101").await.unwrap();
        store.ensure_dir("/P/D/latest/20240102").await.unwrap();

        let report = check_remote_surface(&store, "/P/D/latest").await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.removed_dirs.len(), 2);
        assert!(store.is_dir("/P/D/latest").await.unwrap());
        assert!(!store.is_dir("/P/D/latest/20240101").await.unwrap());
    }

    #[tokio::test]
    async fn test_stranded_file_is_reported() {
        let store = MemoryRemoteStore::new();
        store.seed_file("/P/D/latest/20240101/A_20240101.nc", "a");
        store.ensure_dir("/P/D/latest/20240102").await.unwrap();

        let report = check_remote_surface(&store, "/P/D/latest").await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.stranded_files, vec!["/P/D/latest/20240101/A_20240101.nc"]);
        assert_eq!(report.removed_dirs, vec!["/P/D/latest/20240102"]);
        assert!(store.contains("/P/D/latest/20240101/A_20240101.nc"));
    }
}
