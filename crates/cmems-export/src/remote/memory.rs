//! In-memory remote store with scriptable failures and ingestion responses

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{parent_dir, RemoteEntry, RemoteError, RemoteResult, RemoteStore};

#[derive(Debug)]
struct PendingResponse {
    misses_left: u32,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    fail_uploads: HashSet<String>,
    fail_removals: HashSet<String>,
    unreachable: bool,
    responses: HashMap<String, PendingResponse>,
    default_responses: Vec<(String, Vec<u8>)>,
    operations: usize,
}

impl Tree {
    fn ensure_reachable(&self) -> RemoteResult<()> {
        if self.unreachable {
            Err(RemoteError::Connection("push server unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.dirs.iter().any(|d| d.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }
}

/// A remote store that lives in memory.
///
/// Failures are matched on the file name, so a test can make one data file
/// fail without knowing where the driver will put it.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    tree: Mutex<Tree>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        let mut tree = Tree::default();
        tree.dirs.insert("/".to_string());
        Self {
            tree: Mutex::new(tree),
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count an operation and fail it if the store is unreachable
    fn begin(&self) -> RemoteResult<MutexGuard<'_, Tree>> {
        let mut tree = self.lock();
        tree.operations += 1;
        tree.ensure_reachable()?;
        Ok(tree)
    }

    /// Make every upload of `filename` fail with a transport error
    pub fn fail_uploads_of(&self, filename: &str) {
        self.lock().fail_uploads.insert(filename.to_string());
    }

    /// Make every removal of `filename` fail with a transport error
    pub fn fail_removals_of(&self, filename: &str) {
        self.lock().fail_removals.insert(filename.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Script an ingestion response: the first `misses` fetches of `path`
    /// find nothing, the next one returns `body`.
    pub fn respond_after(&self, path: &str, misses: u32, body: impl Into<Vec<u8>>) {
        self.lock().responses.insert(
            path.to_string(),
            PendingResponse {
                misses_left: misses,
                body: body.into(),
            },
        );
    }

    /// Answer any otherwise unscripted fetch below `prefix` with `body`
    pub fn respond_to_all_under(&self, prefix: &str, body: impl Into<Vec<u8>>) {
        self.lock()
            .default_responses
            .push((prefix.to_string(), body.into()));
    }

    /// Place a file (and its folders) directly
    pub fn seed_file(&self, path: &str, body: impl Into<Vec<u8>>) {
        let mut tree = self.lock();
        let mut current = String::new();
        for part in parent_dir(path).split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            tree.dirs.insert(current.clone());
        }
        tree.files.insert(path.to_string(), body.into());
    }

    /// Number of trait operations issued so far
    pub fn operations(&self) -> usize {
        self.lock().operations
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.lock().dirs.iter().cloned().collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn is_dir(&self, path: &str) -> RemoteResult<bool> {
        Ok(self.begin()?.dirs.contains(path))
    }

    async fn mkdir(&self, path: &str) -> RemoteResult<()> {
        let mut tree = self.begin()?;
        if !tree.dirs.contains(parent_dir(path)) {
            return Err(RemoteError::NotFound(parent_dir(path).to_string()));
        }
        if !tree.dirs.insert(path.to_string()) {
            return Err(RemoteError::transport(path, "directory already exists"));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        Ok(self.begin()?.files.contains_key(path))
    }

    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<u64> {
        let mut tree = self.begin()?;
        if tree.fail_uploads.contains(file_name(remote)) {
            return Err(RemoteError::transport(remote, "451 upload aborted"));
        }
        if !tree.dirs.contains(parent_dir(remote)) {
            return Err(RemoteError::transport(remote, "553 no such directory"));
        }
        let body = std::fs::read(local)?;
        let len = body.len() as u64;
        tree.files.insert(remote.to_string(), body);
        Ok(len)
    }

    async fn get(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        let mut tree = self.begin()?;
        if let Some(body) = tree.files.get(remote) {
            return Ok(body.clone());
        }

        if let Some(pending) = tree.responses.get_mut(remote) {
            if pending.misses_left > 0 {
                pending.misses_left -= 1;
                return Err(RemoteError::NotFound(remote.to_string()));
            }
            let body = pending.body.clone();
            tree.responses.remove(remote);
            tree.files.insert(remote.to_string(), body.clone());
            return Ok(body);
        }

        let fallback = tree
            .default_responses
            .iter()
            .find(|(prefix, _)| remote.starts_with(prefix.as_str()))
            .map(|(_, body)| body.clone());
        fallback.ok_or_else(|| RemoteError::NotFound(remote.to_string()))
    }

    async fn remove(&self, remote: &str) -> RemoteResult<()> {
        let mut tree = self.begin()?;
        if tree.fail_removals.contains(file_name(remote)) {
            return Err(RemoteError::transport(remote, "550 permission denied"));
        }
        tree.files
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))
    }

    async fn rmdir(&self, path: &str) -> RemoteResult<()> {
        let mut tree = self.begin()?;
        if !tree.dirs.contains(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        if tree.has_children(path) {
            return Err(RemoteError::transport(path, "directory not empty"));
        }
        tree.dirs.remove(path);
        Ok(())
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let tree = self.begin()?;
        if !tree.dirs.contains(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }

        let is_child = |candidate: &str| candidate != path && parent_dir(candidate) == path;
        let dirs = tree.dirs.iter().filter(|d| is_child(d)).map(|d| RemoteEntry {
            name: file_name(d).to_string(),
            is_directory: true,
            size: None,
        });
        let files = tree.files.iter().filter(|(f, _)| is_child(f)).map(|(f, body)| RemoteEntry {
            name: file_name(f).to_string(),
            is_directory: false,
            size: Some(body.len() as u64),
        });
        Ok(dirs.chain(files).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_folder() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("A_20240101.nc");
        std::fs::write(&local, b"netcdf").unwrap();

        let store = MemoryRemoteStore::new();
        assert!(store.put(&local, "/P/D/A_20240101.nc").await.is_err());

        store.ensure_dir("/P/D").await.unwrap();
        assert_eq!(store.put(&local, "/P/D/A_20240101.nc").await.unwrap(), 6);
        assert!(store.exists("/P/D/A_20240101.nc").await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_response() {
        let store = MemoryRemoteStore::new();
        store.respond_after("/P/DNT_response/x_response.xml", 2, "<ok/>");

        assert!(matches!(
            store.get("/P/DNT_response/x_response.xml").await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(store.get("/P/DNT_response/x_response.xml").await.is_err());
        assert_eq!(store.get("/P/DNT_response/x_response.xml").await.unwrap(), b"<ok/>");
        assert_eq!(store.operations(), 3);
    }

    #[tokio::test]
    async fn test_listing_and_rmdir() {
        let store = MemoryRemoteStore::new();
        store.seed_file("/P/D/latest/20240101/A.nc", "a");
        store.ensure_dir("/P/D/latest/20240102").await.unwrap();

        let mut names: Vec<_> = store
            .list("/P/D/latest")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["20240101", "20240102"]);

        assert!(store.rmdir("/P/D/latest/20240101").await.is_err());
        store.rmdir("/P/D/latest/20240102").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = MemoryRemoteStore::new();
        store.set_unreachable(true);
        assert!(matches!(store.is_dir("/").await, Err(RemoteError::Connection(_))));
    }
}
