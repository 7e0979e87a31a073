//! The DFS primitives RSS assumes as external infrastructure (§1, §6):
//! write-new, atomic rename, and list. `LocalFsDfs` is the reference
//! implementation used by tests and single-node deployments; production
//! deployments plug in an HDFS- or S3-backed `Dfs` impl.

use async_trait::async_trait;
use rss_common::error::RssError;
use std::path::PathBuf;

/// The DFS contract RSS depends on. All paths are slash-separated and
/// rooted at the `root_dir` configured for the cluster.
#[async_trait]
pub trait Dfs: Send + Sync {
    /// Atomically publish `tmp_path` as `final_path`. Used for stage markers
    /// so a reader never observes a partially-written marker.
    async fn atomic_rename(&self, tmp_path: &str, final_path: &str) -> Result<(), RssError>;

    /// Write `data` to `path` in one shot (used for small marker files).
    async fn write_new(&self, path: &str, data: &[u8]) -> Result<(), RssError>;

    /// List immediate children of `dir`, returned as full paths.
    async fn list(&self, dir: &str) -> Result<Vec<String>, RssError>;

    async fn exists(&self, path: &str) -> Result<bool, RssError>;

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, RssError>;

    /// Recursively delete `path` and everything under it.
    async fn delete_tree(&self, path: &str) -> Result<(), RssError>;
}

fn dfs_err(path: &str, e: std::io::Error) -> RssError {
    RssError::DfsError {
        stage: None,
        partition_id: None,
        message: format!("{path}: {e}"),
    }
}

/// Reference `Dfs` implementation backed by the local filesystem, rooted at
/// an arbitrary base directory. Good enough for single-node deployments and
/// for exercising the rest of RSS in tests without a real DFS cluster.
pub struct LocalFsDfs {
    base: PathBuf,
}

impl LocalFsDfs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Dfs for LocalFsDfs {
    async fn atomic_rename(&self, tmp_path: &str, final_path: &str) -> Result<(), RssError> {
        let from = self.resolve(tmp_path);
        let to = self.resolve(final_path);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| dfs_err(final_path, e))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| dfs_err(final_path, e))
    }

    async fn write_new(&self, path: &str, data: &[u8]) -> Result<(), RssError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| dfs_err(path, e))?;
        }
        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, data).await.map_err(|e| dfs_err(path, e))?;
        tokio::fs::rename(&tmp, &full).await.map_err(|e| dfs_err(path, e))
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, RssError> {
        let full = self.resolve(dir);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(dfs_err(dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| dfs_err(dir, e))? {
            let rel = entry
                .path()
                .strip_prefix(&self.base)
                .unwrap_or(&entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            names.push(rel);
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, RssError> {
        Ok(tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| dfs_err(path, e))?)
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, RssError> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| dfs_err(path, e))
    }

    async fn delete_tree(&self, path: &str) -> Result<(), RssError> {
        let full = self.resolve(path);
        match tokio::fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(dfs_err(path, e)),
        }
    }
}

/// Helper for tests elsewhere in the workspace: a `LocalFsDfs` rooted at a
/// fresh temp directory, kept alive by the returned `TempDir` guard.
pub fn local_fs_for_test() -> (tempfile::TempDir, LocalFsDfs) {
    let dir = tempfile::tempdir().expect("create temp dir for LocalFsDfs test");
    let dfs = LocalFsDfs::new(dir.path().to_path_buf());
    (dir, dfs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_returns_children_sorted() {
        let (_guard, dfs) = local_fs_for_test();
        dfs.write_new("dir/b.txt", b"b").await.unwrap();
        dfs.write_new("dir/a.txt", b"a").await.unwrap();
        let names = dfs.list("dir").await.unwrap();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("a.txt"));
        assert!(names[1].ends_with("b.txt"));
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty_not_error() {
        let (_guard, dfs) = local_fs_for_test();
        let names = dfs.list("does/not/exist").await.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn atomic_rename_publishes_marker() {
        let (_guard, dfs) = local_fs_for_test();
        dfs.write_new("stage/_SUCCESS.tmp", b"ok").await.unwrap();
        assert!(!dfs.exists("stage/_SUCCESS").await.unwrap());
        dfs.atomic_rename("stage/_SUCCESS.tmp", "stage/_SUCCESS").await.unwrap();
        assert!(dfs.exists("stage/_SUCCESS").await.unwrap());
    }

    #[tokio::test]
    async fn delete_tree_removes_everything_under_path() {
        let (_guard, dfs) = local_fs_for_test();
        dfs.write_new("app/stage/partition-0/part-1", b"x").await.unwrap();
        dfs.delete_tree("app").await.unwrap();
        assert!(!dfs.exists("app/stage/partition-0/part-1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_tree_missing_path_is_not_an_error() {
        let (_guard, dfs) = local_fs_for_test();
        dfs.delete_tree("nonexistent").await.unwrap();
    }
}
