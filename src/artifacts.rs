//! Artifact and log storage.
//!
//! The store is append-only under unique per-run names, so concurrent
//! writers never need coordination; re-uploading the same `(run_id, name)`
//! pair overwrites identical content and is therefore idempotent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Blob store for run artifacts (build products, diffoscope inputs) and
/// log files. Implementations must be idempotent by `(run_id, name)`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload all files from `local_dir`, or only `names` when given.
    async fn store(&self, run_id: &str, local_dir: &Path, names: Option<&[String]>)
    -> Result<()>;

    /// Fetch all of a run's artifacts into `dest_dir`.
    async fn retrieve(&self, run_id: &str, dest_dir: &Path) -> Result<()>;

    async fn iter_ids(&self) -> Result<Vec<String>>;

    async fn delete(&self, run_id: &str) -> Result<()>;

    /// Upload log files from `local_dir`. Names must satisfy
    /// [`is_log_filename`].
    async fn store_logs(&self, run_id: &str, local_dir: &Path) -> Result<()>;

    /// Fetch a single log file; `None` when the run or file is unknown.
    async fn retrieve_log(&self, run_id: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Names of a run's stored log files.
    async fn list_logs(&self, run_id: &str) -> Result<Vec<String>>;
}

/// `*.log` or `*.log.N` for a decimal N.
pub fn is_log_filename(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return false;
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return !stem.is_empty();
    }
    if let Some(idx) = name.rfind(".log.") {
        let (stem, suffix) = (&name[..idx], &name[idx + ".log.".len()..]);
        return !stem.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

/// Filesystem-backed store: `<root>/artifacts/<run_id>/<name>` and
/// `<root>/logs/<run_id>/<name>`.
pub struct LocalArtifactStore {
    artifact_root: PathBuf,
    log_root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(artifact_root: PathBuf, log_root: PathBuf) -> Self {
        Self {
            artifact_root,
            log_root,
        }
    }

    async fn copy_dir(
        src: &Path,
        dest: &Path,
        filter: Option<&(dyn Fn(&str) -> bool + Sync)>,
    ) -> Result<usize> {
        tokio::fs::create_dir_all(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut entries = tokio::fs::read_dir(src)
            .await
            .with_context(|| format!("Failed to read {}", src.display()))?;
        let mut copied = 0;
        while let Some(entry) = entries.next_entry().await.context("Failed to list directory")? {
            if !entry.file_type().await.context("Failed to stat entry")?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(filter) = filter {
                if !filter(&name) {
                    continue;
                }
            }
            tokio::fs::copy(entry.path(), dest.join(&name))
                .await
                .with_context(|| format!("Failed to copy {name}"))?;
            copied += 1;
        }
        Ok(copied)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        run_id: &str,
        local_dir: &Path,
        names: Option<&[String]>,
    ) -> Result<()> {
        let dest = self.artifact_root.join(run_id);
        match names {
            Some(names) => {
                tokio::fs::create_dir_all(&dest)
                    .await
                    .with_context(|| format!("Failed to create {}", dest.display()))?;
                for name in names {
                    tokio::fs::copy(local_dir.join(name), dest.join(name))
                        .await
                        .with_context(|| format!("Failed to store artifact {name}"))?;
                }
            }
            None => {
                Self::copy_dir(local_dir, &dest, None).await?;
            }
        }
        Ok(())
    }

    async fn retrieve(&self, run_id: &str, dest_dir: &Path) -> Result<()> {
        let src = self.artifact_root.join(run_id);
        if !src.is_dir() {
            anyhow::bail!("No artifacts stored for run {run_id}");
        }
        Self::copy_dir(&src, dest_dir, None).await?;
        Ok(())
    }

    async fn iter_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.artifact_root.is_dir() {
            return Ok(ids);
        }
        let mut entries = tokio::fs::read_dir(&self.artifact_root)
            .await
            .context("Failed to read artifact root")?;
        while let Some(entry) = entries.next_entry().await.context("Failed to list artifact root")? {
            if entry.file_type().await.context("Failed to stat entry")?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        let dir = self.artifact_root.join(run_id);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to delete artifacts for {run_id}"))?;
        }
        Ok(())
    }

    async fn store_logs(&self, run_id: &str, local_dir: &Path) -> Result<()> {
        let dest = self.log_root.join(run_id);
        Self::copy_dir(local_dir, &dest, Some(&is_log_filename)).await?;
        Ok(())
    }

    async fn retrieve_log(&self, run_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        if !is_log_filename(name) {
            return Ok(None);
        }
        let path = self.log_root.join(run_id).join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read log {name} for {run_id}"))
            }
        }
    }

    async fn list_logs(&self, run_id: &str) -> Result<Vec<String>> {
        let dir = self.log_root.join(run_id);
        let mut names = Vec::new();
        if !dir.is_dir() {
            return Ok(names);
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context("Failed to read log directory")?;
        while let Some(entry) = entries.next_entry().await.context("Failed to list logs")? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(root: &TempDir) -> LocalArtifactStore {
        LocalArtifactStore::new(root.path().join("artifacts"), root.path().join("logs"))
    }

    #[test]
    fn test_log_filename_pattern() {
        assert!(is_log_filename("worker.log"));
        assert!(is_log_filename("build.log.1"));
        assert!(is_log_filename("build.log.12"));
        assert!(!is_log_filename(".log"));
        assert!(!is_log_filename("build.log.abc"));
        assert!(!is_log_filename("build.txt"));
        assert!(!is_log_filename("../escape.log"));
        assert!(!is_log_filename(".hidden.log"));
    }

    #[tokio::test]
    async fn test_store_and_retrieve_artifacts() -> Result<()> {
        let root = TempDir::new()?;
        let store = store(&root);
        let src = TempDir::new()?;
        tokio::fs::write(src.path().join("foo.deb"), b"deb-bytes").await?;
        tokio::fs::write(src.path().join("foo.changes"), b"changes").await?;

        store.store("run-1", src.path(), None).await?;
        // Idempotent re-upload.
        store.store("run-1", src.path(), None).await?;

        let dest = TempDir::new()?;
        store.retrieve("run-1", dest.path()).await?;
        let bytes = tokio::fs::read(dest.path().join("foo.deb")).await?;
        assert_eq!(bytes, b"deb-bytes");

        assert_eq!(store.iter_ids().await?, vec!["run-1".to_string()]);
        store.delete("run-1").await?;
        assert!(store.iter_ids().await?.is_empty());
        assert!(store.retrieve("run-1", dest.path()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_logs_filters_non_logs() -> Result<()> {
        let root = TempDir::new()?;
        let store = store(&root);
        let src = TempDir::new()?;
        tokio::fs::write(src.path().join("worker.log"), b"log-bytes").await?;
        tokio::fs::write(src.path().join("junk.bin"), b"junk").await?;

        store.store_logs("run-1", src.path()).await?;
        assert_eq!(store.list_logs("run-1").await?, vec!["worker.log".to_string()]);
        assert_eq!(
            store.retrieve_log("run-1", "worker.log").await?.as_deref(),
            Some(b"log-bytes".as_ref())
        );
        assert_eq!(store.retrieve_log("run-1", "junk.bin").await?, None);
        assert_eq!(store.retrieve_log("run-2", "worker.log").await?, None);
        Ok(())
    }
}
