//! On-disk diff result cache.
//!
//! Entries are addressed by a digest over the tool name, both run ids, the
//! filter flags, and a per-tool epoch that is bumped when tool output
//! changes format. Reads are byte-stable: the same key always serves the
//! same bytes until invalidation (deleting the file).

use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct DiffCache {
    root: PathBuf,
}

/// Cache key for one (kind, inputs, flags) combination.
pub fn cache_key(
    tool: &str,
    tool_epoch: &str,
    old_id: &str,
    new_id: &str,
    filter_boring: bool,
) -> String {
    let mut hasher = Sha256::new();
    for part in [tool, tool_epoch, old_id, new_id] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([filter_boring as u8]);
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl DiffCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("Failed to read diff cache entry"),
        }
    }

    /// Store an entry. Writes go through a temp file and rename so readers
    /// never observe partial content.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context("Failed to create diff cache directory")?;
        let tmp = self.root.join(format!(".{key}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .context("Failed to write diff cache entry")?;
        tokio::fs::rename(&tmp, self.path(key))
            .await
            .context("Failed to finalize diff cache entry")?;
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path(key)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cache_key_is_input_sensitive() {
        let base = cache_key("debdiff", "1", "old", "new", false);
        assert_eq!(base, cache_key("debdiff", "1", "old", "new", false));
        assert_ne!(base, cache_key("debdiff", "1", "new", "old", false));
        assert_ne!(base, cache_key("debdiff", "1", "old", "new", true));
        assert_ne!(base, cache_key("diffoscope", "1", "old", "new", false));
        assert_ne!(base, cache_key("debdiff", "2", "old", "new", false));
        // Field boundaries matter: ("ab", "c") != ("a", "bc").
        assert_ne!(
            cache_key("debdiff", "1", "ab", "c", false),
            cache_key("debdiff", "1", "a", "bc", false)
        );
    }

    #[tokio::test]
    async fn test_put_get_round_trip() -> Result<()> {
        let tmp = TempDir::new()?;
        let cache = DiffCache::new(tmp.path().join("cache"));
        let key = cache_key("debdiff", "1", "a", "b", false);

        assert_eq!(cache.get(&key).await?, None);
        assert!(!cache.contains(&key).await);

        cache.put(&key, b"diff output").await?;
        assert_eq!(cache.get(&key).await?.as_deref(), Some(b"diff output".as_ref()));
        assert!(cache.contains(&key).await);

        // Overwrite is allowed and byte-stable afterwards.
        cache.put(&key, b"diff output").await?;
        assert_eq!(cache.get(&key).await?.as_deref(), Some(b"diff output".as_ref()));
        Ok(())
    }
}
