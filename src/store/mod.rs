//! Content store (C1): raw Wasm blobs on disk, keyed by short digest.
//!
//! Blobs live at `<root>/<namespace>/<name>/<short_digest>.wasm`. Writes are
//! atomic: the payload lands in a temp file in the same directory, then is
//! renamed into place, so a reader never observes a partially written blob.
//! The store never validates digests itself — that is the registry's job.

pub mod metadata;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::digest::ShortDigest;

#[cfg(unix)]
const BLOB_MODE: u32 = 0o644;
#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Content-addressed blob store rooted at a single directory.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, namespace: &str, name: &str, short: &ShortDigest) -> PathBuf {
        self.root
            .join(namespace)
            .join(name)
            .join(format!("{short}.wasm"))
    }

    /// Write a blob, creating parent directories as needed. Atomic via
    /// write-to-temp + rename in the same directory.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn write(
        &self,
        namespace: &str,
        name: &str,
        short: &ShortDigest,
        payload: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.root.join(namespace).join(name);
        create_dir(&dir).await?;

        let final_path = dir.join(format!("{short}.wasm"));
        let tmp_path = dir.join(format!(".{short}.wasm.tmp"));

        fs::write(&tmp_path, payload)
            .await
            .with_context(|| format!("error writing temp blob at {tmp_path:?}"))?;
        set_blob_permissions(&tmp_path).await?;

        fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("error renaming {tmp_path:?} into {final_path:?}"))?;

        Ok(final_path)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn read(
        &self,
        namespace: &str,
        name: &str,
        short: &ShortDigest,
    ) -> Result<Vec<u8>> {
        let path = self.blob_path(namespace, name, short);
        fs::read(&path)
            .await
            .with_context(|| format!("error reading blob at {path:?}"))
    }

    pub async fn exists(&self, namespace: &str, name: &str, short: &ShortDigest) -> bool {
        fs::metadata(self.blob_path(namespace, name, short))
            .await
            .is_ok()
    }
}

#[cfg(unix)]
async fn create_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("error creating blob directory {dir:?}"))?;
    let perms = std::fs::Permissions::from_mode(DIR_MODE);
    fs::set_permissions(dir, perms)
        .await
        .with_context(|| format!("error setting permissions on {dir:?}"))?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("error creating blob directory {dir:?}"))
}

#[cfg(unix)]
async fn set_blob_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(BLOB_MODE);
    fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("error setting permissions on {path:?}"))
}

#[cfg(not(unix))]
async fn set_blob_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let short = ShortDigest::parse(&"a".repeat(16)).unwrap();

        store
            .write("default", "hello", &short, b"wasm-bytes")
            .await
            .unwrap();

        let bytes = store.read("default", "hello", &short).await.unwrap();
        assert_eq!(bytes, b"wasm-bytes");
        assert!(store.exists("default", "hello", &short).await);
    }

    #[tokio::test]
    async fn blob_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let short = ShortDigest::parse(&"b".repeat(16)).unwrap();
        let expected = dir.path().join("ns").join("fn").join(format!("{short}.wasm"));
        assert_eq!(store.blob_path("ns", "fn", &short), expected);
    }

    #[tokio::test]
    async fn missing_blob_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let short = ShortDigest::parse(&"c".repeat(16)).unwrap();
        assert!(store.read("ns", "fn", &short).await.is_err());
        assert!(!store.exists("ns", "fn", &short).await);
    }
}
