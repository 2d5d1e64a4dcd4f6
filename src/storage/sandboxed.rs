//! Filesystem blob store confined to a base directory.
//!
//! Every key maps to a file below the base directory. Keys are validated
//! before they touch the filesystem: empty keys, null bytes, absolute paths
//! and any `.` / `..` components are rejected, so a key can never resolve
//! outside the sandbox.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::BlobStore;
use crate::errors::{PersistenceError, PersistenceResult};

const PARTIAL_SUFFIX: &str = ".partial";

/// Blob store writing one file per key
#[derive(Debug, Clone)]
pub struct SandboxedBlobStore {
    base_dir: PathBuf,
}

impl SandboxedBlobStore {
    /// Open the store, creating `base_dir` if needed
    pub async fn new<P: Into<PathBuf>>(base_dir: P) -> PersistenceResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        set_secure_permissions(&base_dir).await?;
        debug!("Sandboxed blob store opened at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn validate_and_get_path(&self, key: &str) -> PersistenceResult<PathBuf> {
        if key.is_empty() {
            return Err(PersistenceError::invalid_key(key, "key cannot be empty"));
        }
        if key.contains('\0') {
            return Err(PersistenceError::invalid_key(key, "key contains null bytes"));
        }

        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PersistenceError::invalid_key(key, "absolute keys not allowed"));
                }
                Component::CurDir | Component::ParentDir => {
                    return Err(PersistenceError::invalid_key(
                        key,
                        "relative path components not allowed",
                    ));
                }
            }
        }

        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl BlobStore for SandboxedBlobStore {
    async fn put(&self, key: &str, blob: Bytes) -> PersistenceResult<()> {
        let path = self.validate_and_get_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a torn blob
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        fs::write(&partial, &blob).await?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> PersistenceResult<Option<Bytes>> {
        let path = self.validate_and_get_path(key)?;
        match fs::read(&path).await {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> PersistenceResult<()> {
        let path = self.validate_and_get_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> PersistenceResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Restrict the base directory to the current user (Unix only)
async fn set_secure_permissions(path: &Path) -> PersistenceResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        fs::set_permissions(path, perms).await?;
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}
