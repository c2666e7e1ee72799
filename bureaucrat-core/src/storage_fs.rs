use crate::storage::{Storage, StorageGuard};
use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// File-backed storage: bucket = directory, key = file.
///
/// The global lock is an advisory lock on a single lock file, so multiple
/// engine processes sharing a storage root serialize their read-modify-write
/// sequences against each other.
pub struct FsStorage {
    root: PathBuf,
    lock_path: PathBuf,
}

/// Holds the lock file open; dropping releases the advisory lock.
struct LockedFile(std::fs::File);

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("can't create storage root {}", root.display()))?;
        Ok(Self {
            root,
            lock_path: lock_path.into(),
        })
    }

    fn doc_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_component(bucket)?;
        validate_component(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

/// Bucket and key names become path components; reject anything that could
/// escape the storage root.
fn validate_component(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        bail!("invalid storage bucket/key name: {name:?}");
    }
    Ok(())
}

#[async_trait]
impl Storage for FsStorage {
    async fn lock(&self) -> Result<StorageGuard> {
        let lock_path = self.lock_path.clone();
        let locked = tokio::task::spawn_blocking(move || -> Result<LockedFile> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("can't open lock file {}", lock_path.display()))?;
            file.lock()
                .with_context(|| format!("can't lock {}", lock_path.display()))?;
            Ok(LockedFile(file))
        })
        .await??;
        Ok(StorageGuard::new(Box::new(locked)))
    }

    async fn save(&self, bucket: &str, key: &str, doc: &[u8]) -> Result<()> {
        let path = self.doc_path(bucket, key)?;
        let dir = path.parent().expect("doc path has a bucket directory");
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, doc)
            .await
            .with_context(|| format!("can't write {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.doc_path(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("can't read {}", path.display()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.doc_path(bucket, key)?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("can't delete {}", path.display()))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        validate_component(bucket)?;
        let dir = self.root.join(bucket);
        if !Path::new(&dir).is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                keys.push(name.to_string());
            }
        }
        Ok(keys)
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.doc_path(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
