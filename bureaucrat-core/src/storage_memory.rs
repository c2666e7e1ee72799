use crate::storage::{Storage, StorageGuard};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// In-memory implementation of `Storage` for tests.
pub struct MemoryStorage {
    docs: RwLock<HashMap<(String, String), Vec<u8>>>,
    lock: Arc<Mutex<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn lock(&self) -> Result<StorageGuard> {
        let guard = self.lock.clone().lock_owned().await;
        Ok(StorageGuard::new(Box::new(guard)))
    }

    async fn save(&self, bucket: &str, key: &str, doc: &[u8]) -> Result<()> {
        let mut w = self.docs.write().await;
        w.insert((bucket.to_string(), key.to_string()), doc.to_vec());
        Ok(())
    }

    async fn load(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let r = self.docs.read().await;
        r.get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no such document: {bucket}/{key}"))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut w = self.docs.write().await;
        w.remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| anyhow!("no such document: {bucket}/{key}"))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        let r = self.docs.read().await;
        Ok(r.keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let r = self.docs.read().await;
        Ok(r.contains_key(&(bucket.to_string(), key.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let storage = MemoryStorage::new();
        storage.save("definition", "pid", b"<process/>").await.unwrap();
        assert_eq!(
            storage.load("definition", "pid").await.unwrap(),
            b"<process/>"
        );
        assert_eq!(storage.keys("definition").await.unwrap(), vec!["pid"]);
        storage.delete("definition", "pid").await.unwrap();
        assert!(!storage.exists("definition", "pid").await.unwrap());
        assert!(storage.delete("definition", "pid").await.is_err());
    }
}
