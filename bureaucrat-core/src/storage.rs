use anyhow::Result;
use async_trait::async_trait;

/// Guard for the global storage lock. Held across read-modify-write
/// sequences; the lock is released on drop.
pub struct StorageGuard {
    _held: Box<dyn Send + 'static>,
}

impl StorageGuard {
    pub fn new(held: Box<dyn Send + 'static>) -> Self {
        Self { _held: held }
    }
}

/// Persistence trait for all engine state: a bucket/key byte store with a
/// single global lock.
///
/// Buckets in use: `definition` (raw XML per pid), `process` (JSON snapshot
/// per pid), `schedule` (JSON timer lists per epoch second),
/// `subscriptions` (JSON target lists per event name). The engine, workflow,
/// schedule and subscription services operate exclusively through this
/// trait, enabling pluggable backends (memory for tests, filesystem for the
/// daemon).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Acquire the global lock. Every code path that reads and then writes
    /// the same bucket must hold the guard across the whole sequence.
    async fn lock(&self) -> Result<StorageGuard>;

    async fn save(&self, bucket: &str, key: &str, doc: &[u8]) -> Result<()>;

    /// Load a document; a missing key is an error.
    async fn load(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// All keys currently present in a bucket (any order). A bucket that
    /// was never written to is empty, not an error.
    async fn keys(&self, bucket: &str) -> Result<Vec<String>>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

// ─── Bucket names ─────────────────────────────────────────────

pub const BUCKET_DEFINITION: &str = "definition";
pub const BUCKET_PROCESS: &str = "process";
pub const BUCKET_SCHEDULE: &str = "schedule";
pub const BUCKET_SUBSCRIPTIONS: &str = "subscriptions";
