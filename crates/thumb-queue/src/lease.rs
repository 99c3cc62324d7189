//! Per-parent leases that keep duplicate jobs off the same asset.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use thumb_models::ContentId;

use crate::error::QueueResult;
use crate::queue::{JobQueue, QueueConfig};

/// Deletes the key only while it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
pub trait ParentLease: Send + Sync {
    /// Returns `false` when another holder owns the lease.
    async fn try_acquire(&self, parent: &ContentId, holder: &str, ttl: Duration) -> QueueResult<bool>;

    /// Release a lease we hold. Releasing a lease held by someone else is a no-op.
    async fn release(&self, parent: &ContentId, holder: &str) -> QueueResult<()>;
}

fn lease_key(parent: &ContentId) -> String {
    format!("thumbnailer:lease:{}", parent)
}

/// `SET NX EX` lease with a compare-and-delete release.
pub struct RedisLease {
    queue: JobQueue,
    release: redis::Script,
}

impl RedisLease {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        Ok(Self {
            queue: JobQueue::new(config)?,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl ParentLease for RedisLease {
    async fn try_acquire(&self, parent: &ContentId, holder: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.queue.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(parent))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        debug!(parent_id = %parent, holder = %holder, acquired, "Lease acquire");
        Ok(acquired)
    }

    async fn release(&self, parent: &ContentId, holder: &str) -> QueueResult<()> {
        let mut conn = self.queue.connection().await?;
        let removed: i64 = self
            .release
            .key(lease_key(parent))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        debug!(parent_id = %parent, holder = %holder, removed, "Lease release");
        Ok(())
    }
}

/// Always grants; used when leasing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLease;

#[async_trait]
impl ParentLease for NoopLease {
    async fn try_acquire(&self, _parent: &ContentId, _holder: &str, _ttl: Duration) -> QueueResult<bool> {
        Ok(true)
    }

    async fn release(&self, _parent: &ContentId, _holder: &str) -> QueueResult<()> {
        Ok(())
    }
}

/// Process-local lease table with expiry.
#[derive(Debug, Default)]
pub struct MemoryLease {
    held: Mutex<HashMap<ContentId, (String, Instant)>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder_of(&self, parent: &ContentId) -> Option<String> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(parent)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone())
    }
}

#[async_trait]
impl ParentLease for MemoryLease {
    async fn try_acquire(&self, parent: &ContentId, holder: &str, ttl: Duration) -> QueueResult<bool> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match held.get(parent) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                held.insert(parent.clone(), (holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, parent: &ContentId, holder: &str) -> QueueResult<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(parent).is_some_and(|(owner, _)| owner == holder) {
            held.remove(parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lease_excludes_second_holder() {
        let lease = MemoryLease::new();
        let parent = ContentId::new();
        let ttl = Duration::from_secs(60);

        assert!(lease.try_acquire(&parent, "job-a", ttl).await.unwrap());
        assert!(!lease.try_acquire(&parent, "job-b", ttl).await.unwrap());

        // Foreign release does nothing.
        lease.release(&parent, "job-b").await.unwrap();
        assert_eq!(lease.holder_of(&parent).as_deref(), Some("job-a"));

        lease.release(&parent, "job-a").await.unwrap();
        assert!(lease.try_acquire(&parent, "job-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_lease_expires() {
        let lease = MemoryLease::new();
        let parent = ContentId::new();

        assert!(lease.try_acquire(&parent, "job-a", Duration::ZERO).await.unwrap());
        assert!(lease.holder_of(&parent).is_none());
        assert!(lease
            .try_acquire(&parent, "job-b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_noop_lease_always_grants() {
        let parent = ContentId::new();
        assert!(NoopLease
            .try_acquire(&parent, "a", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(NoopLease
            .try_acquire(&parent, "b", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
