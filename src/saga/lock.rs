//! Bucketed exclusive-access lock
//!
//! A keyed lock striped over a fixed number of buckets. Lock ids hash to
//! `|hash| mod bucket_count`; callers acquire buckets in ascending order,
//! which makes the scheme deadlock-free across workers.

use crate::domain_types::LockBucketCount;
use std::hash::{Hash, Hasher};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Fixed array of binary semaphores indexed by bucket
pub struct BucketLock {
    buckets: Vec<Semaphore>,
}

impl BucketLock {
    /// Creates a lock striped over the given number of buckets
    pub fn new(count: LockBucketCount) -> Self {
        let buckets = (0..count.as_usize()).map(|_| Semaphore::new(1)).collect();
        Self { buckets }
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Maps a lock id onto its bucket index
    pub fn bucket_for(&self, lock_id: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        lock_id.hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    /// Blocking cooperative acquire. Returns `false` only when the
    /// cancellation token fires while waiting.
    pub async fn acquire(&self, bucket: usize, cancel: &CancellationToken) -> bool {
        let semaphore = &self.buckets[bucket % self.buckets.len()];
        tokio::select! {
            permit = semaphore.acquire() => {
                permit.expect("lock semaphore never closes").forget();
                true
            }
            _ = cancel.cancelled() => false,
        }
    }

    /// Releases a bucket acquired earlier
    pub fn release(&self, bucket: usize) {
        self.buckets[bucket % self.buckets.len()].add_permits(1);
    }
}

impl std::fmt::Debug for BucketLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketLock")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn lock(buckets: usize) -> BucketLock {
        BucketLock::new(LockBucketCount::try_new(buckets).unwrap())
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let lock = Arc::new(lock(4));
        let cancel = CancellationToken::new();

        assert!(lock.acquire(1, &cancel).await);

        let contender = {
            let lock = Arc::clone(&lock);
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(1, &cancel).await })
        };

        // The contender cannot finish while the bucket is held
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        lock.release(1);
        assert!(contender.await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_returns_false() {
        let lock = lock(4);
        let cancel = CancellationToken::new();

        assert!(lock.acquire(2, &cancel).await);
        cancel.cancel();
        assert!(!lock.acquire(2, &cancel).await);
    }

    #[tokio::test]
    async fn distinct_buckets_do_not_contend() {
        let lock = lock(4);
        let cancel = CancellationToken::new();

        assert!(lock.acquire(0, &cancel).await);
        assert!(lock.acquire(1, &cancel).await);
        lock.release(0);
        lock.release(1);
    }

    #[test]
    fn bucket_mapping_is_stable_and_in_range() {
        let lock = lock(8);
        let a = lock.bucket_for("Data:order_id:o-1");
        let b = lock.bucket_for("Data:order_id:o-1");
        assert_eq!(a, b);
        assert!(a < 8);
    }
}
