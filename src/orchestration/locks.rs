//! Per-member exclusive locks.

use crate::domain::MemberId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<MemberId, Arc<Mutex<()>>>;

/// Lock table keyed by member id.
///
/// Entries are created on first use and removed when the last holder or waiter lets go,
/// so the table only ever holds members with a settlement in flight.
#[derive(Debug, Clone, Default)]
pub struct MemberLocks {
    inner: Arc<LockTable>,
}

/// Exclusive access to one member. Dropping it releases the lock and prunes the entry.
#[derive(Debug)]
pub struct MemberGuard {
    table: Arc<LockTable>,
    member: MemberId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for MemberGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are only taken under the shard lock, so a count of one means no waiters.
        self.table
            .remove_if(&self.member, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl MemberLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, member: &MemberId) -> Arc<Mutex<()>> {
        // The shard guard must be gone before awaiting.
        self.inner.entry(member.clone()).or_default().clone()
    }

    fn guard(&self, member: &MemberId, guard: OwnedMutexGuard<()>) -> MemberGuard {
        MemberGuard {
            table: self.inner.clone(),
            member: member.clone(),
            guard: Some(guard),
        }
    }

    /// Wait for exclusive access to `member`. Released when the guard drops.
    pub async fn lock(&self, member: &MemberId) -> MemberGuard {
        let guard = self.mutex_for(member).lock_owned().await;
        self.guard(member, guard)
    }

    /// Non-blocking variant; None if someone else holds the lock.
    pub fn try_lock(&self, member: &MemberId) -> Option<MemberGuard> {
        let guard = self.mutex_for(member).try_lock_owned().ok()?;
        Some(self.guard(member, guard))
    }

    /// Members currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive_per_member() {
        let locks = MemberLocks::new();
        let a = MemberId::new("a");

        let guard = locks.lock(&a).await;
        assert!(locks.try_lock(&a).is_none());
        assert!(locks.try_lock(&MemberId::new("b")).is_some());

        drop(guard);
        assert!(locks.try_lock(&a).is_some());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = MemberLocks::new();
        for i in 0..100 {
            let _guard = locks.lock(&MemberId::new(format!("m{}", i))).await;
        }
        assert!(locks.is_empty());

        let held = locks.lock(&MemberId::new("a")).await;
        assert!(locks.try_lock(&MemberId::new("a")).is_none());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_survives_while_a_waiter_is_queued() {
        let locks = MemberLocks::new();
        let a = MemberId::new("a");
        let held = locks.lock(&a).await;

        let waiter = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&a).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        // Handed to the queued waiter, not pruned and replaced by a fresh mutex.
        assert_eq!(locks.len(), 1);
        assert!(locks.try_lock(&a).is_none());
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_the_table() {
        let locks = MemberLocks::new();
        let other = locks.clone();
        let _guard = locks.lock(&MemberId::new("a")).await;
        assert!(other.try_lock(&MemberId::new("a")).is_none());
    }
}
