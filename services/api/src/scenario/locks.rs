//! services/api/src/scenario/locks.rs
//!
//! Per-interview async locks serialising the read-modify-write cycles that
//! end, abandon or pause an interview.

use interview_core::domain::InterviewId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type InterviewGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct InterviewLocks {
    locks: Mutex<HashMap<InterviewId, Arc<AsyncMutex<()>>>>,
}

impl InterviewLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InterviewId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for exclusive access to `interview_id`. The guard can be moved
    /// into a spawned task.
    pub async fn acquire(&self, interview_id: InterviewId) -> InterviewGuard {
        let lock = {
            let mut locks = self.lock();
            // Entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(interview_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn same_interview_waits_other_interviews_do_not() {
        let locks = Arc::new(InterviewLocks::new());
        let held = locks.acquire(1).await;

        let _other = tokio::time::timeout(Duration::from_secs(1), locks.acquire(2))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), locks.acquire(1)).await.is_err());

        drop(held);
        let _again = locks.acquire(1).await;
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = InterviewLocks::new();
        drop(locks.acquire(1).await);
        drop(locks.acquire(2).await);
        // Acquiring prunes every idle entry before adding its own.
        assert_eq!(locks.len(), 1);
    }
}
