use super::Journal;
use crate::error::JournalError;
use std::future::Future;
use tracing::{debug, warn};

impl Journal {
    /// Non-blocking, session-scoped lock on this process. Returns `false`
    /// when another session holds it.
    pub async fn try_acquire_exclusive_lock(&self) -> Result<bool, JournalError> {
        let key = self.process().lock_key();
        let acquired = self.store().try_advisory_lock(&key).await?;
        if acquired {
            self.set_lock_held(true);
        }
        debug!(key = %key, acquired, "Exclusive lock attempt");
        Ok(acquired)
    }

    pub async fn release(&self) -> Result<bool, JournalError> {
        let key = self.process().lock_key();
        let released = self.store().advisory_unlock(&key).await?;
        self.set_lock_held(false);
        if !released {
            warn!(key = %key, "Released a lock this session did not hold");
        }
        Ok(released)
    }

    /// Runs `f` while holding the process lock. `Ok(None)` means the lock was
    /// held elsewhere and `f` never ran. The lock is released whatever `f`
    /// returns.
    pub async fn with_exclusive_lock<T, E, F, Fut>(&self, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<JournalError>,
    {
        if !self.try_acquire_exclusive_lock().await? {
            return Ok(None);
        }

        let result = f().await;
        let released = self.release().await;

        match (result, released) {
            (Ok(value), Ok(_)) => Ok(Some(value)),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(unlock)) => {
                warn!(process = %self.process(), error = %unlock, "Unlock failed after error");
                Err(err)
            }
            (Ok(_), Err(unlock)) => Err(unlock.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        clock::ManualClock,
        error::JournalError,
        journal::{Journal, JournalConfig},
        state::memory::MemoryJournalStore,
    };
    use chrono::Utc;
    use std::sync::Arc;

    fn journal(store: &MemoryJournalStore) -> Journal {
        Journal::new(
            Arc::new(store.connect_peer()),
            Arc::new(ManualClock::new(Utc::now())),
            JournalConfig::new("orders"),
        )
    }

    #[tokio::test]
    async fn second_instance_is_locked_out() {
        let store = MemoryJournalStore::new();
        let (a, b) = (journal(&store), journal(&store));

        assert!(a.try_acquire_exclusive_lock().await.unwrap());
        assert!(!b.try_acquire_exclusive_lock().await.unwrap());
        assert!(a.holds_lock());
        assert!(!b.holds_lock());
        // derived journals run under their parent's lock
        assert!(a.derive("dedup").holds_lock());
        assert!(a.release().await.unwrap());
        assert!(!a.holds_lock());
        assert!(b.try_acquire_exclusive_lock().await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_after_failure() {
        let store = MemoryJournalStore::new();
        let (a, b) = (journal(&store), journal(&store));

        let window =
            model::window::TimeWindow::new(Utc::now() - chrono::TimeDelta::minutes(1), Utc::now())
                .unwrap();
        let failed = a
            .with_exclusive_lock(|| async move {
                Err::<(), _>(JournalError::LostRace {
                    process: "orders".into(),
                    window,
                })
            })
            .await;
        assert!(failed.is_err());

        let ran = b
            .with_exclusive_lock(|| async { Ok::<_, JournalError>(7) })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));
    }

    #[tokio::test]
    async fn with_lock_skips_when_held() {
        let store = MemoryJournalStore::new();
        let (a, b) = (journal(&store), journal(&store));
        assert!(a.try_acquire_exclusive_lock().await.unwrap());

        let mut ran = false;
        let result = b
            .with_exclusive_lock(|| {
                ran = true;
                async { Ok::<_, JournalError>(()) }
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(!ran);
    }
}
