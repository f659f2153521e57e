//! Throttled maintenance sweeps run ahead of each claim.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::metrics::SweepMetrics;
use crate::store::MessageStore;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired records deleted, `None` if the sweep was throttled or failed
    pub expired: Option<u64>,
    /// Timed-out leases released, `None` if the sweep was throttled or failed
    pub reclaimed: Option<u64>,
}

/// "Last executed" timestamp of one sweep.
#[derive(Debug)]
struct SweepThrottle {
    interval: chrono::Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl SweepThrottle {
    fn new(interval: chrono::Duration) -> Self {
        Self {
            interval,
            last_run: Mutex::new(None),
        }
    }

    /// Mark the sweep as run at `now` if the window since the last run has
    /// elapsed. Returns whether the caller should run it.
    async fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut last_run = self.last_run.lock().await;
        let due = match *last_run {
            Some(last) => now - last >= self.interval,
            None => true,
        };
        if due {
            *last_run = Some(now);
        }
        due
    }
}

/// Runs the expire and reclaim sweeps, each at most once per interval.
///
/// A failing sweep is logged and reported as not run; it never fails the
/// caller.
#[derive(Debug)]
pub struct MaintenanceScheduler {
    expire: SweepThrottle,
    reclaim: SweepThrottle,
}

impl MaintenanceScheduler {
    pub fn new(interval: Duration) -> Self {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(1));
        Self {
            expire: SweepThrottle::new(interval),
            reclaim: SweepThrottle::new(interval),
        }
    }

    /// Run whichever sweeps are due at `now`.
    pub async fn run(&self, store: &dyn MessageStore, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if self.expire.try_acquire(now).await {
            match store.sweep_expired(now).await {
                Ok(removed) => {
                    if removed > 0 {
                        tracing::debug!(backend = store.backend(), removed, "Expired records swept");
                    }
                    SweepMetrics::record_expired(store.backend(), removed);
                    report.expired = Some(removed);
                }
                Err(e) => {
                    tracing::warn!(backend = store.backend(), error = %e, "Expire sweep failed");
                    SweepMetrics::record_error(store.backend(), "expire");
                }
            }
        }

        if self.reclaim.try_acquire(now).await {
            match store.sweep_orphan_leases(now).await {
                Ok(released) => {
                    if released > 0 {
                        tracing::debug!(backend = store.backend(), released, "Timed-out leases released");
                    }
                    SweepMetrics::record_reclaimed(store.backend(), released);
                    report.reclaimed = Some(released);
                }
                Err(e) => {
                    tracing::warn!(backend = store.backend(), error = %e, "Lease reclaim sweep failed");
                    SweepMetrics::record_error(store.backend(), "reclaim");
                }
            }
        }

        report
    }

    /// Run both sweeps now, ignoring the throttle.
    pub async fn force(&self, store: &dyn MessageStore, now: DateTime<Utc>) -> SweepReport {
        *self.expire.last_run.lock().await = None;
        *self.reclaim.last_run.lock().await = None;
        self.run(store, now).await
    }
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodedMessage, Headers};
    use crate::store::{Lease, MemoryStore, MessageRecord};

    fn expired_record(now: DateTime<Utc>) -> MessageRecord {
        let mut record = MessageRecord::new(
            EncodedMessage {
                body: b"{}".to_vec(),
                headers: Headers::new(),
            },
            now,
        );
        record.time_to_live = Some(now - chrono::Duration::seconds(1));
        record
    }

    #[tokio::test]
    async fn test_first_run_is_not_throttled() {
        let scheduler = MaintenanceScheduler::default();
        let store = MemoryStore::default();
        let now = Utc::now();
        store.insert(&expired_record(now)).await.unwrap();

        let report = scheduler.run(&store, now).await;
        assert_eq!(report.expired, Some(1));
        assert_eq!(report.reclaimed, Some(0));
    }

    #[tokio::test]
    async fn test_throttled_within_window() {
        let scheduler = MaintenanceScheduler::default();
        let store = MemoryStore::default();
        let now = Utc::now();

        scheduler.run(&store, now).await;
        store.insert(&expired_record(now)).await.unwrap();

        let throttled = scheduler.run(&store, now + chrono::Duration::milliseconds(999)).await;
        assert_eq!(throttled, SweepReport::default());
        assert_eq!(store.count().await.unwrap(), 1);

        let due = scheduler.run(&store, now + chrono::Duration::seconds(1)).await;
        assert_eq!(due.expired, Some(1));
    }

    #[tokio::test]
    async fn test_reclaims_timed_out_lease() {
        let scheduler = MaintenanceScheduler::default();
        let store = MemoryStore::default();
        let now = Utc::now();
        store
            .insert(&MessageRecord::new(
                EncodedMessage {
                    body: b"{}".to_vec(),
                    headers: Headers::new(),
                },
                now,
            ))
            .await
            .unwrap();
        store
            .claim_next(&Lease::new(now, chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let report = scheduler.run(&store, now + chrono::Duration::seconds(6)).await;
        assert_eq!(report.reclaimed, Some(1));
    }

    #[tokio::test]
    async fn test_force_ignores_throttle() {
        let scheduler = MaintenanceScheduler::default();
        let store = MemoryStore::default();
        let now = Utc::now();

        scheduler.run(&store, now).await;
        store.insert(&expired_record(now)).await.unwrap();

        let report = scheduler.force(&store, now).await;
        assert_eq!(report.expired, Some(1));
    }
}
