use crate::snapshot::DeviceSnapshot;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Published snapshots a slow subscriber may fall behind by before it starts
/// losing the oldest ones.
const SUBSCRIBER_BACKLOG: usize = 16;

struct Published {
    snapshot: Arc<DeviceSnapshot>,
    stale: bool,
}

struct Shared {
    current: ArcSwap<Published>,
    updates: broadcast::Sender<Arc<DeviceSnapshot>>,
}

/// What a reader sees: the latest snapshot plus whether the last poll failed.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub snapshot: Arc<DeviceSnapshot>,
    pub stale: bool,
}

impl CachedSnapshot {
    pub fn sequence(&self) -> u64 {
        self.snapshot.sequence()
    }
}

/// Read side of the cache. Cheap to clone, one per server task.
#[derive(Clone)]
pub struct SnapshotCache {
    shared: Arc<Shared>,
}

/// Write side of the cache. There is exactly one, owned by the poll loop.
pub struct SnapshotPublisher {
    shared: Arc<Shared>,
}

impl SnapshotCache {
    /// Starts out with an idle, stale placeholder at sequence 0.
    pub fn new() -> (Self, SnapshotPublisher) {
        let (updates, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        let shared = Arc::new(Shared {
            current: ArcSwap::from_pointee(Published {
                snapshot: Arc::new(DeviceSnapshot::empty()),
                stale: true,
            }),
            updates,
        });
        (
            Self {
                shared: shared.clone(),
            },
            SnapshotPublisher { shared },
        )
    }

    pub fn current(&self) -> CachedSnapshot {
        let published = self.shared.current.load();
        CachedSnapshot {
            snapshot: published.snapshot.clone(),
            stale: published.stale,
        }
    }

    /// Receives every snapshot published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DeviceSnapshot>> {
        self.shared.updates.subscribe()
    }
}

impl SnapshotPublisher {
    /// Swaps in `snapshot` with the next sequence number and clears the
    /// stale flag. Returns the published snapshot.
    pub fn publish(&mut self, snapshot: DeviceSnapshot) -> Arc<DeviceSnapshot> {
        let sequence = self.shared.current.load().snapshot.sequence() + 1;
        let snapshot = Arc::new(snapshot.with_sequence(sequence));
        self.shared.current.store(Arc::new(Published {
            snapshot: snapshot.clone(),
            stale: false,
        }));
        // No subscribers is fine
        let _ = self.shared.updates.send(snapshot.clone());
        snapshot
    }

    /// Keeps the current snapshot readable but flags it as out of date.
    pub fn mark_stale(&mut self) {
        let current = self.shared.current.load();
        if current.stale {
            return;
        }
        let snapshot = current.snapshot.clone();
        self.shared
            .current
            .store(Arc::new(Published { snapshot, stale: true }));
    }

    pub fn last_published(&self) -> Arc<DeviceSnapshot> {
        self.shared.current.load().snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{EnergyTotals, PhaseReading};
    use chrono::Utc;

    fn reading(active_power: f64) -> DeviceSnapshot {
        let phase = PhaseReading {
            active_power,
            apparent_power: active_power.abs(),
            ..PhaseReading::idle()
        };
        DeviceSnapshot::single_phase(phase, EnergyTotals::default(), Utc::now())
    }

    #[test]
    fn test_initial_snapshot_is_stale() {
        let (cache, _publisher) = SnapshotCache::new();
        let current = cache.current();
        assert!(current.stale);
        assert_eq!(current.sequence(), 0);
    }

    #[test]
    fn test_sequence_increases_with_every_publish() {
        let (cache, mut publisher) = SnapshotCache::new();
        let mut last = cache.current().sequence();
        for i in 0..10 {
            publisher.publish(reading(i as f64));
            let current = cache.current();
            assert!(current.sequence() > last);
            assert!(!current.stale);
            assert_eq!(current.snapshot.total_active_power(), i as f64);
            last = current.sequence();
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn test_stale_keeps_previous_values() {
        let (cache, mut publisher) = SnapshotCache::new();
        publisher.publish(reading(420.0));
        publisher.mark_stale();

        let current = cache.current();
        assert!(current.stale);
        assert_eq!(current.sequence(), 1);
        assert_eq!(current.snapshot.total_active_power(), 420.0);

        publisher.publish(reading(10.0));
        assert!(!cache.current().stale);
        assert_eq!(cache.current().sequence(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_only_see_later_publishes() {
        let (cache, mut publisher) = SnapshotCache::new();
        publisher.publish(reading(1.0));

        let mut first = cache.subscribe();
        let mut second = cache.subscribe();
        publisher.publish(reading(2.0));

        assert_eq!(first.recv().await.unwrap().sequence(), 2);
        assert_eq!(second.recv().await.unwrap().sequence(), 2);
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let (cache, mut publisher) = SnapshotCache::new();
        let mut slow = cache.subscribe();
        for i in 0..(SUBSCRIBER_BACKLOG * 2) {
            publisher.publish(reading(i as f64));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let next = slow.recv().await.unwrap();
        assert!(next.sequence() > 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_whole_snapshots() {
        let (cache, mut publisher) = SnapshotCache::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let mut last = 0;
                    for _ in 0..500 {
                        let current = cache.current();
                        let snapshot = &current.snapshot;
                        assert!(snapshot.sequence() >= last);
                        assert_eq!(
                            snapshot.total_active_power(),
                            snapshot.phases().iter().map(|p| p.active_power).sum::<f64>()
                        );
                        last = snapshot.sequence();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for i in 0..500 {
            publisher.publish(reading(i as f64));
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
