use crate::ring_buffer::RingBuffer;
use crate::telemetry_decode::{CanFrame, MotionFrame, StateFrame, TelemetryFrame};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Latest value of one telemetry type together with when it was received
/// locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading<T> {
    pub frame: T,
    pub received_at_ms: u64,
    /// True once nothing newer has been received for `stale_after`.
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    frame: T,
    timestamp_ms: u64,
    received_at_ms: u64,
}

struct StoreInner {
    can: Option<Slot<CanFrame>>,
    motion: Option<Slot<MotionFrame>>,
    state: Option<Slot<StateFrame>>,
    history: RingBuffer<TelemetryFrame>,
}

/// Latest-by-type telemetry plus a bounded, timestamp-ordered history.
///
/// A latest slot is only replaced by a frame with a strictly newer pod
/// timestamp, so reordered or duplicated datagrams never move it backwards.
pub struct TelemetryStore {
    inner: RwLock<StoreInner>,
    stale_after: Duration,
}

/// Replaces `slot` when `frame` is strictly newer. Returns whether it did.
fn upsert<T>(slot: &mut Option<Slot<T>>, frame: T, timestamp_ms: u64, received_at_ms: u64) -> bool {
    let newer = slot.as_ref().is_none_or(|cur| timestamp_ms > cur.timestamp_ms);
    if newer {
        *slot = Some(Slot {
            frame,
            timestamp_ms,
            received_at_ms,
        });
    }
    newer
}

impl TelemetryStore {
    pub fn new(history_capacity: usize, stale_after: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                can: None,
                motion: None,
                state: None,
                history: RingBuffer::new(history_capacity),
            }),
            stale_after,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a decoded frame. Returns true if it became the latest of its type.
    pub fn record(&self, frame: TelemetryFrame, received_at_ms: u64) -> bool {
        let ts = frame.timestamp_ms();
        let mut inner = self.write();
        let replaced = match &frame {
            TelemetryFrame::Can(f) => upsert(&mut inner.can, *f, ts, received_at_ms),
            TelemetryFrame::Motion(f) => upsert(&mut inner.motion, *f, ts, received_at_ms),
            TelemetryFrame::State(f) => upsert(&mut inner.state, f.clone(), ts, received_at_ms),
        };
        inner
            .history
            .insert_by_key(frame, TelemetryFrame::timestamp_ms);
        replaced
    }

    fn reading<T: Clone>(&self, slot: &Option<Slot<T>>, now_ms: u64) -> Option<Reading<T>> {
        slot.as_ref().map(|s| Reading {
            frame: s.frame.clone(),
            received_at_ms: s.received_at_ms,
            stale: now_ms.saturating_sub(s.received_at_ms) > self.stale_after.as_millis() as u64,
        })
    }

    pub fn latest_state(&self, now_ms: u64) -> Option<Reading<StateFrame>> {
        let inner = self.read();
        self.reading(&inner.state, now_ms)
    }

    pub fn latest_battery(&self, now_ms: u64) -> Option<Reading<CanFrame>> {
        let inner = self.read();
        self.reading(&inner.can, now_ms)
    }

    pub fn latest_position(&self, now_ms: u64) -> Option<Reading<MotionFrame>> {
        let inner = self.read();
        self.reading(&inner.motion, now_ms)
    }

    /// Copy of the history, oldest first. The lock is held only for the copy.
    pub fn history_snapshot(&self) -> Vec<TelemetryFrame> {
        self.read().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basestation_shared::ErrorFlags;
    use std::sync::Arc;

    fn store() -> TelemetryStore {
        TelemetryStore::new(100, Duration::from_millis(2_000))
    }

    fn motion(ts: u64, position: f32) -> TelemetryFrame {
        TelemetryFrame::Motion(MotionFrame {
            timestamp_ms: ts,
            position,
            velocity: 0.0,
            acceleration: 0.0,
        })
    }

    fn state(ts: u64, name: &str) -> TelemetryFrame {
        TelemetryFrame::State(StateFrame {
            timestamp_ms: ts,
            state: Arc::from(name),
            error_flags: ErrorFlags::default(),
        })
    }

    #[test]
    fn no_data_yet() {
        let store = store();
        assert!(store.latest_state(0).is_none());
        assert!(store.latest_battery(0).is_none());
        assert!(store.latest_position(0).is_none());
    }

    #[test]
    fn newer_timestamp_wins_despite_arriving_first() {
        let store = store();
        assert!(store.record(motion(10, 5.0), 100));
        assert!(!store.record(motion(8, 3.0), 101));
        let latest = store.latest_position(101).unwrap();
        assert_eq!(latest.frame.position, 5.0);
        assert_eq!(latest.frame.timestamp_ms, 10);
    }

    #[test]
    fn latest_is_order_independent() {
        for order in [[1u64, 2], [2, 1]] {
            let store = store();
            for ts in order {
                store.record(state(ts, if ts == 2 { "LOADING" } else { "SAFE_MODE" }), 0);
            }
            assert_eq!(&*store.latest_state(0).unwrap().frame.state, "LOADING");
        }
    }

    #[test]
    fn duplicates_do_not_replace() {
        let store = store();
        store.record(motion(10, 5.0), 100);
        assert!(!store.record(motion(10, 9.0), 200));
        let latest = store.latest_position(200).unwrap();
        assert_eq!(latest.frame.position, 5.0);
        assert_eq!(latest.received_at_ms, 100);
        assert_eq!(store.history_snapshot().len(), 2);
    }

    #[test]
    fn types_are_tracked_independently() {
        let store = store();
        store.record(motion(50, 1.0), 0);
        store.record(state(10, "SAFE_MODE"), 0);
        assert!(store.latest_state(0).is_some());
        assert!(store.latest_battery(0).is_none());
    }

    #[test]
    fn history_is_timestamp_ordered() {
        let store = store();
        for ts in [5u64, 1, 3] {
            store.record(motion(ts, ts as f32), 0);
        }
        let ts: Vec<u64> = store
            .history_snapshot()
            .iter()
            .map(TelemetryFrame::timestamp_ms)
            .collect();
        assert_eq!(ts, vec![1, 3, 5]);
    }

    #[test]
    fn readings_go_stale() {
        let store = store();
        store.record(motion(1, 1.0), 1_000);
        assert!(!store.latest_position(3_000).unwrap().stale);
        assert!(store.latest_position(3_001).unwrap().stale);
    }

    #[test]
    fn history_is_bounded() {
        let store = TelemetryStore::new(3, Duration::from_secs(1));
        for ts in 0..10u64 {
            store.record(motion(ts, 0.0), 0);
        }
        assert_eq!(store.history_snapshot().len(), 3);
        assert_eq!(store.history_snapshot()[0].timestamp_ms(), 7);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let store = Arc::new(store());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for ts in 1..=500u64 {
                    store.record(motion(ts, ts as f32), ts);
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut last = 0u64;
                    for _ in 0..500 {
                        if let Some(r) = store.latest_position(0) {
                            assert!(r.frame.timestamp_ms >= last);
                            last = r.frame.timestamp_ms;
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.latest_position(0).unwrap().frame.timestamp_ms, 500);
    }
}
