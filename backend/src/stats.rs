use crate::telemetry_decode::TelemetryFrame;
use crate::telemetry_store::TelemetryStore;
use basestation_shared::{PodState, SeriesStats, TelemetryStats};

/// Running min/max/mean accumulator for one channel.
#[derive(Default)]
struct Series {
    count: u32,
    sum: f64,
    min: f32,
    max: f32,
    last: f32,
}

impl Series {
    fn push(&mut self, v: f32) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.sum += f64::from(v);
        self.last = v;
    }

    fn finish(&self) -> Option<SeriesStats> {
        (self.count > 0).then(|| SeriesStats {
            min: self.min,
            max: self.max,
            mean: (self.sum / f64::from(self.count)) as f32,
            last: self.last,
        })
    }
}

fn max_opt(cur: Option<f32>, v: f32) -> Option<f32> {
    Some(cur.map_or(v, |c| c.max(v)))
}

/// Derives summary statistics from telemetry history.
///
/// Works on a snapshot so the fold never runs under the store lock.
pub struct StatsAggregator;

impl StatsAggregator {
    pub fn from_store(store: &TelemetryStore) -> TelemetryStats {
        let snapshot = store.history_snapshot();
        Self::compute(&snapshot)
    }

    /// `history` must be ordered by timestamp, as the store keeps it.
    pub fn compute(history: &[TelemetryFrame]) -> TelemetryStats {
        let mut stats = TelemetryStats {
            frame_count: history.len(),
            first_timestamp_ms: history.first().map(TelemetryFrame::timestamp_ms),
            last_timestamp_ms: history.last().map(TelemetryFrame::timestamp_ms),
            ..Default::default()
        };
        if let (Some(first), Some(last)) = (stats.first_timestamp_ms, stats.last_timestamp_ms) {
            stats.elapsed_ms = last.saturating_sub(first);
        }

        let mut soc = Series::default();
        // (state name, parsed state, since)
        let mut current: Option<(&str, Option<PodState>, u64)> = None;

        for frame in history {
            match frame {
                TelemetryFrame::Can(f) => {
                    stats.can_frames += 1;
                    soc.push(f.pack_soc);
                }
                TelemetryFrame::Motion(f) => {
                    stats.motion_frames += 1;
                    stats.max_position = max_opt(stats.max_position, f.position);
                    stats.peak_velocity = max_opt(stats.peak_velocity, f.velocity.abs());
                    stats.peak_acceleration =
                        max_opt(stats.peak_acceleration, f.acceleration.abs());
                }
                TelemetryFrame::State(f) => {
                    stats.state_frames += 1;
                    match current {
                        Some((name, _, _)) if name == &*f.state => {}
                        Some((_, parsed, since)) => {
                            stats.state_changes += 1;
                            if parsed.is_some_and(PodState::is_flight) {
                                stats.run_time_ms += f.timestamp_ms.saturating_sub(since);
                            }
                            current = Some((&*f.state, PodState::parse(&f.state), f.timestamp_ms));
                        }
                        None => {
                            current = Some((&*f.state, PodState::parse(&f.state), f.timestamp_ms));
                        }
                    }
                }
            }
        }

        // still flying at the end of the window
        if let (Some((_, parsed, since)), Some(last)) = (current, stats.last_timestamp_ms)
            && parsed.is_some_and(PodState::is_flight)
        {
            stats.run_time_ms += last.saturating_sub(since);
        }

        stats.battery_soc = soc.finish();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry_decode::{CanFrame, MotionFrame, StateFrame};
    use basestation_shared::ErrorFlags;
    use std::sync::Arc;
    use std::time::Duration;

    fn can(ts: u64, soc: f32) -> TelemetryFrame {
        TelemetryFrame::Can(CanFrame {
            timestamp_ms: ts,
            pack_soc: soc,
            pack_voltage: 400.0,
            pack_current: 0.0,
        })
    }

    fn motion(ts: u64, position: f32, velocity: f32) -> TelemetryFrame {
        TelemetryFrame::Motion(MotionFrame {
            timestamp_ms: ts,
            position,
            velocity,
            acceleration: -2.0,
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
    fn empty_history() {
        let stats = StatsAggregator::compute(&[]);
        assert_eq!(stats, TelemetryStats::default());
    }

    #[test]
    fn battery_and_motion_summaries() {
        let history = vec![
            can(0, 90.0),
            motion(10, 5.0, 3.0),
            can(20, 80.0),
            motion(30, 12.0, -7.5),
            can(40, 85.0),
        ];
        let stats = StatsAggregator::compute(&history);
        assert_eq!(stats.frame_count, 5);
        assert_eq!(stats.can_frames, 3);
        assert_eq!(stats.motion_frames, 2);
        assert_eq!(stats.elapsed_ms, 40);
        assert_eq!(
            stats.battery_soc,
            Some(SeriesStats {
                min: 80.0,
                max: 90.0,
                mean: 85.0,
                last: 85.0
            })
        );
        assert_eq!(stats.max_position, Some(12.0));
        assert_eq!(stats.peak_velocity, Some(7.5));
        assert_eq!(stats.peak_acceleration, Some(2.0));
    }

    #[test]
    fn run_time_counts_flight_states_only() {
        let history = vec![
            state(0, "LAUNCH_READY"),
            state(100, "FLIGHT_ACCEL"),
            state(150, "FLIGHT_ACCEL"),
            state(400, "FLIGHT_COAST"),
            state(700, "FLIGHT_BRAKE"),
            state(1_000, "SAFE_MODE"),
            can(1_200, 50.0),
        ];
        let stats = StatsAggregator::compute(&history);
        assert_eq!(stats.state_frames, 6);
        assert_eq!(stats.state_changes, 4);
        assert_eq!(stats.run_time_ms, 900);
    }

    #[test]
    fn run_time_includes_ongoing_flight() {
        let history = vec![state(0, "FLIGHT_ACCEL"), motion(250, 40.0, 20.0)];
        assert_eq!(StatsAggregator::compute(&history).run_time_ms, 250);
    }

    #[test]
    fn from_store_uses_snapshot() {
        let store = TelemetryStore::new(16, Duration::from_secs(1));
        store.record(can(20, 70.0), 0);
        store.record(can(10, 75.0), 0);
        let stats = StatsAggregator::from_store(&store);
        assert_eq!(stats.first_timestamp_ms, Some(10));
        assert_eq!(stats.battery_soc.map(|s| s.last), Some(70.0));
    }
}
