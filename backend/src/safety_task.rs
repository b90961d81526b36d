use crate::state::AppState;
use crate::telemetry_task::get_current_timestamp_ms;
use basestation_shared::LinkStatus;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, interval};
use tracing::{info, warn};

const CHANNELS: [&str; 3] = ["state", "battery", "position"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyEvent {
    LinkChanged {
        from: Option<LinkStatus>,
        to: LinkStatus,
    },
    TelemetryStale(&'static str),
    TelemetryRecovered(&'static str),
}

/// Edge detector for link status and telemetry staleness. Only changes
/// produce events so the log is not flooded every period.
#[derive(Debug, Default)]
pub struct SafetyMonitor {
    link: Option<LinkStatus>,
    stale: [bool; 3],
}

impl SafetyMonitor {
    /// `freshness[i]` is the stale flag of channel `i`, `None` if it has no
    /// data yet.
    pub fn observe(&mut self, link: LinkStatus, freshness: [Option<bool>; 3]) -> Vec<SafetyEvent> {
        let mut events = Vec::new();

        if self.link != Some(link) {
            events.push(SafetyEvent::LinkChanged {
                from: self.link,
                to: link,
            });
            self.link = Some(link);
        }

        for (idx, stale) in freshness.into_iter().enumerate() {
            let now_stale = stale.unwrap_or(false);
            match (self.stale[idx], now_stale) {
                (false, true) => events.push(SafetyEvent::TelemetryStale(CHANNELS[idx])),
                (true, false) => events.push(SafetyEvent::TelemetryRecovered(CHANNELS[idx])),
                _ => {}
            }
            self.stale[idx] = now_stale;
        }

        events
    }
}

fn log_event(event: SafetyEvent) {
    match event {
        SafetyEvent::LinkChanged {
            to: LinkStatus::Disconnected,
            ..
        } => warn!("Safety: pod command link down"),
        SafetyEvent::LinkChanged { from, to } => info!(?from, ?to, "Safety: pod link status"),
        SafetyEvent::TelemetryStale(channel) => {
            warn!(channel, "Safety: no recent telemetry")
        }
        SafetyEvent::TelemetryRecovered(channel) => info!(channel, "Safety: telemetry resumed"),
    }
}

pub async fn safety_task(
    state: Arc<AppState>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut tick = interval(period);
    let mut monitor = SafetyMonitor::default();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = get_current_timestamp_ms();
                let freshness = [
                    state.store.latest_state(now).map(|r| r.stale),
                    state.store.latest_battery(now).map(|r| r.stale),
                    state.store.latest_position(now).map(|r| r.stale),
                ];
                for event in monitor.observe(state.link_status(), freshness) {
                    log_event(event);
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}
