use crate::command_queue::CommandQueue;
use crate::error::RejectReason;
use crate::pod_commands::Command;
use crate::telemetry_store::TelemetryStore;
use crate::telemetry_task::{ListenerStats, get_current_timestamp_ms};
use crate::transition_guard::TransitionGuard;
use basestation_shared::{Button, LinkStatus, LinkStatusMsg, Opcode};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    /// Operator commands → transport
    pub queue: Arc<CommandQueue>,

    /// Latest telemetry and bounded history
    pub store: Arc<TelemetryStore>,

    pub listener_stats: Arc<ListenerStats>,

    /// Published by the transport task
    pub link_rx: watch::Receiver<LinkStatus>,

    pub guard: TransitionGuard,
}

impl AppState {
    /// Checks an operator command against the pod's reported state, then
    /// validates and queues it.
    pub fn submit_command(&self, code: i64, value: Option<i64>) -> Result<(), RejectReason> {
        if let Some(opcode) = Opcode::from_code(code) {
            let reported = self.store.latest_state(get_current_timestamp_ms());
            self.guard
                .check(opcode, reported.as_ref().map(|r| &*r.frame.state))?;
        }

        match self.queue.enqueue(code, value)? {
            Some(cmd) => info!(opcode = %cmd.opcode, value = cmd.value, "command queued"),
            None => debug!("no-op command ignored"),
        }
        Ok(())
    }

    pub fn press_button(&self, button: Button) -> Result<(), RejectReason> {
        match button {
            Button::Ready => {
                info!("ready button pressed");
                Ok(())
            }
            Button::EStop => {
                warn!("e-stop pressed, queueing emergency brake");
                self.queue.push(Command::new(Opcode::EmergencyBrake, 0))
            }
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.link_rx.borrow()
    }

    pub fn link_status_msg(&self) -> LinkStatusMsg {
        LinkStatusMsg {
            status: self.link_status(),
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            datagrams: self.listener_stats.datagrams(),
            frames: self.listener_stats.frames(),
            decode_errors: self.listener_stats.decode_errors(),
        }
    }
}
