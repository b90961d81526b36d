use crate::error::RejectReason;
use crate::pod_commands::{Command, validate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What to do when a normal command arrives and the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new command; the caller sees `QueueOverflow`.
    #[default]
    Reject,
    /// Discard the oldest queued normal command to make room.
    DropOldest,
}

#[derive(Default)]
struct Lanes {
    priority: VecDeque<Command>,
    normal: VecDeque<Command>,
    dropped: u64,
}

impl Lanes {
    fn lane_mut(&mut self, cmd: &Command) -> &mut VecDeque<Command> {
        if cmd.opcode.is_priority() {
            &mut self.priority
        } else {
            &mut self.normal
        }
    }
}

/// Bounded FIFO of outbound commands.
///
/// Any number of producers may enqueue; only the transport drains. Priority
/// commands sit in their own lane, are drained first and are never refused
/// for capacity. That lane holds at most one copy of each priority command.
pub struct CommandQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
    policy: OverflowPolicy,
    priority_ready: Notify,
}

impl CommandQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
            policy,
            priority_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates and queues a raw `(opcode, value)` pair. Returns the queued
    /// command, or `None` for the no-op.
    pub fn enqueue(&self, opcode: i64, value: Option<i64>) -> Result<Option<Command>, RejectReason> {
        let Some(cmd) = validate(opcode, value)? else {
            return Ok(None);
        };
        self.push(cmd)?;
        Ok(Some(cmd))
    }

    /// Queues an already validated command.
    pub fn push(&self, cmd: Command) -> Result<(), RejectReason> {
        if cmd.opcode.is_priority() {
            let mut lanes = self.lock();
            // both priority opcodes are idempotent; one pending copy is enough
            if lanes.priority.contains(&cmd) {
                debug!(opcode = %cmd.opcode, "priority command already pending");
            } else {
                lanes.priority.push_back(cmd);
                debug!(opcode = %cmd.opcode, "priority command queued");
            }
            drop(lanes);
            self.priority_ready.notify_one();
            return Ok(());
        }

        let mut lanes = self.lock();
        if lanes.normal.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    return Err(RejectReason::QueueOverflow {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(old) = lanes.normal.pop_front() {
                        lanes.dropped += 1;
                        warn!(
                            opcode = %old.opcode,
                            value = old.value,
                            "command queue full, dropped oldest command"
                        );
                    }
                }
            }
        }
        lanes.normal.push_back(cmd);
        Ok(())
    }

    /// Removes and returns everything queued: priority lane first, then the
    /// normal lane, each in enqueue order.
    pub fn drain_all(&self) -> Vec<Command> {
        let mut lanes = self.lock();
        let mut out = Vec::with_capacity(lanes.priority.len() + lanes.normal.len());
        out.extend(lanes.priority.drain(..));
        out.extend(lanes.normal.drain(..));
        out
    }

    /// Puts undelivered commands back at the head of their lanes, keeping
    /// their relative order. Capacity is not enforced here: these commands
    /// were already accepted once.
    pub fn requeue_front(&self, undelivered: Vec<Command>) {
        if undelivered.is_empty() {
            return;
        }
        let mut lanes = self.lock();
        let has_priority = undelivered.iter().any(|c| c.opcode.is_priority());
        for cmd in undelivered.into_iter().rev() {
            lanes.lane_mut(&cmd).push_front(cmd);
        }
        drop(lanes);
        if has_priority {
            self.priority_ready.notify_one();
        }
    }

    /// Resolves once a priority command has been queued.
    pub async fn priority_ready(&self) {
        self.priority_ready.notified().await;
    }

    pub fn len(&self) -> usize {
        let lanes = self.lock();
        lanes.priority.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands discarded by the drop-oldest policy since startup.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
