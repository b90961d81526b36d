use basestation_shared::{Opcode, PodState};
use std::io;

/// Why a submitted command was not queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("invalid command {0}")]
    InvalidOpcode(i64),

    #[error("value {value} out of range for {opcode}")]
    OutOfRange { opcode: Opcode, value: i64 },

    #[error("command queue full ({capacity} pending)")]
    QueueOverflow { capacity: usize },

    #[error("{requested} not allowed while pod reports {current:?}")]
    InvalidTransition { requested: Opcode, current: PodState },
}

/// Reasons a telemetry datagram or command record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("{extra} trailing bytes")]
    TrailingBytes { extra: usize },

    #[error("non-finite value in field {0}")]
    NonFinite(&'static str),

    #[error("state string of {0} bytes exceeds limit")]
    StateTooLong(usize),

    #[error("state string is not valid UTF-8")]
    InvalidUtf8,

    #[cfg(any(test, feature = "testing"))]
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("pod link lost after {delivered} records: {source}")]
    Disconnected {
        delivered: usize,
        #[source]
        source: io::Error,
    },
}
