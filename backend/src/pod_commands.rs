#[cfg(any(test, feature = "testing"))]
use crate::error::DecodeError;
use crate::error::RejectReason;
use basestation_shared::{NOOP_COMMAND, Opcode, OpcodeClass};

/// Size of one command record on the wire.
pub const RECORD_LEN: usize = 8;
pub const RECORD_VERSION: u8 = 1;

/// A validated command ready to be sent to the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub value: i32,
}

impl Command {
    pub fn new(opcode: Opcode, value: i32) -> Self {
        Self { opcode, value }
    }

    /// Layout mirrors the pod's `{uint8_t id; int32_t value;}`:
    /// byte 0 opcode, byte 1 record version (padding to the pod),
    /// bytes 2..4 reserved, bytes 4..8 value little-endian.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = self.opcode.code();
        out[1] = RECORD_VERSION;
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < RECORD_LEN {
            return Err(DecodeError::Truncated {
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > RECORD_LEN {
            return Err(DecodeError::TrailingBytes {
                extra: bytes.len() - RECORD_LEN,
            });
        }
        if bytes[1] != RECORD_VERSION {
            return Err(DecodeError::UnsupportedVersion(bytes[1]));
        }
        let opcode =
            Opcode::from_code(bytes[0] as i64).ok_or(DecodeError::UnknownOpcode(bytes[0]))?;
        let value = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { opcode, value })
    }
}

/// Turns a raw `(command, value)` pair into a [`Command`].
///
/// Returns `Ok(None)` for the no-op sentinel. A missing value defaults to 0.
/// Only motor speed and relay commands carry their value to the pod; every
/// other command is sent with 0.
pub fn validate(code: i64, value: Option<i64>) -> Result<Option<Command>, RejectReason> {
    if code == NOOP_COMMAND {
        return Ok(None);
    }
    let opcode = Opcode::from_code(code).ok_or(RejectReason::InvalidOpcode(code))?;
    let raw = value.unwrap_or(0);
    let out_of_range = RejectReason::OutOfRange { opcode, value: raw };

    let value = match opcode.class() {
        OpcodeClass::Relay if !matches!(raw, 0 | 1) => return Err(out_of_range),
        OpcodeClass::Relay | OpcodeClass::MotorSpeed => {
            i32::try_from(raw).map_err(|_| out_of_range)?
        }
        OpcodeClass::Transition | OpcodeClass::Actuator | OpcodeClass::ErrorFlag => 0,
    };

    Ok(Some(Command { opcode, value }))
}
