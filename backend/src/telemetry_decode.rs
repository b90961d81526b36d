use crate::error::DecodeError;
use basestation_shared::ErrorFlags;
use std::sync::Arc;

pub const FRAME_VERSION: u8 = 1;
/// version (1) + kind (1) + timestamp ms (8)
#[cfg(any(test, feature = "testing"))]
pub const HEADER_LEN: usize = 10;
pub const MAX_STATE_LEN: usize = 64;

#[cfg(any(test, feature = "testing"))]
const CAN_PAYLOAD_LEN: usize = 12;
#[cfg(any(test, feature = "testing"))]
const MOTION_PAYLOAD_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Can = 1,
    Motion = 2,
    State = 3,
}

impl FrameKind {
    fn from_u8(raw: u8) -> Option<FrameKind> {
        match raw {
            1 => Some(FrameKind::Can),
            2 => Some(FrameKind::Motion),
            3 => Some(FrameKind::State),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Can => "CAN_DATA",
            FrameKind::Motion => "MOTION_DATA",
            FrameKind::State => "STATE",
        }
    }
}

/// Battery data forwarded from the pod's CAN bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanFrame {
    pub timestamp_ms: u64,
    pub pack_soc: f32,
    pub pack_voltage: f32,
    pub pack_current: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionFrame {
    pub timestamp_ms: u64,
    /// Distance traveled along the track, meters.
    pub position: f32,
    pub velocity: f32,
    pub acceleration: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateFrame {
    pub timestamp_ms: u64,
    pub state: Arc<str>,
    pub error_flags: ErrorFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    Can(CanFrame),
    Motion(MotionFrame),
    State(StateFrame),
}

impl TelemetryFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            TelemetryFrame::Can(_) => FrameKind::Can,
            TelemetryFrame::Motion(_) => FrameKind::Motion,
            TelemetryFrame::State(_) => FrameKind::State,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            TelemetryFrame::Can(f) => f.timestamp_ms,
            TelemetryFrame::Motion(f) => f.timestamp_ms,
            TelemetryFrame::State(f) => f.timestamp_ms,
        }
    }

    pub fn set_timestamp_ms(&mut self, ts: u64) {
        match self {
            TelemetryFrame::Can(f) => f.timestamp_ms = ts,
            TelemetryFrame::Motion(f) => f.timestamp_ms = ts,
            TelemetryFrame::State(f) => f.timestamp_ms = ts,
        }
    }
}

/// Bounds-checked little-endian reader over a datagram.
struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        let value = f32::from_le_bytes(self.array()?);
        if !value.is_finite() {
            return Err(DecodeError::NonFinite(field));
        }
        Ok(value)
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes { extra }),
        }
    }
}

/// Decodes one telemetry datagram. Any malformed input is an error; nothing
/// is ever partially accepted.
pub fn decode_frame(bytes: &[u8]) -> Result<TelemetryFrame, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut rd = FrameReader::new(bytes);

    let version = rd.u8()?;
    if version != FRAME_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let raw_kind = rd.u8()?;
    let kind = FrameKind::from_u8(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;
    let timestamp_ms = rd.u64()?;

    let frame = match kind {
        FrameKind::Can => TelemetryFrame::Can(CanFrame {
            timestamp_ms,
            pack_soc: rd.f32("pack_soc")?,
            pack_voltage: rd.f32("pack_voltage")?,
            pack_current: rd.f32("pack_current")?,
        }),
        FrameKind::Motion => TelemetryFrame::Motion(MotionFrame {
            timestamp_ms,
            position: rd.f32("position")?,
            velocity: rd.f32("velocity")?,
            acceleration: rd.f32("acceleration")?,
        }),
        FrameKind::State => {
            let error_flags = ErrorFlags(rd.u8()?);
            let len = rd.u8()? as usize;
            if len > MAX_STATE_LEN {
                return Err(DecodeError::StateTooLong(len));
            }
            let raw = rd.take(len)?;
            let state = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
            TelemetryFrame::State(StateFrame {
                timestamp_ms,
                state: Arc::from(state.trim_end_matches('\0')),
                error_flags,
            })
        }
    };
    rd.finish()?;
    Ok(frame)
}

/// Serializes a frame in the pod's wire layout. Used by the simulated pod.
#[cfg(any(test, feature = "testing"))]
pub fn encode_frame(frame: &TelemetryFrame) -> Vec<u8> {
    let payload_len = match frame {
        TelemetryFrame::Can(_) => CAN_PAYLOAD_LEN,
        TelemetryFrame::Motion(_) => MOTION_PAYLOAD_LEN,
        TelemetryFrame::State(s) => 2 + s.state.len().min(MAX_STATE_LEN),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload_len);
    out.push(FRAME_VERSION);
    out.push(frame.kind() as u8);
    out.extend_from_slice(&frame.timestamp_ms().to_le_bytes());

    match frame {
        TelemetryFrame::Can(f) => {
            for v in [f.pack_soc, f.pack_voltage, f.pack_current] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        TelemetryFrame::Motion(f) => {
            for v in [f.position, f.velocity, f.acceleration] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        TelemetryFrame::State(f) => {
            let mut end = f.state.len().min(MAX_STATE_LEN);
            while !f.state.is_char_boundary(end) {
                end -= 1;
            }
            out.push(f.error_flags.0);
            out.push(end as u8);
            out.extend_from_slice(&f.state.as_bytes()[..end]);
        }
    }
    out
}
