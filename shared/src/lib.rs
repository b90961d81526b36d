use serde::{Deserialize, Serialize};

/// Command code the control surface sends to mean "do nothing".
pub const NOOP_COMMAND: i64 = -1;

/// Length of the test track in meters. The pod only reports distance traveled.
pub const TOTAL_COURSE_DISTANCE_M: f32 = 1200.0;

/// Command identifiers understood by the pod's network manager.
///
/// The numeric values are part of the pod protocol and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    TransSafeMode = 0,
    TransFunctionalTest = 1,
    TransLoading = 2,
    TransLaunchReady = 3,
    Launch = 4,
    EmergencyBrake = 5,
    EnableMotor = 6,
    DisableMotor = 7,
    SetMotorSpeed = 8,
    EnableBrake = 9,
    DisableBrake = 10,
    TransFlightCoast = 11,
    TransFlightBrake = 12,
    TransErrorState = 13,
    // SET_XXX_ERROR and CLR_XXX_ERROR must stay contiguous blocks
    SetAdcError = 14,
    SetCanError = 15,
    SetI2cError = 16,
    SetPruError = 17,
    SetNetworkError = 18,
    SetOtherError = 19,
    ClrAdcError = 20,
    ClrCanError = 21,
    ClrI2cError = 22,
    ClrPruError = 23,
    ClrNetworkError = 24,
    ClrOtherError = 25,
    SetHvRelayHvPole = 26,
    SetHvRelayLvPole = 27,
    SetHvRelayPreCharge = 28,
}

/// Validation family an opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeClass {
    /// Requests a pod state machine transition.
    Transition,
    /// Toggles an actuator; always sent with value 0.
    Actuator,
    /// Carries a free-form integer (motor speed).
    MotorSpeed,
    /// Sets or clears a subsystem error flag.
    ErrorFlag,
    /// Opens or closes a high-voltage relay pole; value must be 0 or 1.
    Relay,
}

impl Opcode {
    pub const ALL: [Opcode; 29] = [
        Opcode::TransSafeMode,
        Opcode::TransFunctionalTest,
        Opcode::TransLoading,
        Opcode::TransLaunchReady,
        Opcode::Launch,
        Opcode::EmergencyBrake,
        Opcode::EnableMotor,
        Opcode::DisableMotor,
        Opcode::SetMotorSpeed,
        Opcode::EnableBrake,
        Opcode::DisableBrake,
        Opcode::TransFlightCoast,
        Opcode::TransFlightBrake,
        Opcode::TransErrorState,
        Opcode::SetAdcError,
        Opcode::SetCanError,
        Opcode::SetI2cError,
        Opcode::SetPruError,
        Opcode::SetNetworkError,
        Opcode::SetOtherError,
        Opcode::ClrAdcError,
        Opcode::ClrCanError,
        Opcode::ClrI2cError,
        Opcode::ClrPruError,
        Opcode::ClrNetworkError,
        Opcode::ClrOtherError,
        Opcode::SetHvRelayHvPole,
        Opcode::SetHvRelayLvPole,
        Opcode::SetHvRelayPreCharge,
    ];

    pub fn from_code(code: i64) -> Option<Opcode> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn class(self) -> OpcodeClass {
        use Opcode::*;
        match self {
            TransSafeMode | TransFunctionalTest | TransLoading | TransLaunchReady | Launch
            | EmergencyBrake | TransFlightCoast | TransFlightBrake | TransErrorState => {
                OpcodeClass::Transition
            }
            EnableMotor | DisableMotor | EnableBrake | DisableBrake => OpcodeClass::Actuator,
            SetMotorSpeed => OpcodeClass::MotorSpeed,
            SetAdcError | SetCanError | SetI2cError | SetPruError | SetNetworkError
            | SetOtherError | ClrAdcError | ClrCanError | ClrI2cError | ClrPruError
            | ClrNetworkError | ClrOtherError => OpcodeClass::ErrorFlag,
            SetHvRelayHvPole | SetHvRelayLvPole | SetHvRelayPreCharge => OpcodeClass::Relay,
        }
    }

    /// Safety actions that jump ahead of anything already queued.
    pub fn is_priority(self) -> bool {
        matches!(self, Opcode::EmergencyBrake | Opcode::TransErrorState)
    }

    pub fn as_str(self) -> &'static str {
        use Opcode::*;
        match self {
            TransSafeMode => "TRANS_SAFE_MODE",
            TransFunctionalTest => "TRANS_FUNCTIONAL_TEST",
            TransLoading => "TRANS_LOADING",
            TransLaunchReady => "TRANS_LAUNCH_READY",
            Launch => "LAUNCH",
            EmergencyBrake => "EMERGENCY_BRAKE",
            EnableMotor => "ENABLE_MOTOR",
            DisableMotor => "DISABLE_MOTOR",
            SetMotorSpeed => "SET_MOTOR_SPEED",
            EnableBrake => "ENABLE_BRAKE",
            DisableBrake => "DISABLE_BRAKE",
            TransFlightCoast => "TRANS_FLIGHT_COAST",
            TransFlightBrake => "TRANS_FLIGHT_BRAKE",
            TransErrorState => "TRANS_ERROR_STATE",
            SetAdcError => "SET_ADC_ERROR",
            SetCanError => "SET_CAN_ERROR",
            SetI2cError => "SET_I2C_ERROR",
            SetPruError => "SET_PRU_ERROR",
            SetNetworkError => "SET_NETWORK_ERROR",
            SetOtherError => "SET_OTHER_ERROR",
            ClrAdcError => "CLR_ADC_ERROR",
            ClrCanError => "CLR_CAN_ERROR",
            ClrI2cError => "CLR_I2C_ERROR",
            ClrPruError => "CLR_PRU_ERROR",
            ClrNetworkError => "CLR_NETWORK_ERROR",
            ClrOtherError => "CLR_OTHER_ERROR",
            SetHvRelayHvPole => "SET_HV_RELAY_HV_POLE",
            SetHvRelayLvPole => "SET_HV_RELAY_LV_POLE",
            SetHvRelayPreCharge => "SET_HV_RELAY_PRE_CHARGE",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States the pod reports about itself. The gateway never drives these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodState {
    SafeMode,
    FunctionalTest,
    Loading,
    LaunchReady,
    FlightAccel,
    FlightCoast,
    FlightBrake,
    ErrorState,
}

impl PodState {
    /// Parses the pod's state string. Accepts `"Launch Ready"`, `"launch-ready"`
    /// and `"LAUNCH_READY"` alike; an optional `ST_`/`STATE_` prefix is dropped.
    pub fn parse(raw: &str) -> Option<PodState> {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        let name = normalized
            .strip_prefix("STATE_")
            .or_else(|| normalized.strip_prefix("ST_"))
            .unwrap_or(&normalized);

        match name {
            "SAFE_MODE" | "SAFE" => Some(PodState::SafeMode),
            "FUNCTIONAL_TEST" => Some(PodState::FunctionalTest),
            "LOADING" => Some(PodState::Loading),
            "LAUNCH_READY" => Some(PodState::LaunchReady),
            "FLIGHT_ACCEL" => Some(PodState::FlightAccel),
            "FLIGHT_COAST" => Some(PodState::FlightCoast),
            "FLIGHT_BRAKE" => Some(PodState::FlightBrake),
            "ERROR_STATE" | "ERROR" => Some(PodState::ErrorState),
            _ => None,
        }
    }

    /// Canonical name as the pod firmware spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            PodState::SafeMode => "SAFE_MODE",
            PodState::FunctionalTest => "FUNCTIONAL_TEST",
            PodState::Loading => "LOADING",
            PodState::LaunchReady => "LAUNCH_READY",
            PodState::FlightAccel => "FLIGHT_ACCEL",
            PodState::FlightCoast => "FLIGHT_COAST",
            PodState::FlightBrake => "FLIGHT_BRAKE",
            PodState::ErrorState => "ERROR_STATE",
        }
    }

    pub fn is_flight(self) -> bool {
        matches!(
            self,
            PodState::FlightAccel | PodState::FlightCoast | PodState::FlightBrake
        )
    }
}

/// Subsystem error flags reported alongside the pod state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ErrorFlags(pub u8);

impl ErrorFlags {
    pub const ADC: u8 = 1 << 0;
    pub const CAN: u8 = 1 << 1;
    pub const I2C: u8 = 1 << 2;
    pub const PRU: u8 = 1 << 3;
    pub const NETWORK: u8 = 1 << 4;
    pub const OTHER: u8 = 1 << 5;

    const NAMES: [(u8, &'static str); 6] = [
        (Self::ADC, "ADC"),
        (Self::CAN, "CAN"),
        (Self::I2C, "I2C"),
        (Self::PRU, "PRU"),
        (Self::NETWORK, "NETWORK"),
        (Self::OTHER, "OTHER"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Device command as posted by the control surface:
///   { "command": 8, "value": 50 }
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: i64,
    #[serde(default)]
    pub value: Option<i64>,
}

/// Physical/virtual buttons on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Ready,
    EStop,
}

impl Button {
    /// Anything other than "ready" is treated as an e-stop.
    pub fn from_name(name: &str) -> Button {
        if name.eq_ignore_ascii_case("ready") {
            Button::Ready
        } else {
            Button::EStop
        }
    }
}

/// Button event as posted by the control surface: { "button": "e-stop" }
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub button: String,
}

/// Connection state of the command link to the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMsg {
    pub state: String,
    pub parsed: Option<PodState>,
    pub errors: Vec<String>,
    pub timestamp_ms: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryMsg {
    /// Pack state of charge in percent.
    pub value: f32,
    pub voltage: f32,
    pub current: f32,
    pub timestamp_ms: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMsg {
    pub current_distance: f32,
    pub total_distance: f32,
    pub velocity: f32,
    pub timestamp_ms: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatusMsg {
    pub status: LinkStatus,
    pub queued: usize,
    pub dropped: u64,
    pub datagrams: u64,
    pub frames: u64,
    pub decode_errors: u64,
}

/// Min/max/mean over one telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub last: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub frame_count: usize,
    pub can_frames: usize,
    pub motion_frames: usize,
    pub state_frames: usize,
    pub first_timestamp_ms: Option<u64>,
    pub last_timestamp_ms: Option<u64>,
    /// Span between the oldest and newest retained frame.
    pub elapsed_ms: u64,
    /// Time the pod reported being in a flight state.
    pub run_time_ms: u64,
    pub battery_soc: Option<SeriesStats>,
    pub max_position: Option<f32>,
    pub peak_velocity: Option<f32>,
    pub peak_acceleration: Option<f32>,
    pub state_changes: usize,
}
