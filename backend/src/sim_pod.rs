use crate::pod_commands::{Command, RECORD_LEN};
use crate::telemetry_decode::{CanFrame, MotionFrame, StateFrame, TelemetryFrame, encode_frame};
use crate::telemetry_task::get_current_timestamp_ms;
use basestation_shared::{ErrorFlags, Opcode, PodState, TOTAL_COURSE_DISTANCE_M};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval};
use tracing::{debug, info, warn};

const STEP: Duration = Duration::from_millis(100);
const ACCEL: f32 = 9.0; // m/s²
const BRAKE_DECEL: f32 = 12.0; // m/s²
const PACK_VOLTAGE: f32 = 400.0;

/// Crude pod model: follows transition commands and integrates motion.
#[derive(Debug, Clone)]
pub struct SimPod {
    pub state: PodState,
    pub errors: ErrorFlags,
    pub position: f32,
    pub velocity: f32,
    pub acceleration: f32,
    pub soc: f32,
}

impl Default for SimPod {
    fn default() -> Self {
        Self {
            state: PodState::SafeMode,
            errors: ErrorFlags::default(),
            position: 0.0,
            velocity: 0.0,
            acceleration: 0.0,
            soc: 100.0,
        }
    }
}

impl SimPod {
    pub fn apply(&mut self, cmd: Command) {
        use Opcode::*;
        let code = cmd.opcode.code();
        match cmd.opcode {
            TransSafeMode => self.state = PodState::SafeMode,
            TransFunctionalTest => self.state = PodState::FunctionalTest,
            TransLoading => self.state = PodState::Loading,
            TransLaunchReady => self.state = PodState::LaunchReady,
            Launch => self.state = PodState::FlightAccel,
            TransFlightCoast => self.state = PodState::FlightCoast,
            EmergencyBrake | TransFlightBrake => self.state = PodState::FlightBrake,
            TransErrorState => self.state = PodState::ErrorState,
            SetAdcError | SetCanError | SetI2cError | SetPruError | SetNetworkError
            | SetOtherError => self.errors.0 |= 1 << (code - SetAdcError.code()),
            ClrAdcError | ClrCanError | ClrI2cError | ClrPruError | ClrNetworkError
            | ClrOtherError => self.errors.0 &= !(1 << (code - ClrAdcError.code())),
            _ => {}
        }
        info!(opcode = %cmd.opcode, value = cmd.value, state = self.state.as_str(), "sim pod: command");
    }

    pub fn step(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        self.acceleration = match self.state {
            PodState::FlightAccel => ACCEL,
            PodState::FlightBrake if self.velocity > 0.0 => -BRAKE_DECEL,
            _ => 0.0,
        };
        self.velocity = (self.velocity + self.acceleration * dt).max(0.0);
        self.position = (self.position + self.velocity * dt).min(TOTAL_COURSE_DISTANCE_M);

        if self.state.is_flight() {
            self.soc = (self.soc - 0.05 * dt * self.velocity.max(1.0)).max(0.0);
        }
        if self.position >= TOTAL_COURSE_DISTANCE_M && self.state != PodState::FlightBrake {
            self.state = PodState::FlightBrake;
        }
        if self.state == PodState::FlightBrake && self.velocity == 0.0 {
            self.state = PodState::SafeMode;
        }
    }

    pub fn frames(&self, now_ms: u64, rng: &mut impl Rng) -> [TelemetryFrame; 3] {
        let current = if self.state.is_flight() {
            rng.random_range(150.0..220.0)
        } else {
            rng.random_range(0.0..2.0)
        };
        [
            TelemetryFrame::Can(CanFrame {
                timestamp_ms: now_ms,
                pack_soc: self.soc,
                pack_voltage: PACK_VOLTAGE - (100.0 - self.soc) * 0.6 + rng.random_range(-0.5..0.5),
                pack_current: current,
            }),
            TelemetryFrame::Motion(MotionFrame {
                timestamp_ms: now_ms,
                position: self.position,
                velocity: self.velocity,
                acceleration: self.acceleration + rng.random_range(-0.05..0.05),
            }),
            TelemetryFrame::State(StateFrame {
                timestamp_ms: now_ms,
                state: Arc::from(self.state.as_str()),
                error_flags: self.errors,
            }),
        ]
    }
}

/// Where to send telemetry when the listener binds a wildcard address.
fn telemetry_target(bind: &str) -> Option<SocketAddr> {
    let mut addr: SocketAddr = bind.parse().ok()?;
    if addr.ip().is_unspecified() {
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
    }
    Some(addr)
}

async fn read_commands(mut stream: TcpStream, tx: mpsc::Sender<Command>) {
    let mut record = [0u8; RECORD_LEN];
    loop {
        if let Err(err) = stream.read_exact(&mut record).await {
            debug!(%err, "sim pod: command connection closed");
            return;
        }
        match Command::decode(&record) {
            Ok(cmd) => {
                if tx.send(cmd).await.is_err() {
                    return;
                }
            }
            Err(err) => warn!(%err, "sim pod: bad command record"),
        }
    }
}

/// Stands in for the pod: serves the command port and streams telemetry to
/// the listener.
pub async fn sim_pod_task(
    command_addr: String,
    telemetry_bind: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = TcpListener::bind(&command_addr)
        .await
        .with_context(|| format!("sim pod cannot bind {command_addr}"))?;
    let target = telemetry_target(&telemetry_bind)
        .with_context(|| format!("invalid telemetry address {telemetry_bind}"))?;
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    info!(%command_addr, %target, "sim pod running");

    let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
    let mut pod = SimPod::default();
    let mut tick = interval(STEP);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "sim pod: base station connected");
                    tokio::spawn(read_commands(stream, cmd_tx.clone()));
                }
                Err(err) => warn!(%err, "sim pod: accept failed"),
            },
            Some(cmd) = cmd_rx.recv() => pod.apply(cmd),
            _ = tick.tick() => {
                pod.step(STEP);
                let frames = pod.frames(get_current_timestamp_ms(), &mut rand::rng());
                for frame in &frames {
                    if let Err(err) = socket.send_to(&encode_frame(frame), target).await {
                        debug!(%err, "sim pod: telemetry send failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}
