use crate::error::RejectReason;
use basestation_shared::{Opcode, OpcodeClass, PodState};
use tracing::warn;

const FROM_SAFE: &[PodState] = &[PodState::SafeMode, PodState::FunctionalTest];
const FROM_FUNCTIONAL_TEST: &[PodState] = &[PodState::FunctionalTest];
const FROM_LOADING: &[PodState] = &[PodState::Loading];
const FROM_LAUNCH_READY: &[PodState] = &[PodState::LaunchReady];
const FROM_ACCEL: &[PodState] = &[PodState::FlightAccel];
const FROM_FLIGHT: &[PodState] = &[PodState::FlightAccel, PodState::FlightCoast];

/// States a transition may be requested from. `None` means any state.
fn permitted_from(opcode: Opcode) -> Option<&'static [PodState]> {
    match opcode {
        Opcode::TransFunctionalTest => Some(FROM_SAFE),
        Opcode::TransLoading => Some(FROM_FUNCTIONAL_TEST),
        Opcode::TransLaunchReady => Some(FROM_LOADING),
        Opcode::Launch => Some(FROM_LAUNCH_READY),
        Opcode::TransFlightCoast => Some(FROM_ACCEL),
        Opcode::TransFlightBrake => Some(FROM_FLIGHT),
        _ => None,
    }
}

/// Refuses transition requests that cannot succeed from the state the pod
/// last reported. The pod stays authoritative: with no report, or a report
/// we cannot parse, everything is forwarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionGuard {
    enabled: bool,
}

impl TransitionGuard {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn check(&self, opcode: Opcode, reported: Option<&str>) -> Result<(), RejectReason> {
        if !self.enabled || opcode.class() != OpcodeClass::Transition {
            return Ok(());
        }
        let Some(current) = reported.and_then(PodState::parse) else {
            return Ok(());
        };
        match permitted_from(opcode) {
            Some(allowed) if !allowed.contains(&current) => {
                warn!(%opcode, ?current, "rejecting transition");
                Err(RejectReason::InvalidTransition {
                    requested: opcode,
                    current,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_guard_forwards_everything() {
        let guard = TransitionGuard::default();
        assert!(guard.check(Opcode::Launch, Some("SAFE_MODE")).is_ok());
    }

    #[test]
    fn launch_requires_launch_ready() {
        let guard = TransitionGuard::new(true);
        assert_eq!(
            guard.check(Opcode::Launch, Some("SAFE_MODE")),
            Err(RejectReason::InvalidTransition {
                requested: Opcode::Launch,
                current: PodState::SafeMode,
            })
        );
        assert!(guard.check(Opcode::Launch, Some("Launch Ready")).is_ok());
    }

    #[test]
    fn unknown_state_is_not_provably_invalid() {
        let guard = TransitionGuard::new(true);
        assert!(guard.check(Opcode::Launch, None).is_ok());
        assert!(guard.check(Opcode::Launch, Some("BOOTING")).is_ok());
    }

    #[test]
    fn safety_transitions_always_allowed() {
        let guard = TransitionGuard::new(true);
        for op in [Opcode::EmergencyBrake, Opcode::TransErrorState, Opcode::TransSafeMode] {
            assert!(guard.check(op, Some("FLIGHT_COAST")).is_ok());
        }
    }

    #[test]
    fn non_transitions_are_not_guarded() {
        let guard = TransitionGuard::new(true);
        assert!(guard.check(Opcode::SetMotorSpeed, Some("SAFE_MODE")).is_ok());
    }
}
