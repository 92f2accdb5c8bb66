// Rate-limited motion controller
//
// Each tick moves the commanded orientation at most one velocity step toward the
// target, solves the four servo angles and issues them as one synchronized move.
// Any failure latches a fault: no further moves until a new target arrives.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CONVERGENCE_EPSILON_DEG, RuntimeConfig, SERVO_STEP_GAIN};
use crate::messages::{
    Arm, ControllerStatus, FaultReason, Orientation, StatusSnapshot, TargetState,
    shortest_azimuth_delta,
};
use crate::motor::{Actuators, DriverError, Geometry, Solution, WorkspaceError};

/// Why one synchronized move could not be issued
#[derive(Debug, Error)]
pub enum MotionError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("arm {arm} would jump {from_deg:.2}° -> {to_deg:.2}° in one tick")]
    Jump { arm: Arm, from_deg: f64, to_deg: f64 },

    #[error("arm {arm}: {source}")]
    Driver { arm: Arm, source: DriverError },

    #[error("bus: {0}")]
    Bus(DriverError),
}

impl MotionError {
    pub fn fault_reason(&self) -> FaultReason {
        match self {
            MotionError::Workspace(e) => FaultReason::Workspace {
                error: e.to_string(),
            },
            MotionError::Jump { .. } => FaultReason::Workspace {
                error: self.to_string(),
            },
            MotionError::Driver { arm, source } => FaultReason::Driver {
                arm: *arm,
                error: source.to_string(),
            },
            MotionError::Bus(e) => FaultReason::Bus {
                error: e.to_string(),
            },
        }
    }
}

/// How fast and how often the controller moves
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionLimits {
    pub max_velocity_deg_s: f64,
    pub tick: Duration,
    pub epsilon_deg: f64,
}

impl MotionLimits {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            max_velocity_deg_s: config.max_velocity_deg_s,
            tick: config.tick_period(),
            epsilon_deg: CONVERGENCE_EPSILON_DEG,
        }
    }

    /// Largest orientation change allowed in one tick, degrees
    pub fn max_step_deg(&self) -> f64 {
        self.max_velocity_deg_s * self.tick.as_secs_f64()
    }

    /// Largest servo angle change allowed in one tick, degrees
    pub fn max_servo_step_deg(&self) -> f64 {
        SERVO_STEP_GAIN * self.max_step_deg().sqrt()
    }
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Next commanded orientation: a straight step in (azimuth, elevation), azimuth the
/// short way around, no longer than `max_step`
pub fn next_setpoint(current: &Orientation, target: &Orientation, max_step: f64) -> Orientation {
    let d_az = shortest_azimuth_delta(current.azimuth, target.azimuth);
    let d_el = target.elevation - current.elevation;
    let distance = d_az.hypot(d_el);
    if distance <= max_step {
        return *target;
    }
    let fraction = max_step / distance;
    Orientation::new(
        current.azimuth + d_az * fraction,
        current.elevation + d_el * fraction,
    )
}

pub struct MotionController<A: Actuators> {
    actuators: A,
    geometry: Geometry,
    limits: MotionLimits,
    current: Orientation,
    target: TargetState,
    status: ControllerStatus,
    last: Option<Solution>,
}

impl<A: Actuators> MotionController<A> {
    /// Starts believing the plate is level; call [`MotionController::home`] to make it so
    pub fn new(actuators: A, geometry: Geometry, limits: MotionLimits) -> Self {
        Self {
            actuators,
            geometry,
            limits,
            current: Orientation::NEUTRAL,
            target: TargetState::new(Orientation::NEUTRAL),
            status: ControllerStatus::Idle,
            last: None,
        }
    }

    /// Slow move to the level pose, used once at bring-up
    pub fn home(&mut self, duration: Duration) -> Result<(), MotionError> {
        info!("Homing to {} over {:?}", Orientation::NEUTRAL, duration);
        match self.issue(&Orientation::NEUTRAL, duration, None) {
            Ok(solution) => {
                self.last = Some(solution);
                self.current = Orientation::NEUTRAL;
                self.target = TargetState::new(Orientation::NEUTRAL);
                self.status = ControllerStatus::Idle;
                Ok(())
            }
            Err(e) => {
                error!("Homing failed: {}", e);
                self.status = ControllerStatus::Fault(e.fault_reason());
                Err(e)
            }
        }
    }

    /// One control tick against the latest target
    pub fn step(&mut self, target: TargetState) {
        if target != self.target {
            if let ControllerStatus::Fault(reason) = &self.status {
                info!("New target {}, clearing fault ({})", target.orientation, reason);
            } else {
                debug!("New target {}", target.orientation);
            }
            self.target = target;
            if self.current == target.orientation {
                self.status = ControllerStatus::Idle;
            } else {
                self.set_status(ControllerStatus::Moving);
            }
        }

        if self.status.is_fault() || self.current == self.target.orientation {
            return;
        }

        let goal = self.target.orientation;
        if self.current.distance(&goal) <= self.limits.epsilon_deg {
            // Closer than the servos can resolve
            self.current = goal;
            self.set_status(ControllerStatus::Idle);
            return;
        }
        let next = next_setpoint(&self.current, &goal, self.limits.max_step_deg());

        match self.issue(&next, self.limits.tick, Some(self.limits.max_servo_step_deg())) {
            Ok(solution) => {
                self.last = Some(solution);
                self.current = next;
                if next == goal {
                    self.set_status(ControllerStatus::Idle);
                }
            }
            Err(e) => {
                warn!("Move toward {} failed: {}", goal, e);
                self.set_status(ControllerStatus::Fault(e.fault_reason()));
            }
        }
    }

    // Solve on the branches of the last move, check no arm jumps, then stage all four
    // arms and start them together
    fn issue(
        &mut self,
        next: &Orientation,
        duration: Duration,
        max_servo_step: Option<f64>,
    ) -> Result<Solution, MotionError> {
        let solution = self
            .geometry
            .solve(next, self.last.as_ref().map(|last| &last.branches))?;
        let angles = solution.angles;

        if let (Some(limit), Some(last)) = (max_servo_step, &self.last) {
            for arm in Arm::ALL {
                let (from_deg, to_deg) = (last.angles.get(arm), angles.get(arm));
                if (to_deg - from_deg).abs() > limit {
                    return Err(MotionError::Jump {
                        arm,
                        from_deg,
                        to_deg,
                    });
                }
            }
        }

        for arm in Arm::ALL {
            self.actuators
                .move_to(arm, angles.get(arm), duration)
                .map_err(|source| MotionError::Driver { arm, source })?;
        }
        self.actuators.commit_moves().map_err(MotionError::Bus)?;
        Ok(solution)
    }

    fn set_status(&mut self, status: ControllerStatus) {
        if status != self.status {
            match &status {
                ControllerStatus::Idle => info!("Reached {}", self.current),
                ControllerStatus::Moving => debug!("Moving toward {}", self.target.orientation),
                ControllerStatus::Fault(reason) => error!("Controller fault: {}", reason),
            }
            self.status = status;
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            current: self.current,
            target: self.target.orientation,
            status: self.status.clone(),
            target_set_at: Some(self.target.set_at),
        }
    }

    pub fn current(&self) -> Orientation {
        self.current
    }

    pub fn target(&self) -> TargetState {
        self.target
    }

    pub fn status(&self) -> &ControllerStatus {
        &self.status
    }

    pub fn actuators_mut(&mut self) -> &mut A {
        &mut self.actuators
    }
}
