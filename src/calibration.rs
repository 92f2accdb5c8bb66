// Interactive arm calibration
//
// Each arm in turn is driven to full extension, released so the operator can set it
// by hand, and the difference between what the servo reads and what the geometry
// expects is stored in the servo as its angle offset.

use std::io;
use std::thread::sleep;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::HOMING_DURATION;
use crate::messages::{Arm, Orientation};
use crate::motor::{Actuators, ArmAngles, DriverError, Geometry, WorkspaceError};

/// Elevation of the pose that fully extends the arm opposite the tilt
pub const EXTENSION_ELEVATION_DEG: f64 = 50.0;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("prompt failed: {0}")]
    Prompt(#[from] io::Error),
}

/// Pose that fully extends `arm`: tilt 40° toward the opposite bearing
pub fn extension_pose(arm: Arm) -> Orientation {
    Orientation::new(arm.bearing_deg() + 180.0, EXTENSION_ELEVATION_DEG)
}

pub struct Calibrator {
    geometry: Geometry,
    settle: Duration,
}

impl Calibrator {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            settle: HOMING_DURATION,
        }
    }

    /// Time allowed for each pose change
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn move_all<A: Actuators>(&self, actuators: &mut A, angles: &ArmAngles) -> Result<(), DriverError> {
        for arm in Arm::ALL {
            actuators.move_to(arm, angles.get(arm), self.settle)?;
        }
        actuators.commit_moves()?;
        sleep(self.settle);
        Ok(())
    }

    /// Calibrate all four arms and return the stored offsets, degrees.
    ///
    /// `prompt` runs while the arm is released and returns once the operator has set it
    /// fully extended.
    pub fn run<A, F>(&self, actuators: &mut A, mut prompt: F) -> Result<[f64; 4], CalibrationError>
    where
        A: Actuators,
        F: FnMut(Arm, &mut A) -> io::Result<()>,
    {
        let mut offsets = [0.0; 4];

        for arm in Arm::ALL {
            // Start from the factory zero so the reading is raw
            actuators.write_calibration_offset(arm, 0.0)?;

            let angles = self.geometry.solve(&extension_pose(arm), None)?.angles;
            let expected = angles.get(arm);
            info!("Extending arm {} (expect {:.2}°)", arm, expected);
            self.move_all(actuators, &angles)?;

            actuators.set_torque(arm, false)?;
            prompt(arm, actuators)?;
            actuators.set_torque(arm, true)?;

            let reading = actuators.read_position(arm)?;
            let offset = reading - expected;
            actuators.write_calibration_offset(arm, offset)?;
            info!("Arm {}: read {:.2}°, offset {:.2}°", arm, reading, offset);
            offsets[arm.index()] = offset;
        }

        let level = self.geometry.solve(&Orientation::NEUTRAL, None)?.angles;
        self.move_all(actuators, &level)?;
        info!("Calibration done, offsets {:?}", offsets);
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Lx16aBus, ServoDriver, SimulatedBus};

    fn driver() -> ServoDriver<SimulatedBus> {
        ServoDriver::from_bus(Lx16aBus::new(SimulatedBus::new()).with_retries(2, Duration::ZERO))
            .keep_torque_on_drop()
    }

    #[test]
    fn test_extension_pose_faces_away() {
        assert_eq!(extension_pose(Arm::North), Orientation::new(180.0, 50.0));
        assert_eq!(extension_pose(Arm::West), Orientation::new(90.0, 50.0));
    }

    #[test]
    fn test_offsets_follow_hand_adjustment() {
        let geometry = Geometry::default();
        let calibrator = Calibrator::new(geometry.clone()).with_settle(Duration::ZERO);
        let errors = [7.0, -3.0, 0.0, 12.5];

        let mut driver = driver();
        let offsets = calibrator
            .run(&mut driver, |arm, driver| {
                // The operator finds the true extension off by the mounting error
                let expected = geometry.solve(&extension_pose(arm), None).unwrap().angles.get(arm);
                let port = driver.bus().port_mut();
                assert!(!port.torque(arm));
                port.push_by_hand(arm, expected + errors[arm.index()]);
                Ok(())
            })
            .unwrap();

        for arm in Arm::ALL {
            let error = errors[arm.index()];
            assert!((offsets[arm.index()] - error).abs() < 0.5);
            assert!((driver.bus().port().saved_offset(arm) - error).abs() < 0.5);
            assert!(driver.bus().port().torque(arm));
            // Back at level the servo reads neutral
            assert!((driver.read_position(arm).unwrap() - 120.0).abs() < 0.25);
        }
    }

    #[test]
    fn test_offset_beyond_range_is_refused() {
        let calibrator = Calibrator::new(Geometry::default()).with_settle(Duration::ZERO);
        let mut driver = driver();
        let result = calibrator.run(&mut driver, |arm, driver| {
            let port = driver.bus().port_mut();
            port.push_by_hand(arm, port.position(arm) + 45.0);
            Ok(())
        });
        assert!(matches!(
            result,
            Err(CalibrationError::Driver(DriverError::OffsetOutOfRange { id: 1, .. }))
        ));
    }

    #[test]
    fn test_prompt_failure_stops_calibration() {
        let calibrator = Calibrator::new(Geometry::default()).with_settle(Duration::ZERO);
        let mut driver = driver();
        let result = calibrator.run(&mut driver, |_, _| {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"))
        });
        assert!(matches!(result, Err(CalibrationError::Prompt(_))));
    }
}
