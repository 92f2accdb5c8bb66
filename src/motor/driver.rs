// High-level servo driver for the SPM rotator
//
// `Actuators` is what the controller and calibration need from the four arm
// servos; `ServoDriver` implements it on top of the LX-16A bus.

use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::kinematics::ArmAngles;
use super::lx16a::{BROADCAST_ID, BusPort, DriverError, Lx16aBus};
use crate::messages::Arm;

/// Capabilities the motion controller needs from the four arm actuators.
///
/// Moves are two-phase: `move_to` stages a timed move per arm and `commit_moves`
/// releases every staged move at once, so a tick either moves all arms or none.
pub trait Actuators {
    /// Stage a move of `arm` to `angle` degrees, to complete in `duration`
    fn move_to(&mut self, arm: Arm, angle: f64, duration: Duration) -> Result<(), DriverError>;

    /// Start every staged move
    fn commit_moves(&mut self) -> Result<(), DriverError>;

    /// Present servo angle in degrees
    fn read_position(&mut self, arm: Arm) -> Result<f64, DriverError>;

    /// Store a persistent angle offset, verified by reading it back
    fn write_calibration_offset(&mut self, arm: Arm, offset: f64) -> Result<(), DriverError>;

    fn set_torque(&mut self, arm: Arm, enabled: bool) -> Result<(), DriverError>;

    /// Check every arm answers, read where it is and enable torque
    fn engage_all(&mut self) -> Result<ArmAngles, DriverError> {
        let mut angles = [0.0; 4];
        for arm in Arm::ALL {
            angles[arm.index()] = self.read_position(arm)?;
            debug!("Arm {} at {:.2}°", arm, angles[arm.index()]);
        }
        for arm in Arm::ALL {
            self.set_torque(arm, true)?;
        }
        Ok(ArmAngles::from_array(angles))
    }

    /// Disable torque on every arm, trying all of them even if one fails
    fn release_all(&mut self) -> Result<(), DriverError> {
        let mut result = Ok(());
        for arm in Arm::ALL {
            if let Err(e) = self.set_torque(arm, false) {
                warn!("Failed to release arm {}: {}", arm, e);
                result = Err(e);
            }
        }
        result
    }
}

/// The four LX-16A arm servos on one bus
pub struct ServoDriver<P: BusPort = Box<dyn SerialPort>> {
    bus: Lx16aBus<P>,
    release_on_drop: bool,
}

impl ServoDriver {
    /// Create a new servo driver, connecting to the specified serial port
    pub fn new(port: &str, baud_rate: u32) -> Result<Self, DriverError> {
        info!("Opening servo bus on {} at {} baud", port, baud_rate);
        let bus = Lx16aBus::open_with_baudrate(port, baud_rate)?;
        Ok(Self::from_bus(bus))
    }
}

impl<P: BusPort> ServoDriver<P> {
    pub fn from_bus(bus: Lx16aBus<P>) -> Self {
        Self {
            bus,
            release_on_drop: true,
        }
    }

    /// Leave torque as it is when the driver is dropped
    pub fn keep_torque_on_drop(mut self) -> Self {
        self.release_on_drop = false;
        self
    }

    /// Check all four servos answer on the bus
    pub fn ping_all(&mut self) -> Result<(), DriverError> {
        for arm in Arm::ALL {
            let id = arm.servo_id();
            match self.bus.ping(id) {
                Ok(true) => debug!("Servo {} responding", id),
                Ok(false) => {
                    warn!("Servo {} not responding to ping", id);
                    return Err(DriverError::Timeout { id });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn bus(&mut self) -> &mut Lx16aBus<P> {
        &mut self.bus
    }
}

impl<P: BusPort> Actuators for ServoDriver<P> {
    fn move_to(&mut self, arm: Arm, angle: f64, duration: Duration) -> Result<(), DriverError> {
        self.bus.stage_move(arm.servo_id(), angle, duration)
    }

    fn commit_moves(&mut self) -> Result<(), DriverError> {
        self.bus.move_start(BROADCAST_ID)
    }

    fn read_position(&mut self, arm: Arm) -> Result<f64, DriverError> {
        self.bus.read_position(arm.servo_id())
    }

    fn write_calibration_offset(&mut self, arm: Arm, offset: f64) -> Result<(), DriverError> {
        let id = arm.servo_id();
        self.bus.adjust_angle_offset(id, offset)?;
        self.bus.persist_angle_offset(id)?;

        // The servo stores whole position units
        let stored = self.bus.read_angle_offset(id)?;
        if (stored - offset).abs() > 0.25 {
            return Err(DriverError::VerifyFailed {
                id,
                expected: format!("{:.2}°", offset),
                actual: format!("{:.2}°", stored),
            });
        }
        info!("Arm {} offset stored: {:.2}°", arm, stored);
        Ok(())
    }

    fn set_torque(&mut self, arm: Arm, enabled: bool) -> Result<(), DriverError> {
        self.bus.set_torque(arm.servo_id(), enabled)
    }
}

impl<P: BusPort> Drop for ServoDriver<P> {
    fn drop(&mut self) {
        // Let the plate rest instead of holding the last pose unattended
        if self.release_on_drop {
            if let Err(e) = self.release_all() {
                warn!("Failed to release servos on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::lx16a::{Command, encode_frame};
    use crate::motor::sim::SimulatedBus;

    fn driver(bus: SimulatedBus) -> ServoDriver<SimulatedBus> {
        ServoDriver::from_bus(Lx16aBus::new(bus).with_retries(2, Duration::ZERO))
    }

    #[test]
    fn test_engage_reads_positions_and_enables_torque() {
        let mut driver = driver(SimulatedBus::new());
        let angles = driver.engage_all().unwrap();
        for angle in angles.as_array() {
            assert!((angle - 120.0).abs() < 1e-9);
        }
        for arm in Arm::ALL {
            assert!(driver.bus().port().torque(arm));
        }
    }

    #[test]
    fn test_moves_wait_for_commit() {
        let mut driver = driver(SimulatedBus::new());
        driver
            .move_to(Arm::North, 150.0, Duration::from_millis(50))
            .unwrap();
        assert!((driver.read_position(Arm::North).unwrap() - 120.0).abs() < 0.25);

        driver.commit_moves().unwrap();
        assert!((driver.read_position(Arm::North).unwrap() - 150.0).abs() < 0.25);
        assert!((driver.read_position(Arm::East).unwrap() - 120.0).abs() < 0.25);
    }

    #[test]
    fn test_silent_servo_fails_move() {
        let mut driver = driver(SimulatedBus::new().with_silent(Arm::South));
        let result = driver.move_to(Arm::South, 130.0, Duration::from_millis(50));
        assert!(matches!(result, Err(DriverError::Timeout { id: 3 })));
        assert!(driver.ping_all().is_err());
    }

    #[test]
    fn test_calibration_offset_is_persisted() {
        let mut driver = driver(SimulatedBus::new());
        driver.write_calibration_offset(Arm::West, 4.5).unwrap();
        let stored = driver.bus().port().saved_offset(Arm::West);
        assert!((stored - 4.5).abs() < 0.25);
    }

    #[test]
    fn test_drop_releases_torque() {
        let mut driver = driver(SimulatedBus::new());
        driver.engage_all().unwrap();
        let log = driver.bus().port().request_log();
        drop(driver);
        let released = encode_frame(4, Command::LoadOrUnloadWrite, &[0]);
        assert!(log.lock().unwrap().contains(&released));
    }
}
