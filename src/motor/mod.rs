// Motor control module for the SPM rotator
//
// Provides:
// - Inverse/forward kinematics (plate orientation <-> servo angles)
// - LX-16A serial protocol implementation
// - High-level servo driver API and a simulated bus

mod driver;
pub mod kinematics;
pub mod lx16a;
pub mod sim;

pub use driver::{Actuators, ServoDriver};
pub use kinematics::{ArmAngles, Branch, Geometry, PoseEstimate, Solution, WorkspaceError};
pub use lx16a::{DriverError, Lx16aBus};
pub use sim::SimulatedBus;
