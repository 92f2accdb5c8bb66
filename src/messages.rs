// Data shared between the command server, the motion task and telemetry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// One of the four arms, named by the compass bearing of its base joint.
/// The discriminant is the servo bus id.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    North = 1,
    East = 2,
    South = 3,
    West = 4,
}

impl Arm {
    /// Arms in servo id order
    pub const ALL: [Arm; 4] = [Arm::North, Arm::East, Arm::South, Arm::West];

    pub fn servo_id(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Compass bearing of the base joint, degrees clockwise from north
    pub fn bearing_deg(self) -> f64 {
        match self {
            Arm::North => 0.0,
            Arm::East => 90.0,
            Arm::South => 180.0,
            Arm::West => 270.0,
        }
    }

    pub fn from_servo_id(id: u8) -> Option<Arm> {
        Arm::ALL.into_iter().find(|arm| arm.servo_id() == id)
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arm::North => "N",
            Arm::East => "E",
            Arm::South => "S",
            Arm::West => "W",
        };
        write!(f, "{}", name)
    }
}

/// Orientation of the top plate.
///
/// `azimuth` is the compass bearing the plate normal leans toward, `elevation` the
/// angle of the normal above the horizon (90 = plate level).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub azimuth: f64,
    pub elevation: f64,
}

impl Orientation {
    /// Plate level, the safe resting pose
    pub const NEUTRAL: Orientation = Orientation {
        azimuth: 0.0,
        elevation: 90.0,
    };

    /// Build an orientation, wrapping the azimuth into [0, 360).
    /// No workspace check happens here; the solver rejects unreachable poses.
    pub fn new(azimuth: f64, elevation: f64) -> Self {
        Self {
            azimuth: wrap_azimuth(azimuth),
            elevation,
        }
    }

    /// Build from pitch (lean toward north) and roll (lean toward east), in degrees
    pub fn from_pitch_roll(pitch: f64, roll: f64) -> Self {
        let north = pitch.to_radians().tan();
        let east = roll.to_radians().tan();
        let norm = (north * north + east * east + 1.0).sqrt();
        let tilt = (1.0 / norm).acos().to_degrees();
        let azimuth = if north == 0.0 && east == 0.0 {
            0.0
        } else {
            east.atan2(north).to_degrees()
        };
        Self::new(azimuth, 90.0 - tilt)
    }

    /// Inverse of [`Orientation::from_pitch_roll`], returns `(pitch, roll)`
    pub fn to_pitch_roll(&self) -> (f64, f64) {
        let tilt = self.tilt().to_radians();
        let az = self.azimuth.to_radians();
        let pitch = (tilt.tan() * az.cos()).atan().to_degrees();
        let roll = (tilt.tan() * az.sin()).atan().to_degrees();
        (pitch, roll)
    }

    /// Angle between the plate normal and vertical, degrees
    pub fn tilt(&self) -> f64 {
        90.0 - self.elevation
    }

    pub fn is_finite(&self) -> bool {
        self.azimuth.is_finite() && self.elevation.is_finite()
    }

    /// Distance in (azimuth, elevation) space, azimuth measured the short way around
    pub fn distance(&self, other: &Orientation) -> f64 {
        let d_az = shortest_azimuth_delta(self.azimuth, other.azimuth);
        let d_el = other.elevation - self.elevation;
        (d_az * d_az + d_el * d_el).sqrt()
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "az={:.2} el={:.2}", self.azimuth, self.elevation)
    }
}

/// Wrap an azimuth into [0, 360)
pub fn wrap_azimuth(azimuth: f64) -> f64 {
    let wrapped = azimuth.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Signed azimuth change from `from` to `to` taking the shorter way, in (-180, 180]
pub fn shortest_azimuth_delta(from: f64, to: f64) -> f64 {
    let delta = (to - from).rem_euclid(360.0);
    if delta > 180.0 { delta - 360.0 } else { delta }
}

/// Last orientation requested by a client and when it was requested.
/// Always replaced as a whole value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetState {
    pub orientation: Orientation,
    pub set_at: Instant,
}

impl TargetState {
    pub fn new(orientation: Orientation) -> Self {
        Self {
            orientation,
            set_at: Instant::now(),
        }
    }
}

/// Why the controller stopped issuing moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    Driver { arm: Arm, error: String },
    /// A broadcast to every servo failed
    Bus { error: String },
    Workspace { error: String },
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::Driver { arm, error } => write!(f, "arm {}: {}", arm, error),
            FaultReason::Bus { error } => write!(f, "bus: {}", error),
            FaultReason::Workspace { error } => write!(f, "workspace: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    Idle,
    Moving,
    Fault(FaultReason),
}

impl ControllerStatus {
    pub fn is_fault(&self) -> bool {
        matches!(self, ControllerStatus::Fault(_))
    }
}

/// Published by the motion task after every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub current: Orientation,
    pub target: Orientation,
    pub status: ControllerStatus,
    /// When the tracked target was requested; tells repeated requests for one pose apart
    #[serde(skip)]
    pub target_set_at: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_azimuth_wraps() {
        assert_eq!(Orientation::new(-90.0, 60.0).azimuth, 270.0);
        assert_eq!(Orientation::new(360.0, 60.0).azimuth, 0.0);
        assert_eq!(Orientation::new(725.0, 60.0).azimuth, 5.0);
    }

    #[test]
    fn test_shortest_delta_crosses_north() {
        assert_eq!(shortest_azimuth_delta(350.0, 10.0), 20.0);
        assert_eq!(shortest_azimuth_delta(10.0, 350.0), -20.0);
        assert_eq!(shortest_azimuth_delta(0.0, 180.0), 180.0);
    }

    #[test]
    fn test_distance_uses_short_way() {
        let a = Orientation::new(350.0, 60.0);
        let b = Orientation::new(10.0, 60.0);
        assert!((a.distance(&b) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_pitch_roll_conversion() {
        let o = Orientation::from_pitch_roll(20.0, 0.0);
        assert!(o.azimuth.abs() < 1e-9);
        assert!((o.elevation - 70.0).abs() < 1e-9);

        let o = Orientation::from_pitch_roll(0.0, -15.0);
        assert!((o.azimuth - 270.0).abs() < 1e-9);
        assert!((o.elevation - 75.0).abs() < 1e-9);

        let o = Orientation::new(123.0, 62.0);
        let (pitch, roll) = o.to_pitch_roll();
        let back = Orientation::from_pitch_roll(pitch, roll);
        assert!(o.distance(&back) < 1e-9);
    }

    #[test]
    fn test_level_pitch_roll_is_neutral() {
        assert_eq!(Orientation::from_pitch_roll(0.0, 0.0), Orientation::NEUTRAL);
    }

    #[test]
    fn test_arm_ids() {
        assert_eq!(Arm::North.servo_id(), 1);
        assert_eq!(Arm::West.index(), 3);
        assert_eq!(Arm::from_servo_id(3), Some(Arm::South));
        assert_eq!(Arm::from_servo_id(9), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ControllerStatus::Idle).unwrap();
        assert_eq!(json, "\"idle\"");
        let fault = ControllerStatus::Fault(FaultReason::Driver {
            arm: Arm::East,
            error: "timeout".to_string(),
        });
        let json = serde_json::to_string(&fault).unwrap();
        assert!(json.contains("\"east\""));
    }
}
