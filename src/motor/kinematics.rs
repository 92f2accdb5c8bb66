// Inverse kinematics for the four-arm spherical parallel manipulator
// Converts a plate orientation (azimuth, elevation) into the four servo angles.
//
// All joints sit on a sphere around the ball joint, so every length is an arc.
// Vectors use a right-handed frame: x = north, y = west, z = up.

use thiserror::Error;

use crate::messages::{Arm, Orientation};

/// Base joints sit 60° below the horizon, top joints 20° above it
pub const BASE_INCLINATION_DEG: f64 = -60.0;
pub const TOP_INCLINATION_DEG: f64 = 20.0;

/// Both links of an arm span 60° of arc
pub const PROXIMAL_ARC_DEG: f64 = 60.0;
pub const DISTAL_ARC_DEG: f64 = 60.0;

/// Radius of the joint sphere
pub const SPHERE_RADIUS_MM: f64 = 106.0;

/// Servo angle commanded when the plate is level
pub const SERVO_NEUTRAL_DEG: f64 = 120.0;

/// LX-16A travel
pub const SERVO_MIN_DEG: f64 = 0.0;
pub const SERVO_MAX_DEG: f64 = 240.0;

/// Half of the 80° workspace cone
pub const MAX_TILT_DEG: f64 = 40.0;

/// Link closure tolerance after refinement, radians
pub const CLOSURE_TOLERANCE_RAD: f64 = 1e-6;
const MAX_REFINE_ITERATIONS: usize = 8;

// Slack for floating point noise at the edges of the cone and of the servo travel
const EDGE_SLACK: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkspaceError {
    #[error("orientation is not a finite number")]
    NotFinite,

    #[error("tilt {tilt_deg:.2}° is outside the workspace cone (max {max_deg:.2}°)")]
    OutsideCone { tilt_deg: f64, max_deg: f64 },

    #[error("arm {arm} cannot reach its top joint ({gap_mm:.2} mm short)")]
    Unreachable { arm: Arm, gap_mm: f64 },

    #[error("arm {arm} needs {angle_deg:.2}°, outside servo travel")]
    OutOfTravel { arm: Arm, angle_deg: f64 },

    #[error("arm {arm} did not converge (residual {residual_rad:.2e} rad)")]
    NotConverged { arm: Arm, residual_rad: f64 },

    #[error("no reachable orientation matches the servo angles")]
    NoPoseFound,
}

/// Fixed geometry of one arm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmGeometry {
    pub arm: Arm,
    pub base_bearing_deg: f64,
    pub base_inclination_deg: f64,
    pub top_inclination_deg: f64,
    pub proximal_arc_deg: f64,
    pub distal_arc_deg: f64,
}

impl ArmGeometry {
    pub fn standard(arm: Arm) -> Self {
        Self {
            arm,
            base_bearing_deg: arm.bearing_deg(),
            base_inclination_deg: BASE_INCLINATION_DEG,
            top_inclination_deg: TOP_INCLINATION_DEG,
            proximal_arc_deg: PROXIMAL_ARC_DEG,
            distal_arc_deg: DISTAL_ARC_DEG,
        }
    }

    fn base_joint(&self) -> Vec3 {
        sphere_point(self.base_bearing_deg, self.base_inclination_deg)
    }

    fn neutral_top_joint(&self) -> Vec3 {
        sphere_point(self.base_bearing_deg, self.top_inclination_deg)
    }

    /// Interior angle at the base joint when the plate is level
    fn neutral_interior_angle(&self) -> f64 {
        let arc = (self.top_inclination_deg - self.base_inclination_deg).to_radians();
        interior_angle(
            self.proximal_arc_deg.to_radians(),
            self.distal_arc_deg.to_radians(),
            arc,
        )
        .clamp(-1.0, 1.0)
        .acos()
    }
}

/// Whole-mechanism geometry
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub arms: [ArmGeometry; 4],
    pub radius_mm: f64,
    pub servo_neutral_deg: f64,
    pub servo_min_deg: f64,
    pub servo_max_deg: f64,
    pub max_tilt_deg: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            arms: Arm::ALL.map(ArmGeometry::standard),
            radius_mm: SPHERE_RADIUS_MM,
            servo_neutral_deg: SERVO_NEUTRAL_DEG,
            servo_min_deg: SERVO_MIN_DEG,
            servo_max_deg: SERVO_MAX_DEG,
            max_tilt_deg: MAX_TILT_DEG,
        }
    }
}

/// Servo angles for the four arms, degrees in the servo frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArmAngles {
    pub north: f64, // servo 1
    pub east: f64,  // servo 2
    pub south: f64, // servo 3
    pub west: f64,  // servo 4
}

impl ArmAngles {
    pub fn new(north: f64, east: f64, south: f64, west: f64) -> Self {
        Self {
            north,
            east,
            south,
            west,
        }
    }

    pub fn from_array(angles: [f64; 4]) -> Self {
        Self::new(angles[0], angles[1], angles[2], angles[3])
    }

    /// Returns angles as array [north, east, south, west]
    pub fn as_array(&self) -> [f64; 4] {
        [self.north, self.east, self.south, self.west]
    }

    pub fn get(&self, arm: Arm) -> f64 {
        self.as_array()[arm.index()]
    }
}

/// Elbow configuration of one arm.
///
/// The proximal link leaves the base joint on one side or the other of the arc to the
/// top joint. `Primary` is the near side (bearing d − C), the configuration the arms are
/// assembled in; `Secondary` is the far side (d + C). Both meet at full extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Branch {
    #[default]
    Primary,
    Secondary,
}

/// Servo angles together with the branch each arm was solved on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub angles: ArmAngles,
    pub branches: [Branch; 4],
}

/// Result of forward kinematics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEstimate {
    pub orientation: Orientation,
    /// RMS difference between the given angles and the angles of `orientation`
    pub rms_error_deg: f64,
}

/// Solve servo angles for an orientation with the standard geometry
pub fn solve(orientation: &Orientation) -> Result<ArmAngles, WorkspaceError> {
    Ok(Geometry::default().solve(orientation, None)?.angles)
}

impl Geometry {
    /// Reject orientations outside the workspace cone
    pub fn check_workspace(&self, orientation: &Orientation) -> Result<(), WorkspaceError> {
        if !orientation.is_finite() {
            return Err(WorkspaceError::NotFinite);
        }
        let tilt = orientation.tilt();
        if tilt < -EDGE_SLACK || tilt > self.max_tilt_deg + EDGE_SLACK {
            return Err(WorkspaceError::OutsideCone {
                tilt_deg: tilt,
                max_deg: self.max_tilt_deg,
            });
        }
        Ok(())
    }

    /// Solve the four servo angles for `orientation`.
    ///
    /// `branches` holds the branch each arm is tracking. An arm never switches branch:
    /// when its tracked branch falls outside servo travel the solve fails. Without it
    /// each arm takes the primary branch, or the secondary when only that one is in travel.
    pub fn solve(
        &self,
        orientation: &Orientation,
        branches: Option<&[Branch; 4]>,
    ) -> Result<Solution, WorkspaceError> {
        self.check_workspace(orientation)?;

        let normal = plate_normal(orientation);
        let mut angles = [0.0; 4];
        let mut chosen = [Branch::Primary; 4];
        for (i, arm) in self.arms.iter().enumerate() {
            let tracked = branches.map(|b| b[i]);
            (angles[i], chosen[i]) = self.solve_arm(arm, &normal, tracked)?;
        }
        Ok(Solution {
            angles: ArmAngles::from_array(angles),
            branches: chosen,
        })
    }

    fn solve_arm(
        &self,
        arm: &ArmGeometry,
        normal: &Vec3,
        tracked: Option<Branch>,
    ) -> Result<(f64, Branch), WorkspaceError> {
        let proximal = arm.proximal_arc_deg.to_radians();
        let distal = arm.distal_arc_deg.to_radians();

        let base = arm.base_joint();
        let top = tilt_toward(&arm.neutral_top_joint(), normal);
        let arc = angle_between(&base, &top);

        let cos_c = interior_angle(proximal, distal, arc);
        if !cos_c.is_finite() || cos_c.abs() > 1.0 + EDGE_SLACK {
            return Err(WorkspaceError::Unreachable {
                arm: arm.arm,
                gap_mm: (arc - (proximal + distal)).abs() * self.radius_mm,
            });
        }
        let c = cos_c.clamp(-1.0, 1.0).acos();
        let d = local_bearing(&base, &top);

        let order = match tracked {
            Some(branch) => vec![branch],
            None => vec![Branch::Primary, Branch::Secondary],
        };

        let offset = self.servo_neutral_deg + arm.neutral_interior_angle().to_degrees();
        let mut best_residual = f64::INFINITY;
        let mut first_angle = None;
        for branch in order {
            let guess = match branch {
                Branch::Primary => d - c,
                Branch::Secondary => d + c,
            };
            let (phi, residual) = refine(&base, &top, proximal, distal, guess);
            best_residual = best_residual.min(residual);
            if residual > CLOSURE_TOLERANCE_RAD {
                continue;
            }
            let angle = offset + wrap_pi(phi).to_degrees();
            if angle >= self.servo_min_deg - EDGE_SLACK && angle <= self.servo_max_deg + EDGE_SLACK {
                return Ok((angle, branch));
            }
            first_angle.get_or_insert(angle);
        }

        match first_angle {
            Some(angle_deg) => Err(WorkspaceError::OutOfTravel {
                arm: arm.arm,
                angle_deg,
            }),
            None => Err(WorkspaceError::NotConverged {
                arm: arm.arm,
                residual_rad: best_residual,
            }),
        }
    }

    /// Forward kinematics: the orientation whose solution best matches `angles`
    pub fn forward(&self, angles: &ArmAngles) -> Result<PoseEstimate, WorkspaceError> {
        // Search in tilt-vector coordinates, which stay regular at the vertical
        let cost = |tx: f64, ty: f64| -> Option<f64> {
            if tx.hypot(ty) > self.max_tilt_deg {
                return None;
            }
            let solved = self.solve(&from_tilt_vector(tx, ty), None).ok()?;
            Some(
                solved
                    .angles
                    .as_array()
                    .iter()
                    .zip(angles.as_array())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum(),
            )
        };

        // Coarse grid, 2° spacing
        let steps = (self.max_tilt_deg / 2.0).ceil() as i32;
        let mut best: Option<(f64, f64, f64)> = None;
        for i in -steps..=steps {
            for j in -steps..=steps {
                let (tx, ty) = (i as f64 * 2.0, j as f64 * 2.0);
                if let Some(c) = cost(tx, ty) {
                    if best.is_none_or(|(b, _, _)| c < b) {
                        best = Some((c, tx, ty));
                    }
                }
            }
        }
        let (mut c, mut tx, mut ty) = best.ok_or(WorkspaceError::NoPoseFound)?;

        // Shrinking pattern search
        let mut step = 1.0;
        let mut iterations = 0;
        while step > 1e-10 && iterations < 4000 {
            iterations += 1;
            let mut moved = false;
            for (dx, dy) in [(step, 0.0), (-step, 0.0), (0.0, step), (0.0, -step)] {
                if let Some(nc) = cost(tx + dx, ty + dy) {
                    if nc < c {
                        c = nc;
                        tx += dx;
                        ty += dy;
                        moved = true;
                        break;
                    }
                }
            }
            if !moved {
                step /= 2.0;
            }
        }

        Ok(PoseEstimate {
            orientation: from_tilt_vector(tx, ty),
            rms_error_deg: (c / 4.0).sqrt(),
        })
    }
}

/// Unit normal of the top plate
pub fn plate_normal(orientation: &Orientation) -> Vec3 {
    sphere_point(orientation.azimuth, orientation.elevation)
}

/// Orientation for a tilt vector (north, east components of the lean, degrees)
fn from_tilt_vector(tx: f64, ty: f64) -> Orientation {
    let tilt = tx.hypot(ty);
    let azimuth = if tilt == 0.0 {
        0.0
    } else {
        ty.atan2(tx).to_degrees()
    };
    Orientation::new(azimuth, 90.0 - tilt)
}

// Newton refinement of the proximal link bearing so the distal link closes exactly.
// Returns the refined bearing and the remaining residual.
fn refine(base: &Vec3, top: &Vec3, proximal: f64, distal: f64, mut phi: f64) -> (f64, f64) {
    let (north, east) = local_frame(base);
    let residual = |phi: f64| {
        let dir = add(&scale(&north, phi.cos()), &scale(&east, phi.sin()));
        let elbow = add(&scale(base, proximal.cos()), &scale(&dir, proximal.sin()));
        angle_between(&elbow, top) - distal
    };

    let h = 1e-7;
    let mut r = residual(phi);
    for _ in 0..MAX_REFINE_ITERATIONS {
        if r.abs() <= CLOSURE_TOLERANCE_RAD * 1e-3 {
            break;
        }
        let slope = (residual(phi + h) - residual(phi - h)) / (2.0 * h);
        if slope.abs() < 1e-12 {
            break;
        }
        phi -= r / slope;
        r = residual(phi);
    }
    (phi, r.abs())
}

// Spherical law of cosines: cosine of the angle at the base between the proximal link
// and the arc to the top joint
fn interior_angle(proximal: f64, distal: f64, arc: f64) -> f64 {
    (distal.cos() - proximal.cos() * arc.cos()) / (proximal.sin() * arc.sin())
}

fn wrap_pi(angle: f64) -> f64 {
    let wrapped = (angle + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI);
    wrapped - std::f64::consts::PI
}

pub type Vec3 = [f64; 3];

fn sphere_point(bearing_deg: f64, elevation_deg: f64) -> Vec3 {
    let (b, e) = (bearing_deg.to_radians(), elevation_deg.to_radians());
    [e.cos() * b.cos(), -e.cos() * b.sin(), e.sin()]
}

fn dot(a: &Vec3, b: &Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &Vec3, b: &Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn scale(a: &Vec3, k: f64) -> Vec3 {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn normalize(a: &Vec3) -> Vec3 {
    scale(a, 1.0 / dot(a, a).sqrt())
}

fn angle_between(a: &Vec3, b: &Vec3) -> f64 {
    (dot(a, b) / (dot(a, a) * dot(b, b)).sqrt())
        .clamp(-1.0, 1.0)
        .acos()
}

// Local (north, east) tangent directions at a point that is not vertical
fn local_frame(p: &Vec3) -> (Vec3, Vec3) {
    let east = normalize(&cross(p, &[0.0, 0.0, 1.0]));
    let north = normalize(&cross(&east, p));
    (north, east)
}

// Bearing of the great circle from `from` toward `to`, in the local frame of `from`
fn local_bearing(from: &Vec3, to: &Vec3) -> f64 {
    let (north, east) = local_frame(from);
    let along = sub(to, &scale(from, dot(from, to)));
    dot(&along, &east).atan2(dot(&along, &north))
}

fn sub(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

// Rotate `p` by the rotation that carries vertical onto `normal`
fn tilt_toward(p: &Vec3, normal: &Vec3) -> Vec3 {
    let up = [0.0, 0.0, 1.0];
    let axis = cross(&up, normal);
    let sin_t = dot(&axis, &axis).sqrt();
    if sin_t < 1e-15 {
        return *p;
    }
    let k = scale(&axis, 1.0 / sin_t);
    let cos_t = dot(&up, normal);
    // Rodrigues' rotation formula
    add(
        &add(&scale(p, cos_t), &scale(&cross(&k, p), sin_t)),
        &scale(&k, dot(&k, p) * (1.0 - cos_t)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separation_deg(a: &Orientation, b: &Orientation) -> f64 {
        angle_between(&plate_normal(a), &plate_normal(b)).to_degrees()
    }

    #[test]
    fn test_level_plate_is_servo_neutral() {
        let angles = solve(&Orientation::NEUTRAL).unwrap();
        for a in angles.as_array() {
            assert!((a - SERVO_NEUTRAL_DEG).abs() < 1e-9, "got {}", a);
        }
    }

    #[test]
    fn test_full_tilt_extends_opposite_arm() {
        // Leaning toward the south stretches the north arm straight
        let angles = solve(&Orientation::new(180.0, 50.0)).unwrap();
        let neutral_angle = ArmGeometry::standard(Arm::North).neutral_interior_angle();
        let extended = SERVO_NEUTRAL_DEG + neutral_angle.to_degrees();
        assert!((angles.north - extended).abs() < 1e-6);
        assert!((extended - 181.02).abs() < 0.01);
    }

    #[test]
    fn test_symmetry_between_arms() {
        // Rotating the request by 90° permutes the arms
        let a = solve(&Orientation::new(30.0, 65.0)).unwrap();
        let b = solve(&Orientation::new(120.0, 65.0)).unwrap();
        assert!((a.north - b.east).abs() < 1e-6);
        assert!((a.east - b.south).abs() < 1e-6);
        assert!((a.south - b.west).abs() < 1e-6);
        assert!((a.west - b.north).abs() < 1e-6);
    }

    #[test]
    fn test_inside_cone_within_travel_and_round_trips() {
        let geometry = Geometry::default();
        for el in [50.5, 55.0, 63.0, 72.0, 81.0, 89.5, 90.0] {
            for az in (0..360).step_by(30) {
                let o = Orientation::new(az as f64 + 7.0, el);
                let angles = geometry.solve(&o, None).unwrap().angles;
                for a in angles.as_array() {
                    assert!((SERVO_MIN_DEG..=SERVO_MAX_DEG).contains(&a), "{} -> {}", o, a);
                }
                let estimate = geometry.forward(&angles).unwrap();
                assert!(estimate.rms_error_deg < 1e-5, "{}: rms {}", o, estimate.rms_error_deg);
                assert!(
                    separation_deg(&o, &estimate.orientation) < 1e-4,
                    "{} came back as {}",
                    o,
                    estimate.orientation
                );
            }
        }
    }

    #[test]
    fn test_outside_cone_is_rejected() {
        for (az, el) in [(0.0, 49.9), (90.0, 30.0), (200.0, 0.0), (10.0, -20.0), (0.0, 95.0)] {
            let result = solve(&Orientation::new(az, el));
            assert!(
                matches!(result, Err(WorkspaceError::OutsideCone { .. })),
                "az={} el={} gave {:?}",
                az,
                el,
                result
            );
        }
    }

    #[test]
    fn test_not_finite_is_rejected() {
        let o = Orientation {
            azimuth: f64::NAN,
            elevation: 60.0,
        };
        assert_eq!(solve(&o), Err(WorkspaceError::NotFinite));
    }

    #[test]
    fn test_cone_edge_is_accepted() {
        for az in (0..360).step_by(15) {
            assert!(solve(&Orientation::new(az as f64, 50.0)).is_ok(), "az={}", az);
        }
    }

    #[test]
    fn test_untracked_solve_takes_primary_branch() {
        let geometry = Geometry::default();
        for o in [Orientation::NEUTRAL, Orientation::new(180.0, 50.0), Orientation::new(200.0, 55.0)] {
            let solution = geometry.solve(&o, None).unwrap();
            assert_eq!(solution.branches, [Branch::Primary; 4], "{}", o);
        }
    }

    #[test]
    fn test_tracked_branch_is_kept_through_full_extension() {
        let geometry = Geometry::default();
        // Lean south across the cone edge: the north arm reaches full extension and
        // comes back, staying on the branch it started on
        let mut branches = [Branch::Primary; 4];
        let mut previous = geometry.solve(&Orientation::new(180.0, 60.0), None).unwrap().angles;
        for el in [55.0, 52.0, 50.5, 50.0, 50.5, 52.0, 55.0, 60.0] {
            let solution = geometry.solve(&Orientation::new(180.0, el), Some(&branches)).unwrap();
            assert_eq!(solution.branches, branches);
            assert!(solution.angles.north <= 181.03, "el {}: {}", el, solution.angles.north);
            assert!((solution.angles.north - previous.north).abs() < 15.0);
            previous = solution.angles;
            branches = solution.branches;
        }
    }

    #[test]
    fn test_secondary_branch_out_of_travel_fails_instead_of_switching() {
        let geometry = Geometry::default();
        let tracked = [Branch::Secondary, Branch::Primary, Branch::Primary, Branch::Primary];

        // Near full extension the elbow-up north arm is inside travel
        let near = geometry.solve(&Orientation::new(180.0, 55.0), Some(&tracked)).unwrap();
        let primary = geometry.solve(&Orientation::new(180.0, 55.0), None).unwrap();
        assert!(near.angles.north > primary.angles.north + 10.0);
        assert!(near.angles.north <= SERVO_MAX_DEG);
        assert_eq!(near.angles.east, primary.angles.east);

        // Back at level it would need about 242°
        let result = geometry.solve(&Orientation::NEUTRAL, Some(&tracked));
        assert!(matches!(
            result,
            Err(WorkspaceError::OutOfTravel { arm: Arm::North, angle_deg }) if angle_deg > SERVO_MAX_DEG
        ));
    }

    #[test]
    fn test_narrow_travel_is_out_of_travel() {
        let geometry = Geometry {
            servo_max_deg: 150.0,
            ..Geometry::default()
        };
        let result = geometry.solve(&Orientation::new(180.0, 50.0), None);
        assert!(matches!(
            result,
            Err(WorkspaceError::OutOfTravel { arm: Arm::North, .. })
        ));
    }

    #[test]
    fn test_short_links_are_unreachable() {
        let mut geometry = Geometry::default();
        for arm in geometry.arms.iter_mut() {
            arm.proximal_arc_deg = 35.0;
            arm.distal_arc_deg = 35.0;
        }
        let result = geometry.solve(&Orientation::NEUTRAL, None);
        assert!(matches!(result, Err(WorkspaceError::Unreachable { .. })));
    }
}
