// fusion.rs: accelerometer + magnetometer to orientation
//
// Pure functions, no scheduling. The magnetometer handler calls `fuse()` with
// the latest raw pair; on degenerate input the previous orientation stands.

use crate::error::{RResult, RecorderError};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

const STANDARD_GRAVITY: f64 = 9.80665;

/// Below 10% of g² the device is considered in free fall and gravity has no direction
const FREE_FALL_GRAVITY_SQUARED: f64 = 0.01 * STANDARD_GRAVITY * STANDARD_GRAVITY;

/// Minimum |E x A|; smaller means gravity and the magnetic field are near-parallel
const MIN_HORIZONTAL_NORM: f64 = 0.1;

/// Device orientation in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    /// Azimuth around -Z, 0 = magnetic north
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Rotation matrix from device to world (East, North, Up) coordinates.
///
/// Rows are the world East, North and Up axes expressed in device coordinates.
pub fn rotation_matrix(gravity: &Vector3<f64>, geomagnetic: &Vector3<f64>) -> RResult<Matrix3<f64>> {
    let norm_sq_a = gravity.norm_squared();
    if norm_sq_a < FREE_FALL_GRAVITY_SQUARED {
        return Err(RecorderError::SensorFusionUnavailable(format!(
            "gravity too weak ({:.3} m/s^2)",
            norm_sq_a.sqrt()
        )));
    }

    let east = geomagnetic.cross(gravity);
    let norm_h = east.norm();
    if norm_h < MIN_HORIZONTAL_NORM {
        return Err(RecorderError::SensorFusionUnavailable(
            "gravity and magnetic field are parallel".to_string(),
        ));
    }

    let east = east / norm_h;
    let up = gravity / norm_sq_a.sqrt();
    let north = up.cross(&east);

    Ok(Matrix3::from_rows(&[
        east.transpose(),
        north.transpose(),
        up.transpose(),
    ]))
}

/// Azimuth/pitch/roll from a rotation matrix built by `rotation_matrix`
pub fn orientation_from_rotation(r: &Matrix3<f64>) -> Orientation {
    Orientation {
        heading: r[(0, 1)].atan2(r[(1, 1)]),
        pitch: (-r[(2, 1)]).clamp(-1.0, 1.0).asin(),
        roll: (-r[(2, 0)]).atan2(r[(2, 2)]),
    }
}

/// Orientation from the latest raw accelerometer/magnetometer pair
pub fn derive_orientation(accel: &Vector3<f64>, mag: &Vector3<f64>) -> RResult<Orientation> {
    let r = rotation_matrix(accel, mag)?;
    Ok(orientation_from_rotation(&r))
}

/// Like `derive_orientation`, but keeps `previous` when the pair is degenerate
pub fn fuse(accel: &Vector3<f64>, mag: &Vector3<f64>, previous: Orientation) -> Orientation {
    match derive_orientation(accel, mag) {
        Ok(orientation) => orientation,
        Err(e) => {
            log::trace!("keeping previous orientation: {}", e);
            previous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_flat_device_pointing_north() {
        // Screen up, top edge towards magnetic north (field dips downward)
        let accel = Vector3::new(0.0, 0.0, 9.81);
        let mag = Vector3::new(0.0, 22.0, -40.0);

        let orientation = derive_orientation(&accel, &mag).unwrap();
        assert_abs_diff_eq!(orientation.heading, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(orientation.pitch, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(orientation.roll, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_flat_device_pointing_east() {
        // Top edge east: north lies along device -X
        let accel = Vector3::new(0.0, 0.0, 9.81);
        let mag = Vector3::new(-22.0, 0.0, -40.0);

        let orientation = derive_orientation(&accel, &mag).unwrap();
        assert_abs_diff_eq!(orientation.heading, FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_matrix_is_orthonormal() {
        let accel = Vector3::new(1.2, -0.4, 9.6);
        let mag = Vector3::new(15.0, 20.0, -35.0);

        let r = rotation_matrix(&accel, &mag).unwrap();
        let identity = r * r.transpose();
        assert_abs_diff_eq!(identity, Matrix3::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_free_fall_is_degenerate() {
        let accel = Vector3::new(0.1, 0.0, 0.2);
        let mag = Vector3::new(0.0, 22.0, -40.0);

        let err = derive_orientation(&accel, &mag).unwrap_err();
        assert!(matches!(err, RecorderError::SensorFusionUnavailable(_)));
    }

    #[test]
    fn test_parallel_vectors_keep_previous() {
        let previous = Orientation {
            heading: 1.25,
            pitch: 0.1,
            roll: -0.2,
        };
        let accel = Vector3::new(0.0, 0.0, 9.81);
        let mag = Vector3::new(0.0, 0.0, 45.0);

        assert_eq!(fuse(&accel, &mag, previous), previous);
    }

    #[test]
    fn test_unit_x_gravity_with_y_field() {
        let accel = Vector3::new(1.0, 0.0, 0.0);
        let mag = Vector3::new(0.0, 1.0, 0.0);

        let orientation = derive_orientation(&accel, &mag).unwrap();
        assert_abs_diff_eq!(orientation.heading, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(orientation.roll, -FRAC_PI_2, epsilon = 1e-9);
    }
}
