//! IMU sample buffering and preintegration between submap endpoints.
//!
//! The integrator owns a time-ordered buffer of `(stamp, accel, gyro)`
//! samples. [`ImuIntegration::integrate`] summarizes the samples spanning an
//! interval into a single preintegrated measurement; consumed samples are
//! erased through the returned cursor so the buffer stays bounded.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::se3::skew;

/// Standard gravity along -Z in the world frame.
pub const GRAVITY: f64 = 9.80665;

/// Accelerometer + gyroscope bias.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Stack as `[accel, gyro]` for tangent-space arithmetic.
    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.accel.x, self.accel.y, self.accel.z, self.gyro.x, self.gyro.y, self.gyro.z,
        )
    }

    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self {
            accel: Vector3::new(v[0], v[1], v[2]),
            gyro: Vector3::new(v[3], v[4], v[5]),
        }
    }
}

/// Continuous-time IMU white-noise densities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuNoise {
    pub sigma_accel: f64,
    pub sigma_gyro: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            sigma_accel: 0.05,
            sigma_gyro: 0.005,
        }
    }
}

/// A single raw IMU measurement.
#[derive(Debug, Clone, Copy)]
struct ImuSample {
    stamp: f64,
    accel: Vector3<f64>,
    gyro: Vector3<f64>,
}

/// Preintegrated IMU measurement over `[t_l, t_r]`.
///
/// Deltas are expressed in the body frame at `t_l` and carry first-order
/// bias-correction Jacobians around `bias_hat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreintegratedImu {
    pub delta_t: f64,
    pub delta_r: UnitQuaternion<f64>,
    pub delta_v: Vector3<f64>,
    pub delta_p: Vector3<f64>,

    pub dr_dbg: Matrix3<f64>,
    pub dv_dba: Matrix3<f64>,
    pub dv_dbg: Matrix3<f64>,
    pub dp_dba: Matrix3<f64>,
    pub dp_dbg: Matrix3<f64>,

    pub bias_hat: ImuBias,

    /// Accumulated per-block white-noise variances (rotation, velocity, position).
    pub var_r: f64,
    pub var_v: f64,
    pub var_p: f64,
}

impl PreintegratedImu {
    fn identity(bias_hat: ImuBias) -> Self {
        Self {
            delta_t: 0.0,
            delta_r: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            dr_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dp_dba: Matrix3::zeros(),
            dp_dbg: Matrix3::zeros(),
            bias_hat,
            var_r: 1e-8,
            var_v: 1e-8,
            var_p: 1e-8,
        }
    }

    /// One midpoint integration step.
    fn integrate_step(
        &mut self,
        dt: f64,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        noise: &ImuNoise,
    ) {
        let a = accel - self.bias_hat.accel;
        let w = gyro - self.bias_hat.gyro;

        let r = self.delta_r.to_rotation_matrix().into_inner();
        let a_skew = skew(&a);

        // Bias-correction Jacobians (first order)
        self.dp_dba += self.dv_dba * dt - 0.5 * r * dt * dt;
        self.dp_dbg += self.dv_dbg * dt - 0.5 * r * a_skew * self.dr_dbg * dt * dt;
        self.dv_dba -= r * dt;
        self.dv_dbg -= r * a_skew * self.dr_dbg * dt;

        let incr = UnitQuaternion::from_scaled_axis(w * dt);
        let incr_r = incr.to_rotation_matrix().into_inner();
        let jr = so3_right_jacobian(&(w * dt));
        self.dr_dbg = incr_r.transpose() * self.dr_dbg - jr * dt;

        // Delta propagation
        self.delta_p += self.delta_v * dt + 0.5 * (r * a) * dt * dt;
        self.delta_v += r * a * dt;
        self.delta_r *= incr;
        self.delta_t += dt;

        // White-noise accumulation (per-axis variances)
        self.var_r += noise.sigma_gyro * noise.sigma_gyro * dt;
        self.var_v += noise.sigma_accel * noise.sigma_accel * dt;
        self.var_p += self.var_v * dt * dt;
    }

    /// Deltas corrected for a bias estimate that drifted from `bias_hat`.
    pub fn corrected(&self, bias: &ImuBias) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dba = bias.accel - self.bias_hat.accel;
        let dbg = bias.gyro - self.bias_hat.gyro;

        let delta_r = self.delta_r * UnitQuaternion::from_scaled_axis(self.dr_dbg * dbg);
        let delta_v = self.delta_v + self.dv_dba * dba + self.dv_dbg * dbg;
        let delta_p = self.delta_p + self.dp_dba * dba + self.dp_dbg * dbg;
        (delta_r, delta_v, delta_p)
    }
}

/// Right Jacobian of SO(3).
fn so3_right_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle = theta.norm();
    let hat = skew(theta);
    if angle < 1e-9 {
        return Matrix3::identity() - 0.5 * hat;
    }
    let a2 = angle * angle;
    Matrix3::identity() - ((1.0 - angle.cos()) / a2) * hat
        + ((angle - angle.sin()) / (a2 * angle)) * hat * hat
}

/// Time-ordered IMU sample buffer with interval preintegration.
#[derive(Debug, Default)]
pub struct ImuIntegration {
    samples: Vec<ImuSample>,
    noise: ImuNoise,
}

impl ImuIntegration {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            noise: ImuNoise::default(),
        }
    }

    pub fn with_noise(noise: ImuNoise) -> Self {
        Self {
            samples: Vec::new(),
            noise,
        }
    }

    /// Append a sample. Stamps must be monotonically increasing;
    /// out-of-order samples are dropped, not reordered.
    pub fn insert_imu(&mut self, stamp: f64, accel: Vector3<f64>, gyro: Vector3<f64>) {
        if let Some(last) = self.samples.last() {
            if stamp < last.stamp {
                warn!(stamp, last = last.stamp, "dropping out-of-order IMU sample");
                return;
            }
        }
        self.samples.push(ImuSample { stamp, accel, gyro });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Preintegrate the samples spanning `[t_l, t_r]` around `bias`.
    ///
    /// Returns the preintegrated measurement, the number of samples that
    /// contributed, and the erase cursor to pass to [`Self::erase_until`].
    /// Fewer than 2 contributing samples means the measurement is unusable
    /// and the caller should fall back to a zero-velocity constraint.
    pub fn integrate(&self, t_l: f64, t_r: f64, bias: ImuBias) -> (PreintegratedImu, usize, usize) {
        let mut preint = PreintegratedImu::identity(bias);

        let in_range: Vec<&ImuSample> = self
            .samples
            .iter()
            .filter(|s| s.stamp >= t_l && s.stamp <= t_r)
            .collect();

        for pair in in_range.windows(2) {
            let dt = pair[1].stamp - pair[0].stamp;
            if dt <= 0.0 {
                continue;
            }
            let accel = 0.5 * (pair[0].accel + pair[1].accel);
            let gyro = 0.5 * (pair[0].gyro + pair[1].gyro);
            preint.integrate_step(dt, accel, gyro, &self.noise);
        }

        // Keep the boundary sample so the next interval can start from it.
        let cursor = self
            .samples
            .partition_point(|s| s.stamp <= t_r)
            .saturating_sub(1);

        (preint, in_range.len(), cursor)
    }

    /// Erase samples before the consumed cursor.
    pub fn erase_until(&mut self, cursor: usize) {
        let cursor = cursor.min(self.samples.len());
        self.samples.drain(..cursor);
    }
}
