//! SE(3) rigid-body transformations for pose-graph optimization.
//!
//! Minimal Lie-group machinery specialized to the one manifold the mapping
//! backend optimizes over. Tangent vectors are ordered `[rho, theta]`
//! (translation part first, rotation part second), and perturbations are
//! applied on the right: `T' = T * Exp(xi)`.

use nalgebra::{Isometry3, Matrix3, Matrix4, Matrix6, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Rigid-body transformation in 3D: rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    rotation: UnitQuaternion<f64>,
    translation: Vector3<f64>,
}

/// Skew-symmetric (hat) matrix of a 3-vector.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) exponential map (rotation vector to quaternion).
fn so3_exp(theta: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*theta)
}

/// SO(3) logarithm map (quaternion to rotation vector).
fn so3_log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Left Jacobian of SO(3), used to map the translational tangent component
/// through the rotational one in the SE(3) exponential.
fn so3_left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle = theta.norm();
    let hat = skew(theta);
    if angle < 1e-9 {
        return Matrix3::identity() + 0.5 * hat;
    }
    let a2 = angle * angle;
    Matrix3::identity() + ((1.0 - angle.cos()) / a2) * hat
        + ((angle - angle.sin()) / (a2 * angle)) * hat * hat
}

fn so3_left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
    let angle = theta.norm();
    let hat = skew(theta);
    if angle < 1e-9 {
        return Matrix3::identity() - 0.5 * hat;
    }
    let half = 0.5 * angle;
    let cot = half.cos() / half.sin();
    Matrix3::identity() - 0.5 * hat + ((1.0 - half * cot) / (angle * angle)) * hat * hat
}

impl SE3 {
    /// The identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create from a rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Create from a translation with identity orientation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self::new(UnitQuaternion::identity(), translation)
    }

    /// Create from an isometry.
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            rotation: iso.rotation,
            translation: iso.translation.vector,
        }
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    /// Homogeneous 4x4 matrix representation.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Group inverse.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Group composition: `self * other`.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Relative transformation from `self` to `other`: `self^-1 * other`.
    pub fn delta_to(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }

    /// Transform a point into the frame this pose maps into.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map from the tangent space, `xi = [rho, theta]`.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let rho = Vector3::new(xi[0], xi[1], xi[2]);
        let theta = Vector3::new(xi[3], xi[4], xi[5]);
        Self {
            rotation: so3_exp(&theta),
            translation: so3_left_jacobian(&theta) * rho,
        }
    }

    /// Logarithm map into the tangent space, `xi = [rho, theta]`.
    pub fn log(&self) -> Vector6<f64> {
        let theta = so3_log(&self.rotation);
        let rho = so3_left_jacobian_inv(&theta) * self.translation;
        Vector6::new(rho.x, rho.y, rho.z, theta.x, theta.y, theta.z)
    }

    /// Right-perturbed retraction: `self * Exp(xi)`.
    pub fn retract(&self, xi: &Vector6<f64>) -> Self {
        self.compose(&Self::exp(xi))
    }

    /// Adjoint matrix mapping tangent vectors between frames:
    /// `Exp(Adj(T) xi) * T = T * Exp(xi)`.
    pub fn adjoint(&self) -> Matrix6<f64> {
        let r = self.rotation_matrix();
        let tr = skew(&self.translation) * r;
        let mut adj = Matrix6::zeros();
        adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        adj.fixed_view_mut::<3, 3>(0, 3).copy_from(&tr);
        adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        adj
    }

    /// First-order inverse of the right Jacobian at `xi`.
    ///
    /// Sufficient for the near-converged residuals the smoother linearizes
    /// around; the second-order term is negligible there.
    pub fn right_jacobian_inv(xi: &Vector6<f64>) -> Matrix6<f64> {
        let rho = Vector3::new(xi[0], xi[1], xi[2]);
        let theta = Vector3::new(xi[3], xi[4], xi[5]);
        let mut ad = Matrix6::zeros();
        let theta_hat = skew(&theta);
        ad.fixed_view_mut::<3, 3>(0, 0).copy_from(&theta_hat);
        ad.fixed_view_mut::<3, 3>(0, 3).copy_from(&skew(&rho));
        ad.fixed_view_mut::<3, 3>(3, 3).copy_from(&theta_hat);
        Matrix6::identity() + 0.5 * ad
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Display for SE3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.translation;
        let q = self.rotation;
        write!(
            f,
            "t: [{:.4}, {:.4}, {:.4}], q: [{:.4}, {:.4}, {:.4}, {:.4}]",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}
