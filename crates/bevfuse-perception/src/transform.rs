//! Rigid-body geometry for poses, calibrations and cross-frame alignment.
//!
//! Provides the small set of primitives every other module builds on:
//! [`Vec3`], unit [`Quaternion`]s, row-major [`Mat3`] matrices, validated
//! [`Pose`]s and the [`RigidTransform`] algebra used to relate them.
//!
//! # Example
//!
//! ```rust
//! use bevfuse_perception::transform::{Pose, Quaternion, RigidTransform, Vec3};
//!
//! // Ego vehicle 10 m ahead of the global origin, no rotation.
//! let pose = Pose::try_new(Quaternion::identity(), Vec3::new(10.0, 0.0, 0.0)).unwrap();
//!
//! // A point 1 m ahead of the vehicle sits at x = 11 in the global frame.
//! let p = pose.as_transform().transform_point(Vec3::new(1.0, 0.0, 0.0));
//! assert!((p.x - 11.0).abs() < 1e-5);
//!
//! let back = pose.as_transform().compose(pose.as_transform().inverse());
//! assert!(back.translation.norm() < 1e-5);
//! # let _ = RigidTransform::identity();
//! ```

use bevfuse_types::BevError;

/// Quaternions with a norm below this are rejected as degenerate.
pub const MIN_QUATERNION_NORM: f32 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn from_array(a: [f32; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn norm(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A quaternion in (w, x, y, z) convention.
///
/// Rotations are only meaningful for unit quaternions; use
/// [`Quaternion::try_normalized`] on anything that comes from outside the
/// process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// Create a quaternion without normalising it.
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `angle` radians around +Z.
    pub fn from_yaw(angle: f32) -> Self {
        let (s, c) = (angle * 0.5).sin_cos();
        Self::new(c, 0.0, 0.0, s)
    }

    /// Build from a `[w, x, y, z]` array.
    pub fn from_array(a: [f32; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }

    pub fn norm(self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Return the unit quaternion pointing in the same direction.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::MalformedPose`] when the norm is below
    /// [`MIN_QUATERNION_NORM`] or any component is not finite.  A degenerate
    /// quaternion is never coerced to the identity.
    pub fn try_normalized(self) -> Result<Self, BevError> {
        let n = self.norm();
        if !n.is_finite() {
            return Err(BevError::MalformedPose(format!(
                "quaternion has non-finite components: {self:?}"
            )));
        }
        if n < MIN_QUATERNION_NORM {
            return Err(BevError::MalformedPose(format!(
                "quaternion norm {n} is below {MIN_QUATERNION_NORM}"
            )));
        }
        Ok(Self::new(self.w / n, self.x / n, self.y / n, self.z / n))
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }

    /// Equivalent row-major rotation matrix.
    pub fn to_matrix(self) -> Mat3 {
        let Self { w, x, y, z } = self;
        Mat3::new([
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ])
    }
}

/// A row-major 3×3 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3 {
    pub m: [[f32; 3]; 3],
}

impl Mat3 {
    pub fn new(m: [[f32; 3]; 3]) -> Self {
        Self { m }
    }

    pub fn identity() -> Self {
        Self::new([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    pub fn diag(a: f32, b: f32, c: f32) -> Self {
        Self::new([[a, 0.0, 0.0], [0.0, b, 0.0], [0.0, 0.0, c]])
    }

    pub fn mul(&self, rhs: &Self) -> Self {
        let mut out = [[0.0f32; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[i][k] * rhs.m[k][j]).sum();
            }
        }
        Self::new(out)
    }

    pub fn mul_vec(&self, v: Vec3) -> Vec3 {
        let r = |i: usize| self.m[i][0] * v.x + self.m[i][1] * v.y + self.m[i][2] * v.z;
        Vec3::new(r(0), r(1), r(2))
    }

    pub fn determinant(&self) -> f32 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Inverse via the adjugate.  Returns `None` for (near-)singular input.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < f32::EPSILON || !det.is_finite() {
            return None;
        }
        let m = &self.m;
        let inv_det = 1.0 / det;
        let cof = |r0: usize, r1: usize, c0: usize, c1: usize| {
            m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]
        };
        Some(Self::new([
            [
                cof(1, 2, 1, 2) * inv_det,
                -cof(0, 2, 1, 2) * inv_det,
                cof(0, 1, 1, 2) * inv_det,
            ],
            [
                -cof(1, 2, 0, 2) * inv_det,
                cof(0, 2, 0, 2) * inv_det,
                -cof(0, 1, 0, 2) * inv_det,
            ],
            [
                cof(1, 2, 0, 1) * inv_det,
                -cof(0, 2, 0, 1) * inv_det,
                cof(0, 1, 0, 1) * inv_det,
            ],
        ]))
    }

    /// Flatten row by row.
    pub fn to_row_major(&self) -> [f32; 9] {
        let m = &self.m;
        [
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        ]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RigidTransform
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// Maps a point expressed in frame B into frame A: rotate it by `rotation`,
/// then add `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl RigidTransform {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Compose two transforms: if `self` = T_A_B and `other` = T_B_C, the
    /// result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// The inverse transform (T_B_A for `self` = T_A_B).
    pub fn inverse(self) -> Self {
        let inv_rot = self.rotation.conjugate();
        Self::new(inv_rot.rotate(self.translation).scale(-1.0), inv_rot)
    }

    pub fn transform_point(self, p: Vec3) -> Vec3 {
        self.rotation.rotate(p).add(self.translation)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A validated 6-DoF pose (e.g. ego → global, camera → ego).
///
/// The rotation is always a unit quaternion; construct through
/// [`Pose::try_new`] or [`Pose::from_raw`] which renormalise and reject
/// degenerate input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    rotation: Quaternion,
    translation: Vec3,
}

impl Pose {
    /// Build a pose, renormalising `rotation`.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::MalformedPose`] for a degenerate quaternion or a
    /// non-finite translation.
    pub fn try_new(rotation: Quaternion, translation: Vec3) -> Result<Self, BevError> {
        if !translation.is_finite() {
            return Err(BevError::MalformedPose(format!(
                "translation has non-finite components: {translation:?}"
            )));
        }
        Ok(Self {
            rotation: rotation.try_normalized()?,
            translation,
        })
    }

    /// Build from `[w, x, y, z]` and `[x, y, z]` arrays as found in
    /// calibration files.
    pub fn from_raw(rotation: [f32; 4], translation: [f32; 3]) -> Result<Self, BevError> {
        Self::try_new(Quaternion::from_array(rotation), Vec3::from_array(translation))
    }

    pub fn identity() -> Self {
        Self {
            rotation: Quaternion::identity(),
            translation: Vec3::zero(),
        }
    }

    pub fn rotation(&self) -> Quaternion {
        self.rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn as_transform(&self) -> RigidTransform {
        RigidTransform::new(self.translation, self.rotation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    // ── Quaternion ──────────────────────────────────────────────────────────

    #[test]
    fn quaternion_identity_rotate_is_noop() {
        let r = Quaternion::identity().rotate(Vec3::new(1.0, 2.0, 3.0));
        assert!(approx(r.x, 1.0) && approx(r.y, 2.0) && approx(r.z, 3.0));
    }

    #[test]
    fn quaternion_90deg_yaw_rotates_x_to_y() {
        let q = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let r = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert!(r.x.abs() < 1e-5, "x should be ~0, got {}", r.x);
        assert!(approx(r.y, 1.0), "y should be ~1, got {}", r.y);
    }

    #[test]
    fn from_yaw_matches_explicit_quaternion() {
        let q = Quaternion::from_yaw(FRAC_PI_2);
        assert!(approx(q.w, FRAC_1_SQRT_2));
        assert!(approx(q.z, FRAC_1_SQRT_2));
    }

    #[test]
    fn try_normalized_rescales_to_unit() {
        let q = Quaternion::new(2.0, 0.0, 0.0, 0.0).try_normalized().unwrap();
        assert!(approx(q.norm(), 1.0));
        assert!(approx(q.w, 1.0));
    }

    #[test]
    fn try_normalized_rejects_zero_quaternion() {
        let err = Quaternion::new(0.0, 0.0, 0.0, 0.0).try_normalized().unwrap_err();
        assert!(matches!(err, BevError::MalformedPose(_)));
    }

    #[test]
    fn try_normalized_rejects_nan() {
        let q = Quaternion::new(f32::NAN, 0.0, 0.0, 1.0);
        assert!(q.try_normalized().is_err());
    }

    #[test]
    fn matrix_agrees_with_quaternion_rotation() {
        let q = Quaternion::new(0.9, 0.1, -0.3, 0.2).try_normalized().unwrap();
        let v = Vec3::new(0.4, -1.2, 2.5);
        let a = q.rotate(v);
        let b = q.to_matrix().mul_vec(v);
        assert!(approx(a.x, b.x) && approx(a.y, b.y) && approx(a.z, b.z));
    }

    // ── Mat3 ────────────────────────────────────────────────────────────────

    #[test]
    fn mat3_inverse_of_intrinsics() {
        let k = Mat3::new([[800.0, 0.0, 320.0], [0.0, 800.0, 240.0], [0.0, 0.0, 1.0]]);
        let prod = k.mul(&k.inverse().unwrap());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((prod.m[i][j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn mat3_singular_has_no_inverse() {
        let m = Mat3::new([[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]);
        assert!(m.inverse().is_none());
    }

    // ── RigidTransform ──────────────────────────────────────────────────────

    #[test]
    fn transform_compose_with_inverse_is_identity() {
        let t = RigidTransform::new(Vec3::new(3.0, -1.0, 0.5), Quaternion::from_yaw(0.7));
        let id = t.compose(t.inverse());
        assert!(id.translation.norm() < 1e-5);
        assert!(approx(id.rotation.w.abs(), 1.0));
    }

    #[test]
    fn transform_respects_rotation_then_translation() {
        let t = RigidTransform::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::from_yaw(FRAC_PI_2));
        let p = t.transform_point(Vec3::new(1.0, 0.0, 0.0));
        assert!(approx(p.x, 1.0), "x={}", p.x);
        assert!(approx(p.y, 1.0), "y={}", p.y);
    }

    // ── Pose ────────────────────────────────────────────────────────────────

    #[test]
    fn pose_from_raw_renormalizes() {
        let p = Pose::from_raw([0.0, 0.0, 0.0, 3.0], [1.0, 2.0, 3.0]).unwrap();
        assert!(approx(p.rotation().norm(), 1.0));
        assert!(approx(p.rotation().z, 1.0));
    }

    #[test]
    fn pose_rejects_degenerate_rotation() {
        assert!(Pose::from_raw([0.0; 4], [0.0; 3]).is_err());
    }

    #[test]
    fn pose_rejects_infinite_translation() {
        let err = Pose::from_raw([1.0, 0.0, 0.0, 0.0], [f32::INFINITY, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, BevError::MalformedPose(_)));
    }
}
