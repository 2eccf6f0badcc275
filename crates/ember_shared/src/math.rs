//! Mathematical types shared by the world core and its consumers.
//!
//! Vector and rotation types come straight from `glam`; the only type defined
//! here is [`Transform`], the decomposed position/rotation/scale used for both
//! local and world space.

use serde::{Deserialize, Serialize};

pub use glam::{Mat4, Quat, Vec3};

/// Transform - position + rotation + non-uniform scale.
///
/// Composition follows the parent-first convention:
/// `world = parent_world * local`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Position
    pub position: Vec3,
    /// Rotation
    pub rotation: Quat,
    /// Scale (per axis)
    pub scale: Vec3,
}

impl Transform {
    /// Identity transform (no translation, rotation or scale)
    pub const IDENTITY: Self = Self::new(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);

    /// Creates a new transform
    #[must_use]
    pub const fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Creates a transform with only a translation
    #[must_use]
    pub const fn from_position(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY, Vec3::ONE)
    }

    /// Creates a transform with only a rotation
    #[must_use]
    pub const fn from_rotation(rotation: Quat) -> Self {
        Self::new(Vec3::ZERO, rotation, Vec3::ONE)
    }

    /// Composes `self` (the parent) with `local` (the child).
    ///
    /// Scale is propagated per axis without shear, matching how the
    /// hierarchy stores decomposed transforms.
    #[inline]
    #[must_use]
    pub fn mul_transform(&self, local: &Self) -> Self {
        Self {
            position: self.position + self.rotation * (self.scale * local.position),
            rotation: (self.rotation * local.rotation).normalize(),
            scale: self.scale * local.scale,
        }
    }

    /// Returns the local transform that, composed under `parent`, yields `self`.
    ///
    /// Axes with zero parent scale collapse to zero instead of producing
    /// non-finite values.
    #[must_use]
    pub fn relative_to(&self, parent: &Self) -> Self {
        let inverse_rotation = parent.rotation.inverse();
        let inverse_scale = safe_recip(parent.scale);
        Self {
            position: inverse_rotation * (self.position - parent.position) * inverse_scale,
            rotation: (inverse_rotation * self.rotation).normalize(),
            scale: self.scale * inverse_scale,
        }
    }

    /// Transforms a point from local space into the space of this transform.
    #[inline]
    #[must_use]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.rotation * (self.scale * point)
    }

    /// Converts to a 4x4 matrix
    #[must_use]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Approximate equality, component-wise within `epsilon`.
    #[must_use]
    pub fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.position.abs_diff_eq(other.position, epsilon)
            && self.scale.abs_diff_eq(other.scale, epsilon)
            // q and -q describe the same rotation
            && (self.rotation.abs_diff_eq(other.rotation, epsilon)
                || self.rotation.abs_diff_eq(-other.rotation, epsilon))
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl std::ops::Mul for Transform {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.mul_transform(&rhs)
    }
}

fn safe_recip(v: Vec3) -> Vec3 {
    let recip = |x: f32| if x == 0.0 { 0.0 } else { 1.0 / x };
    Vec3::new(recip(v.x), recip(v.y), recip(v.z))
}
