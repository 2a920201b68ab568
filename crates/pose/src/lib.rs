//! Navi Pose Core
//!
//! Pure motion math shared by the host and the controller: vectors,
//! quaternions, the per-connection pose interpolator and the pose-provider
//! capability interface.
//!
//! # Constraints
//!
//! This crate MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//!
//! Time always enters as an explicit `Duration` (receipt time) or `f32`
//! seconds (per-tick delta) supplied by the caller's monotonic tick clock.

#![deny(unsafe_code)]

pub mod interpolator;
pub mod provider;

pub use interpolator::PoseInterpolator;
pub use provider::{
    GyroProvider, PoseProvider, ScreenOrientation, SensorReading, TrackedProvider,
    orientation_from_acceleration, select_provider,
};

use std::ops::{Add, Mul, Neg, Sub};

// ============================================================================
// Constants
// ============================================================================

/// Dot product above which slerp falls back to normalized lerp.
const SLERP_LINEAR_THRESHOLD: f32 = 0.9995;

// ============================================================================
// Vec2 / Vec3
// ============================================================================

/// Screen-space position of a touch, in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Position or acceleration in device/world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Linear interpolation with `t` clamped to `[0, 1]`.
    pub fn lerp(a: Self, b: Self, t: f32) -> Self {
        let t = clamp01(t);
        Self {
            x: a.x + (b.x - a.x) * t,
            y: a.y + (b.y - a.y) * t,
            z: a.z + (b.z - a.z) * t,
        }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

// ============================================================================
// Quat
// ============================================================================

/// Rotation quaternion, stored `(x, y, z, w)` as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation from Euler angles in degrees.
    ///
    /// Applied Z first, then X, then Y, which is the convention the
    /// controller's sensor remapping was authored against.
    pub fn from_euler_degrees(x: f32, y: f32, z: f32) -> Self {
        let qx = Self::from_axis_angle(Vec3::new(1.0, 0.0, 0.0), x.to_radians());
        let qy = Self::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), y.to_radians());
        let qz = Self::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), z.to_radians());
        qy * qx * qz
    }

    /// Rotation of `angle` radians about a unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let (s, c) = (angle * 0.5).sin_cos();
        Self::new(axis.x * s, axis.y * s, axis.z * s, c)
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit-length copy. Degenerate (zero-length) input yields identity.
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= f32::EPSILON || !len.is_finite() {
            return Self::IDENTITY;
        }
        Self::new(self.x / len, self.y / len, self.z / len, self.w / len)
    }

    /// Inverse rotation. Degenerate input yields identity.
    pub fn inverse(self) -> Self {
        let len_sq = self.dot(self);
        if len_sq <= f32::EPSILON || !len_sq.is_finite() {
            return Self::IDENTITY;
        }
        Self::new(
            -self.x / len_sq,
            -self.y / len_sq,
            -self.z / len_sq,
            self.w / len_sq,
        )
    }

    /// Rotate a vector by this quaternion.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(v.x, v.y, v.z, 0.0);
        let r = self * p * self.inverse();
        Vec3::new(r.x, r.y, r.z)
    }

    /// Spherical interpolation with `t` clamped to `[0, 1]`.
    ///
    /// Takes the shortest arc and returns a unit quaternion.
    pub fn slerp(a: Self, b: Self, t: f32) -> Self {
        let t = clamp01(t);
        let a = a.normalize();
        let mut b = b.normalize();
        let mut dot = a.dot(b);
        if dot < 0.0 {
            b = -b;
            dot = -dot;
        }

        if dot > SLERP_LINEAR_THRESHOLD {
            let lerped = Self::new(
                a.x + (b.x - a.x) * t,
                a.y + (b.y - a.y) * t,
                a.z + (b.z - a.z) * t,
                a.w + (b.w - a.w) * t,
            );
            return lerped.normalize();
        }

        let theta_0 = dot.clamp(-1.0, 1.0).acos();
        let theta = theta_0 * t;
        let sin_theta_0 = theta_0.sin();
        let s0 = (theta_0 - theta).sin() / sin_theta_0;
        let s1 = theta.sin() / sin_theta_0;
        Self::new(
            a.x * s0 + b.x * s1,
            a.y * s0 + b.y * s1,
            a.z * s0 + b.z * s1,
            a.w * s0 + b.w * s1,
        )
    }

    /// Angle in radians between two rotations.
    pub fn angle_between(a: Self, b: Self) -> f32 {
        let dot = a.normalize().dot(b.normalize()).abs().min(1.0);
        2.0 * dot.acos()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Mul for Quat {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}

impl Neg for Quat {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, -self.w)
    }
}

// ============================================================================
// PoseSample
// ============================================================================

/// One pose/acceleration reading from a controller.
///
/// This is the unit the controller streams on the unreliable channel and the
/// unit the host interpolates between.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseSample {
    pub position: Vec3,
    pub rotation: Quat,
    pub acceleration: Vec3,
}

impl PoseSample {
    pub fn new(position: Vec3, rotation: Quat, acceleration: Vec3) -> Self {
        Self {
            position,
            rotation,
            acceleration,
        }
    }

    /// Interpolate every component between `a` and `b`.
    pub fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        Self {
            position: Vec3::lerp(a.position, b.position, t),
            rotation: Quat::slerp(a.rotation, b.rotation, t),
            acceleration: Vec3::lerp(a.acceleration, b.acceleration, t),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite() && self.acceleration.is_finite()
    }
}

fn clamp01(t: f32) -> f32 {
    if t.is_nan() { 1.0 } else { t.clamp(0.0, 1.0) }
}

// ============================================================================
// Tests
// ============================================================================
