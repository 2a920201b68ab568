//! Device pose providers.
//!
//! The controller computes its pose through a capability interface rather
//! than a concrete sensor stack. Two variants exist: gyro-only rotation, and
//! positional tracking that also reports translation. One is chosen at
//! startup with [`select_provider`]; everything downstream only sees
//! `dyn PoseProvider`.

use crate::{Quat, Vec3};

/// Accelerometer magnitude (in g) on one axis needed to pick a screen
/// orientation during reset.
pub const SCREEN_ROTATION_THRESHOLD: f32 = 0.7;

/// Screen orientation of the controller.
///
/// Codes match the values carried by the `SetOrientation` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenOrientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
    AutoRotation,
}

impl ScreenOrientation {
    pub fn code(self) -> i32 {
        match self {
            Self::Portrait => 1,
            Self::PortraitUpsideDown => 2,
            Self::LandscapeLeft => 3,
            Self::LandscapeRight => 4,
            Self::AutoRotation => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Portrait),
            2 => Some(Self::PortraitUpsideDown),
            3 => Some(Self::LandscapeLeft),
            4 => Some(Self::LandscapeRight),
            5 => Some(Self::AutoRotation),
            _ => None,
        }
    }
}

/// Pick the screen orientation implied by gravity on the accelerometer.
///
/// Axes are checked in a fixed order; `None` when the device is lying flat.
pub fn orientation_from_acceleration(acceleration: Vec3) -> Option<ScreenOrientation> {
    if acceleration.x < -SCREEN_ROTATION_THRESHOLD {
        Some(ScreenOrientation::LandscapeLeft)
    } else if acceleration.y < -SCREEN_ROTATION_THRESHOLD {
        Some(ScreenOrientation::Portrait)
    } else if acceleration.y > SCREEN_ROTATION_THRESHOLD {
        Some(ScreenOrientation::PortraitUpsideDown)
    } else if acceleration.x > SCREEN_ROTATION_THRESHOLD {
        Some(ScreenOrientation::LandscapeRight)
    } else {
        None
    }
}

/// Raw sensor readings handed to a provider once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    /// Gyro attitude as reported by the platform.
    pub attitude: Quat,
    /// Accelerometer reading in g.
    pub acceleration: Vec3,
    /// Tracked position, when the platform supports positional tracking.
    pub tracked_position: Option<Vec3>,
    /// Tracked rotation, when the platform supports positional tracking.
    pub tracked_rotation: Option<Quat>,
}

/// Capability interface for computing the controller's pose.
pub trait PoseProvider {
    /// Feed the latest sensor readings.
    fn ingest(&mut self, reading: &SensorReading);

    /// Current rotation relative to the last reset.
    fn compute_rotation(&mut self) -> Quat;

    /// Current position relative to the last reset.
    fn position(&self) -> Vec3 {
        Vec3::ZERO
    }

    /// Latest acceleration reading.
    fn acceleration(&self) -> Vec3;

    /// Re-zero the pose on the current readings.
    fn reset(&mut self);

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Choose the provider variant for this device.
pub fn select_provider(has_positional_tracking: bool) -> Box<dyn PoseProvider> {
    if has_positional_tracking {
        Box::new(TrackedProvider::new())
    } else {
        Box::new(GyroProvider::new())
    }
}

// ============================================================================
// Gyro provider
// ============================================================================

/// Rotation-only provider driven by the gyro attitude.
#[derive(Debug, Clone)]
pub struct GyroProvider {
    attitude: Quat,
    acceleration: Vec3,
    initial_rotation: Quat,
    upside_down: bool,
    orientation: Option<ScreenOrientation>,
}

impl Default for GyroProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GyroProvider {
    pub fn new() -> Self {
        Self {
            attitude: Quat::IDENTITY,
            acceleration: Vec3::ZERO,
            initial_rotation: Quat::IDENTITY,
            upside_down: false,
            orientation: None,
        }
    }

    /// Orientation chosen at the last reset, if any.
    pub fn orientation(&self) -> Option<ScreenOrientation> {
        self.orientation
    }

    /// Gyro attitude remapped from the sensor frame into world space.
    fn raw_rotation(&self) -> Quat {
        let att = self.attitude;
        let remapped = if self.upside_down {
            Quat::new(att.x, att.y, att.z, att.w)
        } else {
            Quat::new(att.x, att.y, -att.z, -att.w)
        };
        Quat::from_euler_degrees(90.0, 0.0, 0.0) * remapped
    }
}

impl PoseProvider for GyroProvider {
    fn ingest(&mut self, reading: &SensorReading) {
        self.attitude = reading.attitude;
        self.acceleration = reading.acceleration;
    }

    fn compute_rotation(&mut self) -> Quat {
        (self.initial_rotation.inverse() * self.raw_rotation()).normalize()
    }

    fn acceleration(&self) -> Vec3 {
        self.acceleration
    }

    fn reset(&mut self) {
        self.orientation = orientation_from_acceleration(self.acceleration);
        self.upside_down = self.orientation == Some(ScreenOrientation::PortraitUpsideDown);
        self.initial_rotation = self.raw_rotation();
    }

    fn name(&self) -> &'static str {
        "gyro"
    }
}

// ============================================================================
// Tracked provider
// ============================================================================

/// Provider for devices with positional tracking.
#[derive(Debug, Clone)]
pub struct TrackedProvider {
    position: Vec3,
    rotation: Quat,
    acceleration: Vec3,
    zero_position: Vec3,
    zero_rotation: Quat,
    /// Scale from tracking meters to world units.
    meters_to_world: f32,
}

impl Default for TrackedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackedProvider {
    pub fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            acceleration: Vec3::ZERO,
            zero_position: Vec3::ZERO,
            zero_rotation: Quat::IDENTITY,
            meters_to_world: 1.0,
        }
    }

    pub fn with_scale(mut self, meters_to_world: f32) -> Self {
        self.meters_to_world = meters_to_world;
        self
    }
}

impl PoseProvider for TrackedProvider {
    fn ingest(&mut self, reading: &SensorReading) {
        if let Some(position) = reading.tracked_position {
            self.position = position;
        }
        if let Some(rotation) = reading.tracked_rotation {
            self.rotation = rotation;
        }
        self.acceleration = reading.acceleration;
    }

    fn compute_rotation(&mut self) -> Quat {
        (self.zero_rotation.inverse() * self.rotation).normalize()
    }

    fn position(&self) -> Vec3 {
        (self.position - self.zero_position) * self.meters_to_world
    }

    fn acceleration(&self) -> Vec3 {
        self.acceleration
    }

    fn reset(&mut self) {
        self.zero_position = self.position;
        self.zero_rotation = self.rotation;
    }

    fn name(&self) -> &'static str {
        "tracked"
    }
}
