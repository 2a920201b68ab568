//! Host-side record of one connected controller.

use navi_pose::PoseInterpolator;

use crate::gesture::GestureTracker;
use crate::role_switch::RoleSwitch;
use crate::transport::ConnectionId;

/// Player slot. `0` is the primary, headset-paired controller.
pub type Role = u8;

/// Connection lifecycle.
///
/// ```text
/// Connecting → AwaitingHandshake → Active → Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Handshake sent, waiting for the device to report its screen size.
    AwaitingHandshake,
    Active,
    Disconnected,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub state: ConnectionState,
    /// Screen size in pixels, once reported.
    pub screen: Option<(i32, i32)>,
    pub platform: Option<i32>,
    /// SDK build announced in the handshake.
    pub build_no: Option<i32>,
    pub interpolator: PoseInterpolator,
    pub role_switch: RoleSwitch,
    pub gestures: GestureTracker,
}

impl Connection {
    pub fn new(id: ConnectionId, role: Role) -> Self {
        Self {
            id,
            role,
            state: ConnectionState::Connecting,
            screen: None,
            platform: None,
            build_no: None,
            interpolator: PoseInterpolator::new(),
            role_switch: RoleSwitch::default(),
            gestures: GestureTracker::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}
