//! Navi Session
//!
//! Connects mobile controllers to a PC/VR host. It owns:
//! - The multi-channel datagram transport
//! - Discovery (controller broadcasts, host listens)
//! - The host session manager: roles, handshake, role switching, gestures,
//!   pose interpolation and outbound commands
//! - The controller session: handshake replies, pose/touch streaming and
//!   asset reception
//!
//! # Architecture
//!
//! Each side runs a single-threaded tick loop driven by an explicit
//! monotonic clock. Every tick drains all pending transport events before
//! producing outputs. The only async piece is the host's discovery receive
//! loop, which forwards raw datagrams to the tick thread through a channel.
//!
//! # Channels
//!
//! | Id | Kind | Traffic |
//! |---|---|---|
//! | [`CHANNEL_RELIABLE`] | reliable-ordered | RPCs, touches |
//! | [`CHANNEL_UNRELIABLE`] | unreliable | pose samples |
//! | [`CHANNEL_FRAGMENTED`] | reliable-fragmented | asset transfer |

#![deny(unsafe_code)]

pub mod connection;
pub mod controller;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod gesture;
pub mod host;
pub mod loopback;
pub mod observer;
pub mod role_switch;
pub mod transport;

pub use connection::{Connection, ConnectionState, Role};
pub use controller::{ControllerConfig, ControllerEvent, ControllerSession, SceneCommand};
pub use error::{SessionError, TransportError};
pub use host::{HostConfig, HostEvent, HostSession};
pub use observer::{Registry, SubscriptionId};
pub use transport::{ChannelId, ChannelKind, ConnectionId, Transport, TransportConfig, TransportEvent};

use navi_wire::{WireMessage, method};

// ============================================================================
// Parameters
// ============================================================================

/// Port controllers accept session connections on.
pub const SESSION_PORT: u16 = 8888;

/// Port hosts listen on for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 19784;

/// SDK build number announced in the handshake.
pub const SDK_BUILD_NO: i32 = 1;

/// Controller slots on the host.
pub const MAX_CONNECTIONS: usize = 4;

/// Help text sent to every controller on connect.
pub const CONTROL_INSTRUCTIONS: &str = "Controls:\n\
    1.Tap with 5 fingers to reset\n\
    2.To change controller #, tap with 5 fingers and then touch the screen with number of fingers\n\
    = the device number\n\
    until vibrates";

pub const CHANNEL_RELIABLE: ChannelId = 0;
pub const CHANNEL_UNRELIABLE: ChannelId = 1;
pub const CHANNEL_FRAGMENTED: ChannelId = 2;

/// Channel a message travels on.
pub fn channel_for(message: &WireMessage) -> ChannelId {
    match message {
        WireMessage::Pose(_) => CHANNEL_UNRELIABLE,
        WireMessage::Touch(_) => CHANNEL_RELIABLE,
        WireMessage::Rpc(call) => match call.method.as_str() {
            method::ASSET_START
            | method::ASSET_CHUNK
            | method::ASSET_COMPLETE
            | method::SET_IMAGE => CHANNEL_FRAGMENTED,
            _ => CHANNEL_RELIABLE,
        },
    }
}

/// Encode `message` and send it on its channel.
pub(crate) fn send_message<S: transport::DatagramSocket>(
    transport: &mut Transport<S>,
    connection: ConnectionId,
    message: &WireMessage,
) -> Result<(), TransportError> {
    transport.send(connection, channel_for(message), &navi_wire::encode(message))
}
