//! Controller (mobile) side of a session.
//!
//! Listens for the host on the session port and advertises itself until a
//! host connects. Once a role is assigned it answers the handshake with its
//! screen size and platform. While connected it streams one pose sample
//! per tick and forwards queued touches. Host commands surface as
//! [`ControllerEvent`]s.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use navi_pose::{PoseProvider, PoseSample, Quat, SensorReading, Vec3};
use navi_transfer::{AssetBundle, AssetReceiver, TransferError};
use navi_wire::{Advertisement, DecodeError, RpcCall, TouchEvent, WireMessage, method};
use tracing::{debug, info, warn};

use crate::connection::Role;
use crate::discovery::{Broadcaster, bind_broadcast_socket, broadcast_target};
use crate::dispatch::{DispatchOutcome, DispatchTable};
use crate::error::SessionError;
use crate::observer::Registry;
use crate::transport::{
    ConnectionId, DatagramSocket, Transport, TransportConfig, TransportEvent, bind_udp,
};
use crate::{DISCOVERY_PORT, SESSION_PORT, send_message};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub application_name: String,
    /// Address advertised to hosts.
    pub ip_address: String,
    pub session_port: u16,
    pub discovery_port: u16,
    /// Screen size in pixels, reported in the handshake.
    pub screen: (i32, i32),
    pub platform: i32,
    pub transport: TransportConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            application_name: "Navi".to_string(),
            ip_address: Ipv4Addr::LOCALHOST.to_string(),
            session_port: SESSION_PORT,
            discovery_port: DISCOVERY_PORT,
            screen: (1080, 1920),
            platform: 0,
            transport: TransportConfig {
                max_connections: 1,
                ..TransportConfig::default()
            },
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Scene-graph command addressed to a named object.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneCommand {
    SetLocation {
        object: String,
        position: Vec3,
    },
    SetRotation {
        object: String,
        rotation: Quat,
    },
    AnimateTo {
        object: String,
        position: Vec3,
        duration: f32,
    },
    SetRendererEnabled {
        object: String,
        enabled: bool,
    },
    Destroy {
        object: String,
    },
    Duplicate {
        object: String,
        new_name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Connected(ConnectionId),
    RoleAssigned(Role),
    BuildNo(i32),
    Instruction(String),
    Vibrate,
    SetOrientation {
        orientation: i32,
        user_can_override: bool,
    },
    OpenKeyboard,
    CloseKeyboard,
    ClearKeyboard,
    KeyboardText(String),
    Scene(SceneCommand),
    AssetStarted {
        total: usize,
    },
    AssetReady(AssetBundle),
    AssetFailed(TransferError),
    /// PNG bytes to show behind the touch surface.
    Image(Vec<u8>),
    Disconnected,
}

// ============================================================================
// Controller Session
// ============================================================================

pub struct ControllerSession<S> {
    config: ControllerConfig,
    clock: Duration,
    transport: Transport<S>,
    broadcaster: Broadcaster<S>,
    provider: Box<dyn PoseProvider>,
    receiver: AssetReceiver,
    connection: Option<ConnectionId>,
    role: Option<Role>,
    touches: VecDeque<TouchEvent>,
    image: Option<Vec<u8>>,
    dispatch: DispatchTable<Self>,
    events: Registry<ControllerEvent>,
}

impl ControllerSession<UdpSocket> {
    /// Bind the session port and a broadcast socket.
    pub fn bind(config: ControllerConfig, provider: Box<dyn PoseProvider>) -> io::Result<Self> {
        let socket = bind_udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.session_port)))?;
        let transport = Transport::bind(socket, config.transport.clone());
        let broadcast_socket = bind_broadcast_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        let broadcaster = Broadcaster::new(
            broadcast_socket,
            Advertisement::new(config.application_name.clone(), config.ip_address.clone()),
            broadcast_target(config.discovery_port),
        );
        Ok(Self::new(transport, broadcaster, provider, config))
    }
}

impl<S: DatagramSocket> ControllerSession<S> {
    pub fn new(
        transport: Transport<S>,
        broadcaster: Broadcaster<S>,
        provider: Box<dyn PoseProvider>,
        config: ControllerConfig,
    ) -> Self {
        info!(provider = provider.name(), "controller session created");
        Self {
            config,
            clock: Duration::ZERO,
            transport,
            broadcaster,
            provider,
            receiver: AssetReceiver::new(),
            connection: None,
            role: None,
            touches: VecDeque::new(),
            image: None,
            dispatch: Self::handlers(),
            events: Registry::new(),
        }
    }

    fn handlers() -> DispatchTable<Self> {
        let mut table = DispatchTable::new();
        table
            .register(method::ASSIGN_ROLE, Self::on_assign_role)
            .register(method::BUILD_NO, Self::on_build_no)
            .register(method::SET_INSTRUCTION, Self::on_set_instruction)
            .register(method::VIBRATE, Self::on_vibrate)
            .register(method::SET_ORIENTATION, Self::on_set_orientation)
            .register(method::OPEN_KEYBOARD, Self::on_open_keyboard)
            .register(method::CLOSE_KEYBOARD, Self::on_close_keyboard)
            .register(method::CLEAR_KEYBOARD, Self::on_clear_keyboard)
            .register(method::SET_KEYBOARD_TEXT, Self::on_set_keyboard_text)
            .register(method::SET_LOCATION, Self::on_scene_command)
            .register(method::SET_ROTATION, Self::on_scene_command)
            .register(method::ANIMATE_TO, Self::on_scene_command)
            .register(method::SET_RENDERER_ENABLED, Self::on_scene_command)
            .register(method::DESTROY, Self::on_scene_command)
            .register(method::DUPLICATE, Self::on_scene_command)
            .register(method::ASSET_START, Self::on_asset_start)
            .register(method::ASSET_CHUNK, Self::on_asset_chunk)
            .register(method::ASSET_COMPLETE, Self::on_asset_complete)
            .register(method::SET_IMAGE, Self::on_set_image);
        table
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn events(&self) -> &Registry<ControllerEvent> {
        &self.events
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Background image last sent by the host, until it disconnects.
    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    /// Whether a partially received asset bundle is held.
    pub fn asset_in_progress(&self) -> bool {
        self.receiver.is_receiving()
    }

    // ------------------------------------------------------------------------
    // Local input
    // ------------------------------------------------------------------------

    /// Feed this frame's sensor readings to the pose provider.
    pub fn ingest(&mut self, reading: &SensorReading) {
        self.provider.ingest(reading);
    }

    /// Queue a touch for the next tick.
    pub fn submit_touch(&mut self, touch: TouchEvent) {
        if self.connection.is_some() {
            self.touches.push_back(touch);
        }
    }

    pub fn submit_keyboard_text(&mut self, text: &str) -> Result<(), SessionError> {
        let id = self.connection.ok_or(SessionError::NoHost)?;
        send_message(
            &mut self.transport,
            id,
            &WireMessage::Rpc(RpcCall::keyboard_text(text)),
        )?;
        Ok(())
    }

    /// Re-zero the local pose and broadcast a reset request to the host.
    pub fn request_reset(&mut self) -> io::Result<()> {
        self.provider.reset();
        self.broadcaster.send_reset()
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn tick(&mut self, dt: Duration) {
        self.clock += dt;
        let now = self.clock;

        while let Some(event) = self.transport.poll(now) {
            self.handle_transport_event(event);
        }
        self.broadcaster.tick(now, self.connection.is_some());

        if let Some(id) = self.connection {
            self.send_pose(id);
            self.flush_touches(id);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect(id) => {
                if self.connection.is_some() {
                    debug!(connection = id, "already connected, refusing second host");
                    self.transport.disconnect(id);
                    return;
                }
                info!(connection = id, "host connected");
                self.connection = Some(id);
                self.events.emit(&ControllerEvent::Connected(id));
            }
            TransportEvent::Disconnect(id) => {
                if self.connection != Some(id) {
                    return;
                }
                info!(connection = id, role = ?self.role, "host disconnected");
                self.connection = None;
                self.role = None;
                self.touches.clear();
                self.image = None;
                self.receiver.abort();
                self.events.emit(&ControllerEvent::Disconnected);
            }
            TransportEvent::Data {
                connection,
                channel,
                payload,
            } => match navi_wire::decode(&payload) {
                Ok(WireMessage::Rpc(call)) => self.on_rpc(connection, &call),
                Ok(other) => debug!(connection, channel, ?other, "unexpected message from host"),
                Err(e) => debug!(connection, channel, error = %e, "dropping undecodable message"),
            },
        }
    }

    fn send_pose(&mut self, id: ConnectionId) {
        let sample = PoseSample::new(
            self.provider.position(),
            self.provider.compute_rotation(),
            self.provider.acceleration(),
        );
        if let Err(e) = send_message(&mut self.transport, id, &sample.into()) {
            debug!(connection = id, error = %e, "pose send failed");
        }
    }

    fn flush_touches(&mut self, id: ConnectionId) {
        while let Some(touch) = self.touches.front() {
            match send_message(&mut self.transport, id, &WireMessage::Touch(*touch)) {
                Ok(()) => {
                    self.touches.pop_front();
                }
                Err(e) if e.is_transient() => break,
                Err(e) => {
                    warn!(connection = id, error = %e, "touch dropped");
                    self.touches.pop_front();
                }
            }
        }
    }

    fn on_rpc(&mut self, id: ConnectionId, call: &RpcCall) {
        if self.role.is_none() && call.method != method::ASSIGN_ROLE {
            let violation = SessionError::ProtocolViolation {
                connection: id,
                reason: format!("{} before role assignment", call.method),
            };
            debug!(error = %violation, "ignoring rpc");
            return;
        }
        let dispatch = std::mem::take(&mut self.dispatch);
        let outcome = dispatch.dispatch(self, id, call);
        self.dispatch = dispatch;
        if let DispatchOutcome::Rejected(e) = outcome {
            debug!(connection = id, method = %call.method, error = %e, "rpc rejected");
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn on_assign_role(&mut self, id: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let role = Role::try_from(call.int(0)?).map_err(|_| DecodeError::ArgRange {
            method: call.method.clone(),
            index: 0,
        })?;
        self.role = Some(role);
        info!(connection = id, role, "role assigned");

        let (width, height) = self.config.screen;
        for reply in [
            RpcCall::set_size(width, height),
            RpcCall::set_platform(self.config.platform),
        ] {
            send_message(&mut self.transport, id, &WireMessage::Rpc(reply))?;
        }
        self.events.emit(&ControllerEvent::RoleAssigned(role));
        Ok(())
    }

    fn on_build_no(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::BuildNo(call.int(0)?));
        Ok(())
    }

    fn on_set_instruction(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        self.events
            .emit(&ControllerEvent::Instruction(call.str(0)?.to_string()));
        Ok(())
    }

    fn on_vibrate(&mut self, _: ConnectionId, _: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::Vibrate);
        Ok(())
    }

    fn on_set_orientation(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::SetOrientation {
            orientation: call.int(0)?,
            user_can_override: call.bool(1)?,
        });
        Ok(())
    }

    fn on_open_keyboard(&mut self, _: ConnectionId, _: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::OpenKeyboard);
        Ok(())
    }

    fn on_close_keyboard(&mut self, _: ConnectionId, _: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::CloseKeyboard);
        Ok(())
    }

    fn on_clear_keyboard(&mut self, _: ConnectionId, _: &RpcCall) -> Result<(), SessionError> {
        self.events.emit(&ControllerEvent::ClearKeyboard);
        Ok(())
    }

    fn on_set_keyboard_text(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        self.events
            .emit(&ControllerEvent::KeyboardText(call.str(0)?.to_string()));
        Ok(())
    }

    fn on_scene_command(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let object = call.str(0)?.to_string();
        let command = match call.method.as_str() {
            method::SET_LOCATION => SceneCommand::SetLocation {
                object,
                position: call.vec3(1)?,
            },
            method::SET_ROTATION => SceneCommand::SetRotation {
                object,
                rotation: Quat::new(call.float(1)?, call.float(2)?, call.float(3)?, call.float(4)?),
            },
            method::ANIMATE_TO => SceneCommand::AnimateTo {
                object,
                position: call.vec3(1)?,
                duration: call.float(4)?,
            },
            method::SET_RENDERER_ENABLED => SceneCommand::SetRendererEnabled {
                object,
                enabled: call.bool(1)?,
            },
            method::DESTROY => SceneCommand::Destroy { object },
            method::DUPLICATE => SceneCommand::Duplicate {
                object,
                new_name: call.str(1)?.to_string(),
            },
            other => {
                debug!(method = other, "not a scene command");
                return Ok(());
            }
        };
        self.events.emit(&ControllerEvent::Scene(command));
        Ok(())
    }

    fn on_set_image(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let png = call.blob(0)?.to_vec();
        debug!(len = png.len(), "background image received");
        self.events.emit(&ControllerEvent::Image(png.clone()));
        self.image = Some(png);
        Ok(())
    }

    fn on_asset_start(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let total = call.index(0)?;
        if let Err(e) = self.receiver.start(total) {
            self.events.emit(&ControllerEvent::AssetFailed(e.clone()));
            return Err(e.into());
        }
        self.events.emit(&ControllerEvent::AssetStarted { total });
        Ok(())
    }

    fn on_asset_chunk(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let offset = call.index(0)?;
        self.receiver.chunk(offset, call.blob(1)?)?;
        Ok(())
    }

    fn on_asset_complete(&mut self, _: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        match self.receiver.complete(call.str(0)?) {
            Ok(bundle) => {
                info!(len = bundle.len(), sha256 = bundle.sha256(), "asset bundle received");
                self.events.emit(&ControllerEvent::AssetReady(bundle));
                Ok(())
            }
            Err(e) => {
                self.events.emit(&ControllerEvent::AssetFailed(e.clone()));
                Err(e.into())
            }
        }
    }
}
