//! Host (PC/VR) session manager.
//!
//! Owns the controller connections and their roles. Each connection is
//! greeted with the handshake `DeviceNo(role)`, `BuildNo`,
//! `SetInstruction` and becomes active once the device reports its screen
//! size. Pose samples are smoothed per connection and published every tick.
//! Touches feed gesture detection and the hold-to-switch-role protocol.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use navi_pose::{PoseSample, Quat, ScreenOrientation, Vec3};
use navi_transfer::{AssetUpload, DEFAULT_CHUNK_SIZE, UploadStep};
use navi_wire::{RpcCall, TouchEvent, WireMessage, method};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState, Role};
use crate::discovery::{DiscoveryEvent, DiscoveryRecord, Listener};
use crate::dispatch::{DispatchOutcome, DispatchTable};
use crate::error::{SessionError, TransportError};
use crate::gesture::{Gesture, RESET_FINGERS};
use crate::observer::Registry;
use crate::role_switch::SwitchOutcome;
use crate::transport::{
    ConnectionId, DatagramSocket, Transport, TransportConfig, TransportEvent, bind_udp,
};
use crate::{
    CONTROL_INSTRUCTIONS, DISCOVERY_PORT, MAX_CONNECTIONS, SDK_BUILD_NO, SESSION_PORT, send_message,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Role slots, `0..max_connections`.
    pub max_connections: usize,
    /// Port controllers listen on.
    pub session_port: u16,
    pub discovery_port: u16,
    pub build_no: i32,
    pub instructions: String,
    /// Bytes per `AssetChunk`.
    pub chunk_size: usize,
    pub transport: TransportConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            session_port: SESSION_PORT,
            discovery_port: DISCOVERY_PORT,
            build_no: SDK_BUILD_NO,
            instructions: CONTROL_INSTRUCTIONS.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transport: TransportConfig {
                max_connections: MAX_CONNECTIONS,
                ..TransportConfig::default()
            },
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Notifications for the render layer.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Discovered(DiscoveryRecord),
    DeviceConnected {
        connection: ConnectionId,
        role: Role,
    },
    DeviceDisconnected {
        connection: ConnectionId,
        role: Role,
    },
    /// The last controller left.
    SearchingResumed,
    SizeChanged {
        connection: ConnectionId,
        role: Role,
        width: i32,
        height: i32,
    },
    PlatformReceived {
        connection: ConnectionId,
        role: Role,
        platform: i32,
    },
    /// Interpolated pose, once per connection per tick.
    Pose {
        connection: ConnectionId,
        role: Role,
        sample: PoseSample,
    },
    Touch {
        connection: ConnectionId,
        role: Role,
        touch: TouchEvent,
    },
    Gesture {
        connection: ConnectionId,
        role: Role,
        gesture: Gesture,
    },
    /// Re-center the headset.
    ResetHmd,
    /// First reset by the primary controller.
    GameStart,
    RolesSwapped {
        from: Role,
        to: Role,
    },
    KeyboardText {
        connection: ConnectionId,
        role: Role,
        text: String,
    },
    UploadProgress {
        role: Role,
        progress: f32,
    },
    UploadFinished {
        role: Role,
    },
    UploadAbandoned {
        role: Role,
    },
}

// ============================================================================
// Host Session
// ============================================================================

type KeyboardCallback = Box<dyn FnMut(&str)>;

#[derive(Debug)]
struct ScheduledInstruction {
    connection: ConnectionId,
    due: Duration,
    text: String,
}

pub struct HostSession<S> {
    config: HostConfig,
    clock: Duration,
    transport: Transport<S>,
    listener: Option<Listener>,
    connections: BTreeMap<ConnectionId, Connection>,
    dispatch: DispatchTable<Self>,
    events: Registry<HostEvent>,
    keyboards: HashMap<ConnectionId, KeyboardCallback>,
    scheduled: Vec<ScheduledInstruction>,
    uploads: HashMap<ConnectionId, VecDeque<AssetUpload>>,
    game_started: bool,
}

impl HostSession<UdpSocket> {
    /// Host on an ephemeral UDP port.
    pub fn bind(config: HostConfig) -> Result<Self, SessionError> {
        let socket = bind_udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(TransportError::from)?;
        let transport = Transport::bind(socket, config.transport.clone());
        Ok(Self::new(transport, config))
    }
}

impl<S: DatagramSocket> HostSession<S> {
    pub fn new(transport: Transport<S>, config: HostConfig) -> Self {
        Self {
            config,
            clock: Duration::ZERO,
            transport,
            listener: None,
            connections: BTreeMap::new(),
            dispatch: Self::handlers(),
            events: Registry::new(),
            keyboards: HashMap::new(),
            scheduled: Vec::new(),
            uploads: HashMap::new(),
            game_started: false,
        }
    }

    fn handlers() -> DispatchTable<Self> {
        let mut table = DispatchTable::new();
        table
            .register(method::SET_SIZE, Self::on_set_size)
            .register(method::SET_PLATFORM, Self::on_set_platform)
            .register(method::KEYBOARD_TEXT, Self::on_keyboard_text);
        table
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn events(&self) -> &Registry<HostEvent> {
        &self.events
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_by_role(&self, role: Role) -> Option<&Connection> {
        self.connections.values().find(|c| c.role == role)
    }

    /// Latest interpolated pose of the controller holding `role`.
    pub fn interpolated_pose(&self, role: Role) -> Option<PoseSample> {
        self.connection_by_role(role)?.interpolator.sample()
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Listen for controller broadcasts on the discovery port.
    ///
    /// A bind failure is logged and returned. Call again to retry.
    pub fn start_discovery(&mut self, handle: &Handle) -> io::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.discovery_port));
        match Listener::bind(addr, handle) {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(e) => {
                warn!(%addr, error = %e, "discovery listener bind failed");
                Err(e)
            }
        }
    }

    pub fn attach_listener(&mut self, listener: Listener) {
        self.listener = Some(listener);
    }

    /// Live advertisements, oldest first.
    pub fn discovered(&self) -> Vec<DiscoveryRecord> {
        self.listener
            .as_ref()
            .map(|l| l.records().cloned().collect())
            .unwrap_or_default()
    }

    /// Connect to the controller advertising `ip`.
    pub fn connect(&mut self, ip: &str) -> Result<ConnectionId, SessionError> {
        if let Some(listener) = self.listener.as_mut() {
            listener.take(ip);
        }
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| TransportError::InvalidAddress(ip.to_string()))?;
        let id = self
            .transport
            .connect(SocketAddr::new(addr, self.config.session_port))?;
        debug!(connection = id, ip, "connecting to controller");
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Advance the session clock by `dt` and process everything pending.
    pub fn tick(&mut self, dt: Duration) {
        self.clock += dt;
        let now = self.clock;

        self.drain_discovery(now);
        while let Some(event) = self.transport.poll(now) {
            self.handle_transport_event(event);
        }
        self.expire_timers(now);
        self.pump_uploads();
        self.advance_poses(dt);
    }

    fn drain_discovery(&mut self, now: Duration) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        for event in listener.drain(now) {
            match event {
                DiscoveryEvent::Reset { from } => {
                    info!(%from, "reset requested over discovery");
                    self.events.emit(&HostEvent::ResetHmd);
                }
                DiscoveryEvent::Discovered(record) => {
                    self.events.emit(&HostEvent::Discovered(record));
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect(id) => self.on_connect(id),
            TransportEvent::Disconnect(id) => self.on_disconnect(id),
            TransportEvent::Data {
                connection,
                channel,
                payload,
            } => match navi_wire::decode(&payload) {
                Ok(WireMessage::Pose(sample)) => self.on_pose(connection, sample),
                Ok(WireMessage::Touch(touch)) => self.on_touch(connection, touch),
                Ok(WireMessage::Rpc(call)) => self.on_rpc(connection, &call),
                Err(e) => debug!(connection, channel, error = %e, "dropping undecodable message"),
            },
        }
    }

    fn expire_timers(&mut self, now: Duration) {
        for conn in self.connections.values_mut() {
            conn.role_switch.expire(now);
        }

        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|s| s.due <= now);
        self.scheduled = pending;
        for instruction in due {
            if let Err(e) = self.send_rpc(
                instruction.connection,
                RpcCall::set_instruction(instruction.text),
            ) {
                debug!(connection = instruction.connection, error = %e, "scheduled instruction not sent");
            }
        }
    }

    fn advance_poses(&mut self, dt: Duration) {
        let dt = dt.as_secs_f32();
        let mut poses: Vec<(Role, ConnectionId, PoseSample)> = self
            .connections
            .values_mut()
            .filter_map(|c| c.interpolator.advance(dt).map(|s| (c.role, c.id, s)))
            .collect();
        poses.sort_by_key(|(role, ..)| *role);
        for (role, connection, sample) in poses {
            self.events.emit(&HostEvent::Pose {
                connection,
                role,
                sample,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    fn free_role(&self) -> Option<Role> {
        (0..self.config.max_connections)
            .filter_map(|r| Role::try_from(r).ok())
            .find(|r| !self.connections.values().any(|c| c.role == *r))
    }

    fn on_connect(&mut self, id: ConnectionId) {
        let Some(role) = self.free_role() else {
            warn!(connection = id, "no free role slot, disconnecting");
            self.transport.disconnect(id);
            return;
        };

        let mut conn = Connection::new(id, role);
        let handshake = [
            RpcCall::assign_role(i32::from(role)),
            RpcCall::build_no(self.config.build_no),
            RpcCall::set_instruction(self.config.instructions.clone()),
        ];
        for call in handshake {
            if let Err(e) = self.send_rpc(id, call) {
                warn!(connection = id, error = %e, "handshake send failed");
            }
        }
        conn.build_no = Some(self.config.build_no);
        conn.state = ConnectionState::AwaitingHandshake;
        self.connections.insert(id, conn);

        info!(connection = id, role, "device connected");
        self.events
            .emit(&HostEvent::DeviceConnected { connection: id, role });
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        conn.state = ConnectionState::Disconnected;
        self.keyboards.remove(&id);
        self.scheduled.retain(|s| s.connection != id);
        if self.uploads.remove(&id).is_some() {
            debug!(connection = id, "asset upload abandoned on disconnect");
        }

        info!(connection = id, role = conn.role, "device disconnected");
        self.events.emit(&HostEvent::DeviceDisconnected {
            connection: id,
            role: conn.role,
        });
        if self.connections.is_empty() {
            self.events.emit(&HostEvent::SearchingResumed);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------------

    fn role_of(&self, id: ConnectionId) -> Result<Role, SessionError> {
        self.connections
            .get(&id)
            .map(|c| c.role)
            .ok_or_else(|| SessionError::ProtocolViolation {
                connection: id,
                reason: "message from unknown connection".into(),
            })
    }

    fn on_pose(&mut self, id: ConnectionId, sample: PoseSample) {
        if !sample.is_finite() {
            debug!(connection = id, "dropping non-finite pose");
            return;
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.interpolator.push(sample, self.clock);
        }
    }

    fn on_touch(&mut self, id: ConnectionId, touch: TouchEvent) {
        let now = self.clock;
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.is_active() {
            debug!(connection = id, "touch before handshake completed, ignored");
            return;
        }
        let role = conn.role;
        let gesture = conn.gestures.on_touch(&touch, now);
        // Evaluate the switch before the gesture can re-arm it.
        let fingers = conn.gestures.fingers_down();
        let outcome = conn.role_switch.on_touch(touch.phase, fingers, now);

        self.events.emit(&HostEvent::Touch {
            connection: id,
            role,
            touch,
        });
        match outcome {
            SwitchOutcome::SwitchTo(target) => self.switch_role(id, target),
            SwitchOutcome::Cancelled => debug!(connection = id, role, "role switch cancelled"),
            SwitchOutcome::Pending => {}
        }
        if let Some(gesture) = gesture {
            self.events.emit(&HostEvent::Gesture {
                connection: id,
                role,
                gesture,
            });
            if gesture == Gesture::MultiFingerTap(RESET_FINGERS) {
                self.reset_vr(role);
            }
        }
    }

    fn on_rpc(&mut self, id: ConnectionId, call: &RpcCall) {
        let dispatch = std::mem::take(&mut self.dispatch);
        let outcome = dispatch.dispatch(self, id, call);
        self.dispatch = dispatch;
        if let DispatchOutcome::Rejected(e) = outcome {
            debug!(connection = id, method = %call.method, error = %e, "rpc rejected");
        }
    }

    fn on_set_size(&mut self, id: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let (width, height) = (call.int(0)?, call.int(1)?);
        let role = self.role_of(id)?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.screen = Some((width, height));
            if conn.state == ConnectionState::AwaitingHandshake {
                conn.state = ConnectionState::Active;
                debug!(connection = id, role, "handshake complete");
            }
        }
        self.events.emit(&HostEvent::SizeChanged {
            connection: id,
            role,
            width,
            height,
        });
        Ok(())
    }

    fn on_set_platform(&mut self, id: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let platform = call.int(0)?;
        let role = self.role_of(id)?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.platform = Some(platform);
        }
        self.events.emit(&HostEvent::PlatformReceived {
            connection: id,
            role,
            platform,
        });
        Ok(())
    }

    fn on_keyboard_text(&mut self, id: ConnectionId, call: &RpcCall) -> Result<(), SessionError> {
        let text = call.str(0)?;
        let role = self.role_of(id)?;
        match self.keyboards.get_mut(&id) {
            Some(on_text) => on_text(text),
            None => debug!(connection = id, "keyboard text without an open keyboard"),
        }
        self.events.emit(&HostEvent::KeyboardText {
            connection: id,
            role,
            text: text.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reset and role switch
    // ------------------------------------------------------------------------

    /// Reset requested by the controller holding `role`.
    ///
    /// The primary controller re-centers the headset. Any controller's reset
    /// arms its role switch.
    pub fn reset_vr(&mut self, role: Role) {
        if role == 0 {
            self.events.emit(&HostEvent::ResetHmd);
            if !self.game_started {
                self.game_started = true;
                info!("game started");
                self.events.emit(&HostEvent::GameStart);
            }
        }
        let now = self.clock;
        if let Some(conn) = self.connections.values_mut().find(|c| c.role == role) {
            conn.role_switch.arm(now);
            debug!(connection = conn.id, role, "role switch armed");
        }
    }

    fn switch_role(&mut self, id: ConnectionId, requested: Role) {
        let Some(from) = self.connections.get(&id).map(|c| c.role) else {
            return;
        };
        let target = if self.connection_by_role(requested).is_some() {
            requested
        } else {
            match self.connections.values().map(|c| c.role).max() {
                Some(highest) => highest,
                None => return,
            }
        };
        if target == from {
            debug!(connection = id, role = from, "role switch to own role ignored");
            return;
        }
        let Some(other) = self.connection_by_role(target).map(|c| c.id) else {
            return;
        };

        for (conn_id, role) in [(id, target), (other, from)] {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.role = role;
                conn.gestures.reset();
            }
        }
        for (conn_id, role) in [(id, target), (other, from)] {
            if let Err(e) = self.send_rpc(conn_id, RpcCall::assign_role(i32::from(role))) {
                warn!(connection = conn_id, error = %e, "role assignment send failed");
            }
        }
        for conn_id in [id, other] {
            if let Err(e) = self.send_rpc(conn_id, RpcCall::vibrate()) {
                debug!(connection = conn_id, error = %e, "vibrate send failed");
            }
        }

        info!(from, to = target, "roles swapped");
        self.events
            .emit(&HostEvent::RolesSwapped { from, to: target });
    }

    // ------------------------------------------------------------------------
    // Outbound commands
    // ------------------------------------------------------------------------

    fn send_rpc(&mut self, id: ConnectionId, call: RpcCall) -> Result<(), SessionError> {
        send_message(&mut self.transport, id, &WireMessage::Rpc(call))?;
        Ok(())
    }

    fn connection_id(&self, role: Role) -> Result<ConnectionId, SessionError> {
        self.connection_by_role(role)
            .map(|c| c.id)
            .ok_or(SessionError::NoConnectionForRole(role))
    }

    /// Send `call` to the controller holding `role`.
    pub fn send_to_role(&mut self, role: Role, call: RpcCall) -> Result<(), SessionError> {
        let id = self.connection_id(role)?;
        self.send_rpc(id, call)
    }

    pub fn set_instruction(&mut self, role: Role, text: &str) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_instruction(text))
    }

    /// Send `text` as the instruction after `delay`. Dropped if the
    /// controller disconnects first.
    pub fn schedule_instruction(
        &mut self,
        role: Role,
        text: &str,
        delay: Duration,
    ) -> Result<(), SessionError> {
        let connection = self.connection_id(role)?;
        self.scheduled.push(ScheduledInstruction {
            connection,
            due: self.clock + delay,
            text: text.to_string(),
        });
        Ok(())
    }

    pub fn vibrate(&mut self, role: Role) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::vibrate())
    }

    pub fn set_orientation(
        &mut self,
        role: Role,
        orientation: ScreenOrientation,
        user_can_override: bool,
    ) -> Result<(), SessionError> {
        self.send_to_role(
            role,
            RpcCall::set_orientation(orientation.code(), user_can_override),
        )
    }

    /// Open the controller's keyboard. `on_text` receives every
    /// `KeyboardText` until the keyboard is closed or the controller leaves.
    pub fn open_keyboard(
        &mut self,
        role: Role,
        on_text: impl FnMut(&str) + 'static,
    ) -> Result<(), SessionError> {
        let id = self.connection_id(role)?;
        self.send_rpc(id, RpcCall::open_keyboard())?;
        self.keyboards.insert(id, Box::new(on_text));
        Ok(())
    }

    pub fn close_keyboard(&mut self, role: Role) -> Result<(), SessionError> {
        let id = self.connection_id(role)?;
        self.keyboards.remove(&id);
        self.send_rpc(id, RpcCall::close_keyboard())
    }

    pub fn clear_keyboard(&mut self, role: Role) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::clear_keyboard())
    }

    pub fn set_keyboard_text(&mut self, role: Role, text: &str) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_keyboard_text(text))
    }

    pub fn set_location(&mut self, role: Role, object: &str, position: Vec3) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_location(object, position))
    }

    pub fn set_rotation(&mut self, role: Role, object: &str, rotation: Quat) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_rotation(object, rotation))
    }

    pub fn animate_to(
        &mut self,
        role: Role,
        object: &str,
        position: Vec3,
        duration: Duration,
    ) -> Result<(), SessionError> {
        self.send_to_role(
            role,
            RpcCall::animate_to(object, position, duration.as_secs_f32()),
        )
    }

    pub fn set_renderer_enabled(
        &mut self,
        role: Role,
        object: &str,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_renderer_enabled(object, enabled))
    }

    /// Show `png` behind the controller's touch surface.
    pub fn send_image(&mut self, role: Role, png: Vec<u8>) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::set_image(png))
    }

    pub fn destroy_object(&mut self, role: Role, object: &str) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::destroy(object))
    }

    pub fn duplicate_object(
        &mut self,
        role: Role,
        object: &str,
        new_name: &str,
    ) -> Result<(), SessionError> {
        self.send_to_role(role, RpcCall::duplicate(object, new_name))
    }

    // ------------------------------------------------------------------------
    // Asset upload
    // ------------------------------------------------------------------------

    /// Queue `bytes` for upload to the controller holding `role`. Sending
    /// starts on the next tick.
    pub fn push_asset_bundle(&mut self, role: Role, bytes: Vec<u8>) -> Result<(), SessionError> {
        let id = self.connection_id(role)?;
        let upload = AssetUpload::new(bytes, self.config.chunk_size)?;
        debug!(connection = id, role, len = upload.total_len(), "asset upload queued");
        self.uploads.entry(id).or_default().push_back(upload);
        Ok(())
    }

    pub fn upload_pending(&self, role: Role) -> bool {
        self.connection_by_role(role)
            .is_some_and(|c| self.uploads.get(&c.id).is_some_and(|q| !q.is_empty()))
    }

    fn pump_uploads(&mut self) {
        let ids: Vec<ConnectionId> = self.uploads.keys().copied().collect();
        for id in ids {
            self.pump_upload(id);
        }
    }

    /// Send as many upload steps as the transport accepts this tick.
    fn pump_upload(&mut self, id: ConnectionId) {
        let Some(mut queue) = self.uploads.remove(&id) else {
            return;
        };
        let Ok(role) = self.role_of(id) else {
            return;
        };

        while let Some(upload) = queue.front_mut() {
            let Some(call) = upload.current_call() else {
                queue.pop_front();
                continue;
            };
            let step = upload.step();
            match self.send_rpc(id, call) {
                Ok(()) => {
                    upload.advance();
                    if matches!(step, UploadStep::Chunk { .. }) {
                        self.events.emit(&HostEvent::UploadProgress {
                            role,
                            progress: upload.progress(),
                        });
                    }
                    if upload.is_done() {
                        info!(connection = id, role, len = upload.total_len(), "asset upload finished");
                        queue.pop_front();
                        self.events.emit(&HostEvent::UploadFinished { role });
                    }
                }
                Err(e) if e.is_transient() => {
                    if !upload.record_failure() {
                        warn!(connection = id, role, error = %e, "asset upload abandoned after retries");
                        queue.pop_front();
                        self.events.emit(&HostEvent::UploadAbandoned { role });
                    }
                    break;
                }
                Err(e) => {
                    warn!(connection = id, role, error = %e, "asset upload failed");
                    queue.pop_front();
                    self.events.emit(&HostEvent::UploadAbandoned { role });
                }
            }
        }

        if !queue.is_empty() {
            self.uploads.insert(id, queue);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackSocket};
    use navi_pose::Vec2;
    use navi_wire::TouchPhase;
    use std::cell::RefCell;
    use std::rc::Rc;

    const TICK: Duration = Duration::from_millis(10);

    /// Raw transport standing in for a controller.
    struct FakeDevice {
        transport: Transport<LoopbackSocket>,
        conn: Option<ConnectionId>,
        received: Vec<RpcCall>,
    }

    impl FakeDevice {
        fn new(net: &LoopbackNetwork, ip: &str) -> Self {
            let socket = net
                .bind(format!("{ip}:{SESSION_PORT}").parse().unwrap())
                .unwrap();
            Self {
                transport: Transport::bind(socket, TransportConfig::default()),
                conn: None,
                received: Vec::new(),
            }
        }

        fn pump(&mut self, now: Duration) {
            while let Some(event) = self.transport.poll(now) {
                match event {
                    TransportEvent::Connect(id) => self.conn = Some(id),
                    TransportEvent::Disconnect(_) => self.conn = None,
                    TransportEvent::Data { payload, .. } => {
                        if let Ok(WireMessage::Rpc(call)) = navi_wire::decode(&payload) {
                            self.received.push(call);
                        }
                    }
                }
            }
        }

        fn send(&mut self, message: WireMessage) {
            let id = self.conn.unwrap();
            send_message(&mut self.transport, id, &message).unwrap();
        }

        fn methods(&self) -> Vec<&str> {
            self.received.iter().map(|c| c.method.as_str()).collect()
        }
    }

    struct Rig {
        host: HostSession<LoopbackSocket>,
        devices: Vec<FakeDevice>,
        events: Rc<RefCell<Vec<HostEvent>>>,
    }

    impl Rig {
        fn new(net: &LoopbackNetwork, ips: &[&str]) -> Self {
            let socket = net.bind("10.0.0.1:0".parse().unwrap()).unwrap();
            let config = HostConfig::default();
            let host = HostSession::new(Transport::bind(socket, config.transport.clone()), config);
            let events = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&events);
            host.events().subscribe(move |e: &HostEvent| {
                if !matches!(e, HostEvent::Pose { .. }) {
                    sink.borrow_mut().push(e.clone());
                }
            });
            let devices = ips.iter().map(|ip| FakeDevice::new(net, ip)).collect();
            Self {
                host,
                devices,
                events,
            }
        }

        fn run(&mut self, duration: Duration) {
            let end = self.host.clock() + duration;
            while self.host.clock() < end {
                self.host.tick(TICK);
                let now = self.host.clock();
                for device in &mut self.devices {
                    device.pump(now);
                }
            }
        }

        fn connect_all(&mut self) {
            for ip in ["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]
                .into_iter()
                .take(self.devices.len())
            {
                self.host.connect(ip).unwrap();
                self.run(Duration::from_millis(50));
            }
        }

        fn complete_handshake(&mut self, index: usize) {
            self.devices[index].send(RpcCall::set_size(1080, 1920).into());
            self.devices[index].send(RpcCall::set_platform(1).into());
            self.run(Duration::from_millis(50));
        }

        fn touch(&mut self, index: usize, phase: TouchPhase, count: usize, hold: Duration) {
            for _ in 0..count {
                self.devices[index].send(
                    TouchEvent {
                        finger_id: 0,
                        phase,
                        position: Vec2::ZERO,
                        tap_count: 1,
                    }
                    .into(),
                );
            }
            self.run(hold);
        }
    }

    #[test]
    fn test_handshake_order_and_roles() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2", "10.0.0.3"]);
        rig.connect_all();

        for (index, device) in rig.devices.iter().enumerate() {
            assert_eq!(
                device.methods(),
                [method::ASSIGN_ROLE, method::BUILD_NO, method::SET_INSTRUCTION]
            );
            assert_eq!(device.received[0].int(0).unwrap(), index as i32);
            assert_eq!(device.received[1].int(0).unwrap(), SDK_BUILD_NO);
            assert_eq!(device.received[2].str(0).unwrap(), CONTROL_INSTRUCTIONS);
        }
        let conn = rig.host.connection_by_role(1).unwrap();
        assert_eq!(conn.state, ConnectionState::AwaitingHandshake);

        rig.complete_handshake(1);
        let conn = rig.host.connection_by_role(1).unwrap();
        assert_eq!(conn.state, ConnectionState::Active);
        assert_eq!(conn.screen, Some((1080, 1920)));
        assert_eq!(conn.platform, Some(1));
        assert!(rig.events.borrow().contains(&HostEvent::SizeChanged {
            connection: conn.id,
            role: 1,
            width: 1080,
            height: 1920
        }));
    }

    #[test]
    fn test_touch_before_handshake_ignored() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();
        rig.touch(0, TouchPhase::Began, 1, TICK * 3);
        assert!(
            !rig.events
                .borrow()
                .iter()
                .any(|e| matches!(e, HostEvent::Touch { .. }))
        );

        rig.complete_handshake(0);
        rig.touch(0, TouchPhase::Began, 1, TICK * 3);
        assert!(
            rig.events
                .borrow()
                .iter()
                .any(|e| matches!(e, HostEvent::Touch { role: 0, .. }))
        );
    }

    #[test]
    fn test_freed_role_is_reused() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2", "10.0.0.3"]);
        rig.connect_all();
        let first = rig.host.connection_by_role(0).unwrap().id;

        let device_conn = rig.devices[0].conn.unwrap();
        rig.devices[0].transport.disconnect(device_conn);
        rig.run(Duration::from_millis(50));
        assert!(rig.events.borrow().contains(&HostEvent::DeviceDisconnected {
            connection: first,
            role: 0
        }));
        assert!(rig.host.connection_by_role(0).is_none());

        rig.devices[0].received.clear();
        rig.host.connect("10.0.0.2").unwrap();
        rig.run(Duration::from_millis(50));
        assert_eq!(rig.devices[0].received[0].int(0).unwrap(), 0);
    }

    #[test]
    fn test_last_disconnect_resumes_search() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();
        let id = rig.devices[0].conn.unwrap();
        rig.devices[0].transport.disconnect(id);
        rig.run(Duration::from_millis(50));
        assert_eq!(rig.events.borrow().last(), Some(&HostEvent::SearchingResumed));
    }

    #[test]
    fn test_five_finger_tap_resets_and_starts_game_once() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();
        rig.complete_handshake(0);

        rig.touch(0, TouchPhase::Began, 5, TICK * 3);
        rig.touch(0, TouchPhase::Ended, 5, Duration::from_secs(3));
        rig.touch(0, TouchPhase::Began, 5, TICK * 3);

        let events = rig.events.borrow();
        let resets = events.iter().filter(|e| **e == HostEvent::ResetHmd).count();
        let starts = events.iter().filter(|e| **e == HostEvent::GameStart).count();
        assert_eq!((resets, starts), (2, 1));
        assert!(rig.host.connection_by_role(0).unwrap().role_switch.is_eligible());
    }

    #[test]
    fn test_role_swap_clears_finger_counts() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2", "10.0.0.3"]);
        rig.connect_all();
        rig.complete_handshake(0);
        rig.complete_handshake(1);

        rig.touch(1, TouchPhase::Began, 1, TICK * 3);
        assert_eq!(rig.host.connection_by_role(1).unwrap().gestures.fingers_down(), 1);

        rig.touch(0, TouchPhase::Began, 5, TICK * 3);
        rig.touch(0, TouchPhase::Ended, 5, TICK * 3);
        rig.touch(0, TouchPhase::Began, 2, Duration::from_millis(2100));
        rig.touch(0, TouchPhase::Stationary, 1, TICK * 3);

        assert!(
            rig.events
                .borrow()
                .contains(&HostEvent::RolesSwapped { from: 0, to: 1 })
        );
        for role in [0, 1] {
            let conn = rig.host.connection_by_role(role).unwrap();
            assert_eq!(conn.gestures.fingers_down(), 0);
        }
    }

    #[test]
    fn test_image_sent_on_fragmented_channel() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();

        let png: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        rig.host.send_image(0, png.clone()).unwrap();
        rig.run(TICK * 10);

        let call = rig.devices[0].received.last().unwrap();
        assert_eq!(call.method, method::SET_IMAGE);
        assert_eq!(call.blob(0).unwrap(), &png[..]);
        assert!(matches!(
            rig.host.send_image(2, vec![1]),
            Err(SessionError::NoConnectionForRole(2))
        ));
    }

    #[test]
    fn test_keyboard_callback_dropped_on_close() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();

        let typed = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&typed);
        rig.host
            .open_keyboard(0, move |text| sink.borrow_mut().push(text.to_string()))
            .unwrap();
        rig.run(TICK * 3);
        rig.devices[0].send(RpcCall::keyboard_text("hello").into());
        rig.run(TICK * 3);

        rig.host.close_keyboard(0).unwrap();
        rig.devices[0].send(RpcCall::keyboard_text("ignored").into());
        rig.run(TICK * 3);

        assert_eq!(*typed.borrow(), ["hello"]);
        let methods = rig.devices[0].methods();
        assert!(methods.ends_with(&[method::OPEN_KEYBOARD, method::CLOSE_KEYBOARD]));
    }

    #[test]
    fn test_scheduled_instruction_fires_or_drops() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2", "10.0.0.3"]);
        rig.connect_all();
        rig.host
            .schedule_instruction(0, "look left", Duration::from_millis(500))
            .unwrap();
        rig.host
            .schedule_instruction(1, "never", Duration::from_millis(500))
            .unwrap();
        let id = rig.devices[1].conn.unwrap();
        rig.devices[1].transport.disconnect(id);

        rig.run(Duration::from_millis(300));
        assert_eq!(rig.devices[0].received.len(), 3);
        rig.run(Duration::from_millis(300));
        let last = rig.devices[0].received.last().unwrap();
        assert_eq!(last.str(0).unwrap(), "look left");
        assert!(
            rig.devices[1]
                .received
                .iter()
                .all(|c| c.str(0).ok() != Some("never"))
        );
    }

    #[test]
    fn test_outbound_to_missing_role() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &[]);
        assert!(matches!(
            rig.host.vibrate(3),
            Err(SessionError::NoConnectionForRole(3))
        ));
        assert!(matches!(
            rig.host.connect("not-an-ip"),
            Err(SessionError::Transport(TransportError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_interpolated_pose_published() {
        let net = LoopbackNetwork::new();
        let mut rig = Rig::new(&net, &["10.0.0.2"]);
        rig.connect_all();
        let poses = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&poses);
        rig.host.events().subscribe(move |e: &HostEvent| {
            if matches!(e, HostEvent::Pose { role: 0, .. }) {
                *sink.borrow_mut() += 1;
            }
        });

        let sample = PoseSample::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::ZERO);
        rig.devices[0].send(sample.into());
        rig.run(TICK * 5);
        assert_eq!(rig.host.interpolated_pose(0), Some(sample));
        assert!(*poses.borrow() >= 4);
    }
}
