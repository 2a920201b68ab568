//! Connection-oriented, multi-channel transport over a datagram socket.
//!
//! # Packet Layout
//!
//! ```text
//! [PROTOCOL_ID][kind]                                   Connect, Accept, Ping, Disconnect
//! [PROTOCOL_ID][kind][channel][seq u32 LE]               Ack
//! [PROTOCOL_ID][kind][channel][seq u32 LE][payload..]    Data
//! ```
//!
//! Data on a reliable-fragmented channel carries an extra
//! `[index u16 LE][count u16 LE]` header in front of each fragment body.
//!
//! # Channels
//!
//! - **ReliableOrdered**: acked per packet, resent after `resend_interval`,
//!   delivered in order through a bounded reorder window.
//! - **Unreliable**: sequence stamped. Anything older than the newest packet
//!   seen is dropped, so consumers only ever see the latest value.
//! - **ReliableFragmented**: payload split into fragments that travel like
//!   reliable-ordered packets and are reassembled before delivery.
//!
//! The transport never blocks. [`Transport::poll`] reads every pending
//! datagram, services timers and hands out one event at a time; callers
//! drain it in a loop each tick.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::TransportError;

/// Opaque connection handle, unique per transport.
pub type ConnectionId = u32;

/// Index into [`TransportConfig::channels`].
pub type ChannelId = u8;

// ============================================================================
// Parameters
// ============================================================================

/// First byte of every transport datagram.
pub const PROTOCOL_ID: u8 = 0x4e;

/// Unacked reliable packets are resent after this long.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Unacked packets allowed per reliable channel before sends are refused.
pub const MAX_IN_FLIGHT: usize = 64;

/// Outbound connect attempts give up after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `Ping` is sent after this much outbound silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// A peer is dropped after this much inbound silence.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram the transport will emit.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Reliable packets further than this ahead of the next expected sequence
/// are dropped unacked and left to the sender's resend.
pub const REORDER_WINDOW: u32 = 256;

/// Default connection capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

const CONTROL_HEADER_LEN: usize = 2;
const DATA_HEADER_LEN: usize = 7;
const FRAGMENT_HEADER_LEN: usize = 4;

/// Largest fragment body with the default datagram size.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM_SIZE - DATA_HEADER_LEN - FRAGMENT_HEADER_LEN;

// ============================================================================
// Configuration
// ============================================================================

/// Delivery guarantee of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    ReliableOrdered,
    Unreliable,
    ReliableFragmented,
}

impl ChannelKind {
    fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Channel layout shared by every connection. The channel id is the index.
    pub channels: Vec<ChannelKind>,
    pub max_connections: usize,
    pub max_datagram_size: usize,
    pub max_in_flight: usize,
    pub resend_interval: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelKind::ReliableOrdered,
                ChannelKind::Unreliable,
                ChannelKind::ReliableFragmented,
            ],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            max_in_flight: MAX_IN_FLIGHT,
            resend_interval: RESEND_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
        }
    }
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(ConnectionId),
    Data {
        connection: ConnectionId,
        channel: ChannelId,
        payload: Vec<u8>,
    },
    Disconnect(ConnectionId),
}

// ============================================================================
// Sockets
// ============================================================================

/// Non-blocking datagram socket.
pub trait DatagramSocket {
    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Receive one datagram, `Ok(None)` when nothing is pending.
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, payload, addr).map(|_| ())
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a non-blocking UDP socket.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Connect = 1,
    Accept = 2,
    Data = 3,
    Ack = 4,
    Ping = 5,
    Disconnect = 6,
}

impl PacketKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Connect),
            2 => Some(Self::Accept),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Ping),
            6 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Packet<'a> {
    Connect,
    Accept,
    Data {
        channel: ChannelId,
        seq: u32,
        payload: &'a [u8],
    },
    Ack {
        channel: ChannelId,
        seq: u32,
    },
    Ping,
    Disconnect,
}

impl<'a> Packet<'a> {
    fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < CONTROL_HEADER_LEN || buf[0] != PROTOCOL_ID {
            return None;
        }
        let kind = PacketKind::from_byte(buf[1])?;
        let sequenced = || -> Option<(ChannelId, u32)> {
            if buf.len() < DATA_HEADER_LEN {
                return None;
            }
            let seq = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
            Some((buf[2], seq))
        };
        Some(match kind {
            PacketKind::Connect => Self::Connect,
            PacketKind::Accept => Self::Accept,
            PacketKind::Ping => Self::Ping,
            PacketKind::Disconnect => Self::Disconnect,
            PacketKind::Ack => {
                let (channel, seq) = sequenced()?;
                Self::Ack { channel, seq }
            }
            PacketKind::Data => {
                let (channel, seq) = sequenced()?;
                Self::Data {
                    channel,
                    seq,
                    payload: &buf[DATA_HEADER_LEN..],
                }
            }
        })
    }
}

fn encode_control(kind: PacketKind) -> [u8; CONTROL_HEADER_LEN] {
    [PROTOCOL_ID, kind as u8]
}

fn encode_sequenced(kind: PacketKind, channel: ChannelId, seq: u32, body: &[&[u8]]) -> Vec<u8> {
    let body_len: usize = body.iter().map(|part| part.len()).sum();
    let mut out = Vec::with_capacity(DATA_HEADER_LEN + body_len);
    out.push(PROTOCOL_ID);
    out.push(kind as u8);
    out.push(channel);
    out.extend_from_slice(&seq.to_le_bytes());
    for part in body {
        out.extend_from_slice(part);
    }
    out
}

/// Wrapping "a is newer than b".
fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

// ============================================================================
// Peer state
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum PeerState {
    Connecting {
        started: Duration,
        last_attempt: Duration,
    },
    Connected,
}

#[derive(Debug)]
struct InFlight {
    packet: Vec<u8>,
    last_sent: Duration,
}

#[derive(Debug)]
struct Assembly {
    expected: u16,
    next_index: u16,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct Channel {
    kind: ChannelKind,
    next_send_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
    next_recv_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    newest_unreliable: Option<u32>,
    assembly: Option<Assembly>,
}

impl Channel {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            next_send_seq: 0,
            in_flight: BTreeMap::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            newest_unreliable: None,
            assembly: None,
        }
    }

    /// Feed one in-order fragment; returns the payload once complete.
    fn reassemble(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        if fragment.len() < FRAGMENT_HEADER_LEN {
            warn!(len = fragment.len(), "fragment shorter than its header");
            self.assembly = None;
            return None;
        }
        let index = u16::from_le_bytes([fragment[0], fragment[1]]);
        let count = u16::from_le_bytes([fragment[2], fragment[3]]);
        let body = &fragment[FRAGMENT_HEADER_LEN..];

        if index == 0 {
            self.assembly = Some(Assembly {
                expected: count,
                next_index: 0,
                bytes: Vec::new(),
            });
        }
        let Some(assembly) = self.assembly.as_mut() else {
            warn!(index, count, "fragment without a started payload");
            return None;
        };
        if count == 0 || index != assembly.next_index || count != assembly.expected {
            warn!(index, count, "fragment out of sequence, payload dropped");
            self.assembly = None;
            return None;
        }
        assembly.bytes.extend_from_slice(body);
        assembly.next_index += 1;
        if assembly.next_index == assembly.expected {
            return self.assembly.take().map(|a| a.bytes);
        }
        None
    }
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    state: PeerState,
    last_recv: Duration,
    last_send: Duration,
    /// Data or Ack arrived since the connection was established.
    heard_data: bool,
    channels: Vec<Channel>,
}

// ============================================================================
// Transport
// ============================================================================

/// A transport host bound to one socket.
pub struct Transport<S> {
    socket: S,
    config: TransportConfig,
    peers: HashMap<ConnectionId, Peer>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: ConnectionId,
    events: VecDeque<TransportEvent>,
    recv_buf: Vec<u8>,
    clock: Duration,
}

impl<S: DatagramSocket> Transport<S> {
    /// Create a transport host on an already bound socket.
    pub fn bind(socket: S, config: TransportConfig) -> Self {
        let recv_buf = vec![0u8; config.max_datagram_size.max(DATA_HEADER_LEN)];
        Self {
            socket,
            config,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
            events: VecDeque::new(),
            recv_buf,
            clock: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Established and pending connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.peers
            .get(&id)
            .is_some_and(|p| matches!(p.state, PeerState::Connected))
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.peers.get(&id).map(|p| p.addr)
    }

    /// Unacked packets on a channel.
    pub fn in_flight(&self, id: ConnectionId, channel: ChannelId) -> usize {
        self.peers
            .get(&id)
            .and_then(|p| p.channels.get(usize::from(channel)))
            .map_or(0, |c| c.in_flight.len())
    }

    /// Start connecting to `addr`. A `Connect` event follows once accepted,
    /// or a `Disconnect` event after `connect_timeout`.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Ok(id);
        }
        if self.peers.len() >= self.config.max_connections {
            return Err(TransportError::CapacityReached(self.config.max_connections));
        }
        let now = self.clock;
        let id = self.insert_peer(
            addr,
            PeerState::Connecting {
                started: now,
                last_attempt: now,
            },
        );
        debug!(connection = id, %addr, "connecting");
        self.send_control(id, PacketKind::Connect);
        Ok(id)
    }

    /// Send `payload` on `channel`.
    pub fn send(
        &mut self,
        id: ConnectionId,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let now = self.clock;
        let Self {
            socket,
            config,
            peers,
            ..
        } = self;
        let peer = peers
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        if !matches!(peer.state, PeerState::Connected) {
            return Err(TransportError::NotConnected(id));
        }
        let addr = peer.addr;
        let ch = peer
            .channels
            .get_mut(usize::from(channel))
            .ok_or(TransportError::UnknownChannel(channel))?;
        let limit = config.max_datagram_size - DATA_HEADER_LEN;

        match ch.kind {
            ChannelKind::Unreliable => {
                if payload.len() > limit {
                    return Err(TransportError::PayloadTooLarge {
                        len: payload.len(),
                        limit,
                    });
                }
                let seq = ch.next_send_seq;
                ch.next_send_seq = seq.wrapping_add(1);
                socket.send_to(
                    &encode_sequenced(PacketKind::Data, channel, seq, &[payload]),
                    addr,
                )?;
            }
            ChannelKind::ReliableOrdered => {
                if payload.len() > limit {
                    return Err(TransportError::PayloadTooLarge {
                        len: payload.len(),
                        limit,
                    });
                }
                if ch.in_flight.len() >= config.max_in_flight {
                    return Err(TransportError::Backpressure {
                        connection: id,
                        channel,
                    });
                }
                let packet = encode_sequenced(PacketKind::Data, channel, ch.next_send_seq, &[payload]);
                queue_reliable(socket, addr, ch, packet, now);
            }
            ChannelKind::ReliableFragmented => {
                let fragment_limit = limit - FRAGMENT_HEADER_LEN;
                let max_fragments = config.max_in_flight.min(usize::from(u16::MAX));
                let count = payload.len().div_ceil(fragment_limit).max(1);
                if count > max_fragments {
                    return Err(TransportError::PayloadTooLarge {
                        len: payload.len(),
                        limit: fragment_limit * max_fragments,
                    });
                }
                if ch.in_flight.len() + count > config.max_in_flight {
                    return Err(TransportError::Backpressure {
                        connection: id,
                        channel,
                    });
                }
                let bodies: Vec<&[u8]> = if payload.is_empty() {
                    vec![payload]
                } else {
                    payload.chunks(fragment_limit).collect()
                };
                // count <= u16::MAX was checked above
                let count = count as u16;
                for (index, body) in bodies.into_iter().enumerate() {
                    let header_index = (index as u16).to_le_bytes();
                    let header_count = count.to_le_bytes();
                    let packet = encode_sequenced(
                        PacketKind::Data,
                        channel,
                        ch.next_send_seq,
                        &[&header_index[..], &header_count[..], body],
                    );
                    queue_reliable(socket, addr, ch, packet, now);
                }
            }
        }
        peer.last_send = now;
        Ok(())
    }

    /// Close a connection. Emits exactly one `Disconnect` event for it.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        if !self.peers.contains_key(&id) {
            return false;
        }
        self.send_control(id, PacketKind::Disconnect);
        self.drop_peer(id, "local disconnect");
        true
    }

    /// Next transport event at local time `now`. Drain until `None`.
    pub fn poll(&mut self, now: Duration) -> Option<TransportEvent> {
        self.clock = self.clock.max(now);
        if self.events.is_empty() {
            self.receive_all();
            self.service_timers();
        }
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn insert_peer(&mut self, addr: SocketAddr, state: PeerState) -> ConnectionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let now = self.clock;
        self.peers.insert(
            id,
            Peer {
                addr,
                state,
                last_recv: now,
                last_send: now,
                heard_data: false,
                channels: self.config.channels.iter().map(|&k| Channel::new(k)).collect(),
            },
        );
        self.by_addr.insert(addr, id);
        id
    }

    fn drop_peer(&mut self, id: ConnectionId, reason: &'static str) {
        if let Some(peer) = self.peers.remove(&id) {
            self.by_addr.remove(&peer.addr);
            info!(connection = id, addr = %peer.addr, reason, "connection closed");
            self.events.push_back(TransportEvent::Disconnect(id));
        }
    }

    fn send_control(&mut self, id: ConnectionId, kind: PacketKind) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if let Err(e) = self.socket.send_to(&encode_control(kind), peer.addr) {
            debug!(connection = id, error = %e, ?kind, "control send failed");
        }
        peer.last_send = self.clock;
    }

    fn promote(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&id)
            && matches!(peer.state, PeerState::Connecting { .. })
        {
            peer.state = PeerState::Connected;
            info!(connection = id, addr = %peer.addr, "connection established");
            self.events.push_back(TransportEvent::Connect(id));
        }
    }

    fn receive_all(&mut self) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => self.handle_datagram(from, &buf[..len]),
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(error = %e, "datagram receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(packet) = Packet::parse(datagram) else {
            trace!(%from, len = datagram.len(), "ignoring malformed datagram");
            return;
        };

        if packet == Packet::Connect {
            self.handle_connect(from);
            return;
        }

        let Some(&id) = self.by_addr.get(&from) else {
            trace!(%from, "datagram from unknown peer");
            return;
        };
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_recv = self.clock;
            if matches!(packet, Packet::Data { .. } | Packet::Ack { .. }) {
                peer.heard_data = true;
            }
        }

        match packet {
            Packet::Connect | Packet::Ping => {}
            Packet::Accept => self.promote(id),
            Packet::Data {
                channel,
                seq,
                payload,
            } => {
                // Data before Accept means the Accept was lost.
                self.promote(id);
                self.handle_data(id, channel, seq, payload);
            }
            Packet::Ack { channel, seq } => {
                if let Some(ch) = self
                    .peers
                    .get_mut(&id)
                    .and_then(|p| p.channels.get_mut(usize::from(channel)))
                {
                    ch.in_flight.remove(&seq);
                }
            }
            Packet::Disconnect => self.drop_peer(id, "remote disconnect"),
        }
    }

    fn handle_connect(&mut self, from: SocketAddr) {
        if let Some(&id) = self.by_addr.get(&from) {
            let restarted = self
                .peers
                .get(&id)
                .is_some_and(|p| p.heard_data && matches!(p.state, PeerState::Connected));
            if !restarted {
                // Retransmitted or simultaneous connect.
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.last_recv = self.clock;
                }
                self.promote(id);
                self.send_control(id, PacketKind::Accept);
                return;
            }
            // A connected remote never sends Connect again, so this is a new
            // instance at the same address. Its sequences start over.
            self.drop_peer(id, "remote restarted");
        }
        if self.peers.len() >= self.config.max_connections {
            debug!(%from, max = self.config.max_connections, "connect ignored at capacity");
            return;
        }
        let id = self.insert_peer(from, PeerState::Connected);
        self.send_control(id, PacketKind::Accept);
        info!(connection = id, addr = %from, "connection accepted");
        self.events.push_back(TransportEvent::Connect(id));
    }

    fn handle_data(&mut self, id: ConnectionId, channel: ChannelId, seq: u32, payload: &[u8]) {
        let Self {
            socket,
            peers,
            events,
            ..
        } = self;
        let Some(peer) = peers.get_mut(&id) else {
            return;
        };
        let addr = peer.addr;
        let Some(ch) = peer.channels.get_mut(usize::from(channel)) else {
            debug!(connection = id, channel, "data on unknown channel");
            return;
        };

        if !ch.kind.is_reliable() {
            if ch.newest_unreliable.is_some_and(|newest| !seq_newer(seq, newest)) {
                trace!(connection = id, channel, seq, "stale unreliable packet dropped");
                return;
            }
            ch.newest_unreliable = Some(seq);
            events.push_back(TransportEvent::Data {
                connection: id,
                channel,
                payload: payload.to_vec(),
            });
            return;
        }

        let ahead = seq.wrapping_sub(ch.next_recv_seq);
        if ahead >= u32::MAX / 2 {
            // Already delivered; the ack was lost.
            send_ack(socket, addr, channel, seq);
            return;
        }
        if ahead >= REORDER_WINDOW {
            trace!(connection = id, channel, seq, "packet beyond reorder window");
            return;
        }
        send_ack(socket, addr, channel, seq);
        ch.reorder.entry(seq).or_insert_with(|| payload.to_vec());

        while let Some(packet) = ch.reorder.remove(&ch.next_recv_seq) {
            ch.next_recv_seq = ch.next_recv_seq.wrapping_add(1);
            let delivered = match ch.kind {
                ChannelKind::ReliableFragmented => ch.reassemble(&packet),
                _ => Some(packet),
            };
            if let Some(payload) = delivered {
                events.push_back(TransportEvent::Data {
                    connection: id,
                    channel,
                    payload,
                });
            }
        }
    }

    fn service_timers(&mut self) {
        let now = self.clock;
        let Self {
            socket,
            config,
            peers,
            ..
        } = self;
        let mut expired = Vec::new();

        for (&id, peer) in peers.iter_mut() {
            match peer.state {
                PeerState::Connecting {
                    started,
                    last_attempt,
                } => {
                    if now.saturating_sub(started) >= config.connect_timeout {
                        expired.push((id, "connect timed out"));
                        continue;
                    }
                    if now.saturating_sub(last_attempt) >= config.resend_interval {
                        if let Err(e) = socket.send_to(&encode_control(PacketKind::Connect), peer.addr)
                        {
                            debug!(connection = id, error = %e, "connect resend failed");
                        }
                        peer.state = PeerState::Connecting {
                            started,
                            last_attempt: now,
                        };
                        peer.last_send = now;
                    }
                }
                PeerState::Connected => {
                    if now.saturating_sub(peer.last_recv) >= config.peer_timeout {
                        expired.push((id, "peer timed out"));
                        continue;
                    }
                    for ch in &mut peer.channels {
                        for (seq, pending) in ch.in_flight.iter_mut() {
                            if now.saturating_sub(pending.last_sent) < config.resend_interval {
                                continue;
                            }
                            trace!(connection = id, seq, "resending");
                            if let Err(e) = socket.send_to(&pending.packet, peer.addr) {
                                debug!(connection = id, error = %e, "resend failed");
                            }
                            pending.last_sent = now;
                            peer.last_send = now;
                        }
                    }
                    if now.saturating_sub(peer.last_send) >= config.keepalive_interval {
                        if let Err(e) = socket.send_to(&encode_control(PacketKind::Ping), peer.addr) {
                            debug!(connection = id, error = %e, "keepalive failed");
                        }
                        peer.last_send = now;
                    }
                }
            }
        }

        for (id, reason) in expired {
            self.drop_peer(id, reason);
        }
    }
}

fn queue_reliable<S: DatagramSocket>(
    socket: &mut S,
    addr: SocketAddr,
    ch: &mut Channel,
    packet: Vec<u8>,
    now: Duration,
) {
    let seq = ch.next_send_seq;
    ch.next_send_seq = seq.wrapping_add(1);
    // A failed first send is covered by the resend timer.
    if let Err(e) = socket.send_to(&packet, addr) {
        debug!(%addr, seq, error = %e, "reliable send deferred to resend");
    }
    ch.in_flight.insert(
        seq,
        InFlight {
            packet,
            last_sent: now,
        },
    );
}

fn send_ack<S: DatagramSocket>(socket: &mut S, addr: SocketAddr, channel: ChannelId, seq: u32) {
    let ack = encode_sequenced(PacketKind::Ack, channel, seq, &[]);
    if let Err(e) = socket.send_to(&ack, addr) {
        debug!(%addr, seq, error = %e, "ack send failed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackSocket};

    const RELIABLE: ChannelId = 0;
    const UNRELIABLE: ChannelId = 1;
    const FRAGMENTED: ChannelId = 2;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pair(net: &LoopbackNetwork) -> (Transport<LoopbackSocket>, Transport<LoopbackSocket>) {
        let a = Transport::bind(net.bind(addr("10.0.0.1:8888")).unwrap(), TransportConfig::default());
        let b = Transport::bind(net.bind(addr("10.0.0.2:8888")).unwrap(), TransportConfig::default());
        (a, b)
    }

    fn drain(t: &mut Transport<LoopbackSocket>, now: Duration) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Some(event) = t.poll(now) {
            out.push(event);
        }
        out
    }

    /// Step both sides in 10 ms increments, collecting events.
    fn run(
        a: &mut Transport<LoopbackSocket>,
        b: &mut Transport<LoopbackSocket>,
        from: Duration,
        until: Duration,
    ) -> (Vec<TransportEvent>, Vec<TransportEvent>) {
        let (mut ea, mut eb) = (Vec::new(), Vec::new());
        let mut now = from;
        while now <= until {
            ea.extend(drain(a, now));
            eb.extend(drain(b, now));
            now += Duration::from_millis(10);
        }
        (ea, eb)
    }

    fn connected(
        net: &LoopbackNetwork,
    ) -> (Transport<LoopbackSocket>, Transport<LoopbackSocket>, ConnectionId, ConnectionId) {
        let (mut a, mut b) = pair(net);
        let id_a = a.connect(addr("10.0.0.2:8888")).unwrap();
        let (ea, eb) = run(&mut a, &mut b, Duration::ZERO, Duration::from_millis(50));
        assert_eq!(ea, vec![TransportEvent::Connect(id_a)]);
        let [TransportEvent::Connect(id_b)] = eb.as_slice() else {
            panic!("expected one connect on the accepting side, got {eb:?}");
        };
        (a, b, id_a, *id_b)
    }

    fn payloads(events: &[TransportEvent], on: ChannelId) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Data {
                    channel, payload, ..
                } if *channel == on => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_packet_parse_rejects_foreign_datagrams() {
        assert_eq!(Packet::parse(b""), None);
        assert_eq!(Packet::parse(b"Navi|10.0.0.1"), None);
        assert_eq!(Packet::parse(&[PROTOCOL_ID, 99]), None);
        assert_eq!(Packet::parse(&[PROTOCOL_ID, PacketKind::Data as u8, 0, 1]), None);
        assert_eq!(
            Packet::parse(&encode_control(PacketKind::Ping)),
            Some(Packet::Ping)
        );
    }

    #[test]
    fn test_connect_handshake() {
        let net = LoopbackNetwork::new();
        let (a, b, id_a, id_b) = connected(&net);
        assert!(a.is_connected(id_a));
        assert!(b.is_connected(id_b));
        assert_eq!(b.peer_addr(id_b), Some(addr("10.0.0.1:8888")));
    }

    #[test]
    fn test_restarted_peer_gets_fresh_channels() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, id_b) = connected(&net);
        a.send(id_a, RELIABLE, &[1]).unwrap();
        let (_, eb) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_millis(200));
        assert_eq!(payloads(&eb, RELIABLE), vec![vec![1]]);

        drop(a);
        let mut a = Transport::bind(net.bind(addr("10.0.0.1:8888")).unwrap(), TransportConfig::default());
        let id_a = a.connect(addr("10.0.0.2:8888")).unwrap();
        let (ea, eb) = run(&mut a, &mut b, Duration::from_millis(210), Duration::from_millis(300));
        assert_eq!(ea, vec![TransportEvent::Connect(id_a)]);
        let [TransportEvent::Disconnect(old), TransportEvent::Connect(new_b)] = eb.as_slice() else {
            panic!("expected the stale peer replaced, got {eb:?}");
        };
        assert_eq!(*old, id_b);
        assert_ne!(*new_b, id_b);

        a.send(id_a, RELIABLE, &[2]).unwrap();
        let (_, eb) = run(&mut a, &mut b, Duration::from_millis(310), Duration::from_millis(500));
        assert_eq!(payloads(&eb, RELIABLE), vec![vec![2]]);
        assert_eq!(b.connection_count(), 1);
    }

    #[test]
    fn test_reliable_in_order_under_loss() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, _) = connected(&net);
        net.set_drop_every(Some(3));

        for i in 0..40u8 {
            a.send(id_a, RELIABLE, &[i]).unwrap();
        }
        let (_, eb) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_secs(3));
        let expected: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i]).collect();
        assert_eq!(payloads(&eb, RELIABLE), expected);
        assert_eq!(a.in_flight(id_a, RELIABLE), 0);
    }

    #[test]
    fn test_unreliable_drops_stale() {
        let net = LoopbackNetwork::new();
        let (_a, mut b, _, _) = connected(&net);
        drop(_a);
        // Re-bind the peer address to inject raw packets.
        let mut raw = net.bind(addr("10.0.0.1:8888")).unwrap();
        let target = addr("10.0.0.2:8888");
        for seq in [5u32, 3, 6, 6, 4, 7] {
            let packet = encode_sequenced(PacketKind::Data, UNRELIABLE, seq, &[&[seq as u8][..]]);
            raw.send_to(&packet, target).unwrap();
        }
        let events = drain(&mut b, Duration::from_millis(60));
        assert_eq!(payloads(&events, UNRELIABLE), vec![vec![5], vec![6], vec![7]]);
    }

    #[test]
    fn test_fragmented_payload_reassembled_under_loss() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, _) = connected(&net);
        net.set_drop_every(Some(4));

        let big: Vec<u8> = (0..30_000u32).map(|i| (i % 253) as u8).collect();
        a.send(id_a, FRAGMENTED, &big).unwrap();
        a.send(id_a, FRAGMENTED, &[]).unwrap();
        let (_, eb) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_secs(3));
        assert_eq!(payloads(&eb, FRAGMENTED), vec![big, Vec::new()]);
    }

    #[test]
    fn test_backpressure_is_transient() {
        let net = LoopbackNetwork::new();
        let (mut a, _b, id_a, _) = connected(&net);
        for _ in 0..MAX_IN_FLIGHT {
            a.send(id_a, RELIABLE, b"x").unwrap();
        }
        let err = a.send(id_a, RELIABLE, b"x").unwrap_err();
        assert!(err.is_transient(), "{err}");
        // Unreliable traffic is not held back.
        a.send(id_a, UNRELIABLE, b"pose").unwrap();
    }

    #[test]
    fn test_payload_limits() {
        let net = LoopbackNetwork::new();
        let (mut a, _b, id_a, _) = connected(&net);
        let too_big = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(matches!(
            a.send(id_a, RELIABLE, &too_big),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            a.send(id_a, UNRELIABLE, &too_big),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        let huge = vec![0u8; MAX_FRAGMENT_PAYLOAD * (MAX_IN_FLIGHT + 1)];
        assert!(matches!(
            a.send(id_a, FRAGMENTED, &huge),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            a.send(id_a, 9, b"x"),
            Err(TransportError::UnknownChannel(9))
        ));
        assert!(matches!(
            a.send(999, RELIABLE, b"x"),
            Err(TransportError::UnknownConnection(999))
        ));
    }

    #[test]
    fn test_connect_timeout_emits_disconnect() {
        let net = LoopbackNetwork::new();
        let mut a = Transport::bind(net.bind(addr("10.0.0.1:8888")).unwrap(), TransportConfig::default());
        let id = a.connect(addr("10.0.0.9:8888")).unwrap();
        assert!(matches!(
            a.send(id, RELIABLE, b"x"),
            Err(TransportError::NotConnected(_))
        ));

        assert!(drain(&mut a, Duration::from_secs(1)).is_empty());
        let events = drain(&mut a, CONNECT_TIMEOUT);
        assert_eq!(events, vec![TransportEvent::Disconnect(id)]);
        assert_eq!(a.connection_count(), 0);
    }

    #[test]
    fn test_peer_timeout_disconnects_once() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, id_b) = connected(&net);
        net.set_link_down(addr("10.0.0.2:8888"), true);

        let (ea, _) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_secs(8));
        let disconnects: Vec<_> = ea
            .iter()
            .filter(|e| matches!(e, TransportEvent::Disconnect(_)))
            .collect();
        assert_eq!(disconnects, vec![&TransportEvent::Disconnect(id_a)]);
        assert!(!b.is_connected(id_b));
    }

    #[test]
    fn test_keepalive_holds_idle_connection() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, id_b) = connected(&net);
        let (ea, eb) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_secs(12));
        assert!(ea.is_empty() && eb.is_empty());
        assert!(a.is_connected(id_a) && b.is_connected(id_b));
    }

    #[test]
    fn test_local_disconnect_notifies_both_sides() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b, id_a, id_b) = connected(&net);
        assert!(a.disconnect(id_a));
        assert!(!a.disconnect(id_a));

        let (ea, eb) = run(&mut a, &mut b, Duration::from_millis(60), Duration::from_millis(100));
        assert_eq!(ea, vec![TransportEvent::Disconnect(id_a)]);
        assert_eq!(eb, vec![TransportEvent::Disconnect(id_b)]);
    }

    #[test]
    fn test_capacity_ignores_extra_connects() {
        let net = LoopbackNetwork::new();
        let config = TransportConfig {
            max_connections: 1,
            ..TransportConfig::default()
        };
        let mut host = Transport::bind(net.bind(addr("10.0.0.1:8888")).unwrap(), config);
        let mut c1 = Transport::bind(net.bind(addr("10.0.0.2:8888")).unwrap(), TransportConfig::default());
        let mut c2 = Transport::bind(net.bind(addr("10.0.0.3:8888")).unwrap(), TransportConfig::default());
        c1.connect(addr("10.0.0.1:8888")).unwrap();
        let late = c2.connect(addr("10.0.0.1:8888")).unwrap();

        let mut host_events = Vec::new();
        let mut late_events = Vec::new();
        let mut now = Duration::ZERO;
        while now <= CONNECT_TIMEOUT + Duration::from_millis(100) {
            host_events.extend(drain(&mut host, now));
            drain(&mut c1, now);
            late_events.extend(drain(&mut c2, now));
            now += Duration::from_millis(50);
        }
        assert_eq!(host_events.len(), 1);
        assert_eq!(late_events, vec![TransportEvent::Disconnect(late)]);
    }
}
