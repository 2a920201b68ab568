//! Discovery broadcaster (controller side) and listener (host side).
//!
//! The listener's socket lives on a tokio task that only receives and
//! forwards raw datagrams through an mpsc queue. Parsing and all changes to
//! the advertisement list happen in [`Listener::drain`] on the tick thread.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use navi_wire::{Advertisement, DiscoveryDatagram, discovery::RESET_COMMAND};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{DatagramSocket, bind_udp};

/// Time between advertisements while unconnected.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// Advertisements not refreshed within this window are dropped.
pub const ADVERTISEMENT_TTL: Duration = Duration::from_secs(3);

/// Pause after a failed receive before re-arming.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

const MAX_DISCOVERY_DATAGRAM: usize = 1024;

/// Raw datagram handed from the receive task to the tick thread.
pub type RawDatagram = (SocketAddr, Vec<u8>);

/// Broadcast address for `port`.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, port))
}

/// Non-blocking UDP socket with `SO_BROADCAST` set.
pub fn bind_broadcast_socket(addr: SocketAddr) -> io::Result<StdUdpSocket> {
    let socket = bind_udp(addr)?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Periodic advertiser run from the controller's tick.
pub struct Broadcaster<S> {
    socket: S,
    advertisement: Advertisement,
    target: SocketAddr,
    interval: Duration,
    last_sent: Option<Duration>,
}

impl<S: DatagramSocket> Broadcaster<S> {
    pub fn new(socket: S, advertisement: Advertisement, target: SocketAddr) -> Self {
        Self {
            socket,
            advertisement,
            target,
            interval: BROADCAST_INTERVAL,
            last_sent: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Advertise if due. Never sends while `connected`, and sends on the
    /// first tick after the connection drops.
    pub fn tick(&mut self, now: Duration, connected: bool) -> bool {
        if connected {
            self.last_sent = None;
            return false;
        }
        if self
            .last_sent
            .is_some_and(|last| now.saturating_sub(last) < self.interval)
        {
            return false;
        }
        self.last_sent = Some(now);
        match self
            .socket
            .send_to(&self.advertisement.to_datagram(), self.target)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(target_addr = %self.target, error = %e, "advertisement send failed");
                false
            }
        }
    }

    /// Broadcast the reset control string.
    pub fn send_reset(&mut self) -> io::Result<()> {
        self.socket.send_to(RESET_COMMAND.as_bytes(), self.target)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// A live advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub application_name: String,
    pub ip_address: String,
}

impl From<Advertisement> for DiscoveryRecord {
    fn from(ad: Advertisement) -> Self {
        Self {
            application_name: ad.application_name,
            ip_address: ad.ip_address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer asked for a pose reset.
    Reset { from: SocketAddr },
    /// A new advertisement appeared.
    Discovered(DiscoveryRecord),
}

#[derive(Debug)]
struct Tracked {
    record: DiscoveryRecord,
    last_seen: Duration,
}

pub struct Listener {
    rx: mpsc::UnboundedReceiver<RawDatagram>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    records: Vec<Tracked>,
}

impl Listener {
    /// Bind `addr` and spawn the receive loop on `handle`.
    pub fn bind(addr: SocketAddr, handle: &Handle) -> io::Result<Self> {
        let std_socket = StdUdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket)?
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = handle.spawn(receive_loop(socket, tx));
        info!(%local_addr, "discovery listener bound");
        Ok(Self {
            rx,
            task: Some(task),
            local_addr: Some(local_addr),
            records: Vec::new(),
        })
    }

    /// A listener fed by hand through the returned sender.
    pub fn detached() -> (Self, mpsc::UnboundedSender<RawDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            rx,
            task: None,
            local_addr: None,
            records: Vec::new(),
        };
        (listener, tx)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Parse everything queued since the last call and expire stale records.
    pub fn drain(&mut self, now: Duration) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        while let Ok((from, bytes)) = self.rx.try_recv() {
            match DiscoveryDatagram::parse(&bytes) {
                Ok(DiscoveryDatagram::Reset) => events.push(DiscoveryEvent::Reset { from }),
                Ok(DiscoveryDatagram::Advertisement(ad)) => {
                    if let Some(known) = self
                        .records
                        .iter_mut()
                        .find(|t| t.record.ip_address == ad.ip_address)
                    {
                        known.record.application_name = ad.application_name;
                        known.last_seen = now;
                        continue;
                    }
                    let record = DiscoveryRecord::from(ad);
                    debug!(ip = %record.ip_address, name = %record.application_name, "controller discovered");
                    events.push(DiscoveryEvent::Discovered(record.clone()));
                    self.records.push(Tracked {
                        record,
                        last_seen: now,
                    });
                }
                Err(e) => debug!(%from, error = %e, "ignoring malformed discovery datagram"),
            }
        }
        self.records
            .retain(|t| now.saturating_sub(t.last_seen) <= ADVERTISEMENT_TTL);
        events
    }

    /// Live advertisements, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &DiscoveryRecord> {
        self.records.iter().map(|t| &t.record)
    }

    /// Remove and return the advertisement for `ip`.
    pub fn take(&mut self, ip: &str) -> Option<DiscoveryRecord> {
        let index = self.records.iter().position(|t| t.record.ip_address == ip)?;
        Some(self.records.remove(index).record)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn receive_loop(socket: UdpSocket, tx: mpsc::UnboundedSender<RawDatagram>) {
    let mut buf = vec![0u8; MAX_DISCOVERY_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if tx.send((from, buf[..len].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
            }
        }
    }
}
