//! In-process datagram network for driving sessions without real sockets.
//!
//! Sockets bound on one [`LoopbackNetwork`] exchange datagrams through
//! shared inboxes. Loss and link outages can be injected to exercise the
//! transport's recovery paths deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::DatagramSocket;

const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug, Default)]
struct NetworkState {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    links_down: HashSet<SocketAddr>,
    drop_every: Option<u32>,
    sent: u32,
    next_port: u16,
}

/// Shared handle to an in-process network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a socket. Port 0 picks a free ephemeral port.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<LoopbackSocket> {
        let mut state = self.lock();
        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                let port = EPHEMERAL_PORT_START.saturating_add(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                let candidate = SocketAddr::new(addr.ip(), port);
                if !state.inboxes.contains_key(&candidate) {
                    addr = candidate;
                    break;
                }
            }
        }
        if state.inboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        state.inboxes.insert(addr, VecDeque::new());
        Ok(LoopbackSocket {
            addr,
            network: self.clone(),
        })
    }

    /// Drop every `n`th datagram sent on the network. `None` disables loss.
    pub fn set_drop_every(&self, n: Option<u32>) {
        let mut state = self.lock();
        state.drop_every = n.filter(|&n| n > 0);
        state.sent = 0;
    }

    /// Silently discard everything sent to or from `addr`.
    pub fn set_link_down(&self, addr: SocketAddr, down: bool) {
        let mut state = self.lock();
        if down {
            state.links_down.insert(addr);
        } else {
            state.links_down.remove(&addr);
        }
    }

    /// Datagrams waiting to be read at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().inboxes.get(&addr).map_or(0, VecDeque::len)
    }
}

/// A socket on a [`LoopbackNetwork`]. Unbinds on drop.
#[derive(Debug)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    network: LoopbackNetwork,
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        self.network.lock().inboxes.remove(&self.addr);
    }
}

impl DatagramSocket for LoopbackSocket {
    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
        let mut state = self.network.lock();
        if state.links_down.contains(&self.addr) || state.links_down.contains(&addr) {
            return Ok(());
        }
        state.sent = state.sent.wrapping_add(1);
        if let Some(n) = state.drop_every
            && state.sent % n == 0
        {
            return Ok(());
        }

        let from = self.addr;
        if addr.ip() == Ipv4Addr::BROADCAST {
            for (target, inbox) in state.inboxes.iter_mut() {
                if target.port() == addr.port() && *target != from {
                    inbox.push_back((from, payload.to_vec()));
                }
            }
        } else if let Some(inbox) = state.inboxes.get_mut(&addr) {
            inbox.push_back((from, payload.to_vec()));
        }
        Ok(())
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.lock();
        let Some((from, datagram)) = state
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
