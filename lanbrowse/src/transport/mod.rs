mod memory;
mod udp;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use udp::UdpTransport;

/// Datagrams buffered per member before a slow reader starts losing them
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Arc<[u8]>,
    pub source: SocketAddr,
}

/// What the socket reader publishes to members
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Datagram(Datagram),
    /// The socket failed; members should give up
    Failed(String),
}

/// Handle for one joined group. Must be given back through
/// [`Transport::leave`] so the shared membership count stays right.
#[derive(Debug)]
pub struct Membership {
    id: u64,
    group: SocketAddrV4,
    inbound: broadcast::Receiver<Inbound>,
}

impl Membership {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }
}

/// Multicast capability. Memberships of one group share a socket: joined on
/// the first `join`, left on the last `leave`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Joins `group`, failing with `Unavailable` when the membership cannot
    /// be established
    async fn join(&self, group: SocketAddrV4) -> Result<Membership, TransportError>;

    /// Sends one datagram to the membership's group
    async fn send(&self, membership: &Membership, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram. Cancel-safe: dropping the future loses
    /// nothing.
    async fn receive(&self, membership: &mut Membership) -> Result<Datagram, TransportError> {
        loop {
            match membership.inbound.recv().await {
                Ok(Inbound::Datagram(datagram)) => return Ok(datagram),
                Ok(Inbound::Failed(reason)) => return Err(TransportError::ReceiveFailed(reason)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(group = %membership.group, skipped, "Receiver lagged, datagrams dropped");
                }
                Err(RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    async fn leave(&self, membership: Membership);
}

struct Group<S> {
    members: usize,
    inbound: broadcast::Sender<Inbound>,
    socket: S,
}

/// Reference-counted group table shared by the transport implementations
pub(crate) struct Groups<S> {
    table: Mutex<HashMap<SocketAddrV4, Group<S>>>,
    next_id: AtomicU64,
}

impl<S> Groups<S> {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a member to `group`, calling `open` to set up the socket when the
    /// group has none yet
    pub(crate) fn attach<F>(&self, group: SocketAddrV4, open: F) -> Result<Membership, TransportError>
    where
        F: FnOnce(broadcast::Sender<Inbound>) -> Result<S, TransportError>,
    {
        let mut table = self.table.lock();
        let inbound = match table.get_mut(&group) {
            Some(entry) => {
                entry.members += 1;
                entry.inbound.subscribe()
            }
            None => {
                let (sender, receiver) = broadcast::channel(INBOUND_CAPACITY);
                let socket = open(sender.clone())?;
                table.insert(
                    group,
                    Group {
                        members: 1,
                        inbound: sender,
                        socket,
                    },
                );
                receiver
            }
        };

        Ok(Membership {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            group,
            inbound,
        })
    }

    /// Drops a member; returns the socket once the last member is gone
    pub(crate) fn detach(&self, membership: Membership) -> Option<S> {
        let mut table = self.table.lock();
        let entry = table.get_mut(&membership.group)?;
        entry.members -= 1;
        if entry.members > 0 {
            return None;
        }
        table.remove(&membership.group).map(|group| group.socket)
    }

    pub(crate) fn with<R>(&self, group: SocketAddrV4, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.table.lock().get(&group).map(|entry| f(&entry.socket))
    }

    pub(crate) fn sender(&self, group: SocketAddrV4) -> Option<broadcast::Sender<Inbound>> {
        self.table.lock().get(&group).map(|entry| entry.inbound.clone())
    }

    pub(crate) fn members(&self, group: SocketAddrV4) -> usize {
        self.table.lock().get(&group).map_or(0, |entry| entry.members)
    }
}
