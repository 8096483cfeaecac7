use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use crate::error::TransportError;
use super::{Datagram, Groups, Inbound, Membership, Transport};

/// In-process transport: records what is sent and delivers what is injected.
///
/// Sent datagrams are not looped back to members.
pub struct MemoryTransport {
    groups: Groups<()>,
    sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    sent_count: watch::Sender<usize>,
    unavailable: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            groups: Groups::new(),
            sent: Mutex::new(Vec::new()),
            sent_count: watch::Sender::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes subsequent joins fail as if the network were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delivers a datagram to every member of `group`. Returns false when the
    /// group has no members.
    pub fn inject(&self, group: SocketAddrV4, bytes: &[u8], source: SocketAddr) -> bool {
        let Some(sender) = self.groups.sender(group) else {
            return false;
        };
        let datagram = Datagram {
            bytes: Arc::from(bytes),
            source,
        };
        sender.send(Inbound::Datagram(datagram)).is_ok()
    }

    /// Simulates a socket failure underneath every member of `group`
    pub fn fail(&self, group: SocketAddrV4, reason: &str) -> bool {
        self.groups
            .sender(group)
            .is_some_and(|sender| sender.send(Inbound::Failed(reason.to_string())).is_ok())
    }

    pub fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Waits until at least `count` datagrams have been sent in total
    pub async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }

    pub fn member_count(&self, group: SocketAddrV4) -> usize {
        self.groups.members(group)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join(&self, group: SocketAddrV4) -> Result<Membership, TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "network is down",
            )));
        }
        self.groups.attach(group, |_| Ok(()))
    }

    async fn send(&self, membership: &Membership, bytes: &[u8]) -> Result<(), TransportError> {
        if self.groups.members(membership.group()) == 0 {
            return Err(TransportError::Closed);
        }
        let total = {
            let mut sent = self.sent.lock();
            sent.push((membership.group(), bytes.to_vec()));
            sent.len()
        };
        self.sent_count.send_replace(total);
        Ok(())
    }

    async fn leave(&self, membership: Membership) {
        self.groups.detach(membership);
    }
}
