use crate::connection::ConnectionId;
use crate::connection::PeerConnection;
use futures_channel::mpsc::UnboundedSender;
use mockall::automock;
use std::net::IpAddr;

/// A peer connection was just established.
#[derive(Debug, Clone)]
pub struct PeerReachable {
    /// IP of the peer. The full socket address is [PeerConnection::peer_address].
    pub address: IpAddr,
    pub connection: PeerConnection,
}

/// A previously reachable peer connection broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUnreachable {
    pub address: IpAddr,
    /// Matches [PeerConnection::id] of the preceding [PeerReachable].
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Reachable(PeerReachable),
    Unreachable(PeerUnreachable),
}

impl PeerEvent {
    pub fn address(&self) -> IpAddr {
        match self {
            Self::Reachable(e) => e.address,
            Self::Unreachable(e) => e.address,
        }
    }
}

/// Receives discovery events. Both methods are called from the same dispatcher task.
#[automock]
pub trait DiscoveryListener: Send + Sync {
    fn on_peer_reachable(&self, event: PeerReachable);
    fn on_peer_unreachable(&self, event: PeerUnreachable);
}

/// Forwards every event into a channel, for callers preferring a [Stream](futures_util::Stream).
impl DiscoveryListener for UnboundedSender<PeerEvent> {
    fn on_peer_reachable(&self, event: PeerReachable) {
        if self.unbounded_send(PeerEvent::Reachable(event)).is_err() {
            log::debug!("Event receiver dropped, discarding `PeerReachable`");
        }
    }

    fn on_peer_unreachable(&self, event: PeerUnreachable) {
        if self.unbounded_send(PeerEvent::Unreachable(event)).is_err() {
            log::debug!("Event receiver dropped, discarding `PeerUnreachable`");
        }
    }
}
