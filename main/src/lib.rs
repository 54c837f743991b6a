//! Discovers peers on the local IPv4 subnets by dialling every address on a shared TCP port, and
//! tracks whether each discovered connection is still alive.

mod address;
mod connection;
mod event;
mod network;
mod service;
mod tracker;

pub use address::expand;
pub use address::expand_ipv4;
pub use address::expand_str;
pub use address::Candidates;
pub use connection::ConnectionId;
pub use connection::LivenessState;
pub use connection::Origin;
pub use connection::PeerConnection;
pub use event::DiscoveryListener;
pub use event::MockDiscoveryListener;
pub use event::PeerEvent;
pub use event::PeerReachable;
pub use event::PeerUnreachable;
pub use network::interface::InterfaceScanError;
pub use network::interface::InterfaceScanner;
pub use network::interface::LocalAddress;
pub use network::interface::MockInterfaceScanner;
pub use network::interface::NetdevInterfaceScanner;
pub use network::listener::InboundListener;
pub use network::prober::ConnectionProber;
pub use network::prober::DialError;
pub use network::prober::DialOutcome;
pub use service::DiscoveryConfig;
pub use service::DiscoveryHandle;
pub use service::DiscoveryService;
pub use service::StartError;
pub use tracker::PeerLivenessTracker;
pub use tracker::GREETING;
