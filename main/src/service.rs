use crate::address;
use crate::connection::ConnectionId;
use crate::connection::Origin;
use crate::connection::PeerConnection;
use crate::event::DiscoveryListener;
use crate::event::PeerEvent;
use crate::network::interface::InterfaceScanError;
use crate::network::interface::InterfaceScanner;
use crate::network::interface::LocalAddress;
use crate::network::interface::NetdevInterfaceScanner;
use crate::network::listener::InboundListener;
use crate::network::prober::ConnectionProber;
use crate::network::prober::DialOutcome;
use crate::tracker::PeerLivenessTracker;
use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use socket2::TcpKeepalive;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Listening port, also dialled on every candidate.
    pub port: u16,

    /// Do not dial our own addresses. Inbound connections are never filtered.
    pub skip_self: bool,

    pub max_concurrent_dials: usize,
    pub connect_timeout: Duration,

    /// Idle time before the OS starts checking a silent connection. `None` disables TCP
    /// keepalive.
    pub tcp_keepalive: Option<Duration>,

    /// Time between unanswered keepalive checks. Ignored on systems without the option.
    pub tcp_keepalive_interval: Duration,

    /// Unanswered keepalive checks before the connection counts as broken. Ignored on systems
    /// without the option.
    pub tcp_keepalive_retries: u32,
}

impl DiscoveryConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            skip_self: true,
            max_concurrent_dials: 64,
            connect_timeout: Duration::from_secs(3),
            tcp_keepalive: Some(Duration::from_secs(10)),
            tcp_keepalive_interval: Duration::from_secs(5),
            tcp_keepalive_retries: 3,
        }
    }

    pub fn skip_self(mut self, skip_self: bool) -> Self {
        self.skip_self = skip_self;
        self
    }

    pub fn max_concurrent_dials(mut self, max_concurrent_dials: usize) -> Self {
        self.max_concurrent_dials = max_concurrent_dials;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn tcp_keepalive(mut self, tcp_keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = tcp_keepalive;
        self
    }

    pub fn tcp_keepalive_interval(mut self, tcp_keepalive_interval: Duration) -> Self {
        self.tcp_keepalive_interval = tcp_keepalive_interval;
        self
    }

    pub fn tcp_keepalive_retries(mut self, tcp_keepalive_retries: u32) -> Self {
        self.tcp_keepalive_retries = tcp_keepalive_retries;
        self
    }

    fn keepalive(&self) -> Option<TcpKeepalive> {
        let keepalive = TcpKeepalive::new().with_time(self.tcp_keepalive?);
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            windows,
        ))]
        let keepalive = keepalive.with_interval(self.tcp_keepalive_interval);
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
        ))]
        let keepalive = keepalive.with_retries(self.tcp_keepalive_retries);
        Some(keepalive)
    }
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Invalid discovery port")]
    InvalidPort,

    #[error("Failed to bind the inbound listener")]
    Bind(#[source] std::io::Error),

    #[error("Failed to enumerate local addresses")]
    InterfaceScan(#[from] InterfaceScanError),
}

pub struct DiscoveryService;

impl DiscoveryService {
    pub async fn start(
        port: u16,
        listener: impl DiscoveryListener + 'static,
        skip_self: bool,
    ) -> Result<DiscoveryHandle, StartError> {
        Self::start_with_config(DiscoveryConfig::new(port).skip_self(skip_self), listener).await
    }

    pub async fn start_with_config(
        config: DiscoveryConfig,
        listener: impl DiscoveryListener + 'static,
    ) -> Result<DiscoveryHandle, StartError> {
        start_internal(config, Arc::new(listener), NetdevInterfaceScanner).await
    }
}

async fn start_internal(
    config: DiscoveryConfig,
    listener: Arc<dyn DiscoveryListener>,
    interface_scanner: impl InterfaceScanner,
) -> Result<DiscoveryHandle, StartError> {
    if config.port == 0 {
        return Err(StartError::InvalidPort);
    }

    let inbound = InboundListener::bind(config.port)
        .await
        .map_err(StartError::Bind)?;
    let local_addresses = interface_scanner.scan().await?;
    let prober = ConnectionProber::new(
        config.port,
        config.max_concurrent_dials,
        config.connect_timeout,
    );
    let candidates = candidates(local_addresses, config.skip_self);
    Ok(launch(&config, listener, inbound, prober, candidates))
}

/// Spawns the accepting, dialling and dispatching tasks over already prepared sockets.
fn launch<I>(
    config: &DiscoveryConfig,
    listener: Arc<dyn DiscoveryListener>,
    inbound: InboundListener,
    prober: ConnectionProber,
    candidates: I,
) -> DiscoveryHandle
where
    I: IntoIterator<Item = Ipv4Addr>,
    I::IntoIter: Send + 'static,
{
    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let active_peers = ActivePeers::default();
    let (event_sender, event_receiver) = futures_channel::mpsc::unbounded();
    let tracker = PeerLivenessTracker::new(
        event_sender,
        shutdown.clone(),
        tasks.clone(),
        config.keepalive(),
    );

    let outbound = prober
        .probe(candidates)
        .take_until(shutdown.clone().cancelled_owned())
        .filter_map(|outcome| async {
            match outcome {
                DialOutcome::Connected(stream) => Some((stream, Origin::Outbound)),
                DialOutcome::Failed { address, reason } => {
                    log::trace!("No peer at {}: {}", address, reason);
                    None
                }
            }
        });
    let inbound = inbound
        .incoming(shutdown.clone())
        .map(|stream| (stream, Origin::Inbound));

    tasks.spawn(async move {
        futures_util::stream::select(inbound, outbound)
            .for_each(|(stream, origin)| {
                tracker.track(stream, origin);
                futures_util::future::ready(())
            })
            .await;
        log::debug!("No longer accepting or dialling connections");
    });
    tasks.spawn(dispatch(event_receiver, listener, active_peers.clone()));
    tasks.close();

    log::info!("Discovery started on port {}", config.port);
    DiscoveryHandle {
        port: config.port,
        shutdown,
        tasks,
        active_peers,
    }
}

/// Candidates of every local IPv4 subnet, each address at most once.
fn candidates(
    local_addresses: Vec<LocalAddress>,
    skip_self: bool,
) -> impl Iterator<Item = Ipv4Addr> + Send + 'static {
    let mut seen = HashSet::new();
    local_addresses
        .into_iter()
        .flat_map(move |local| address::expand(local.address, skip_self))
        .filter(move |candidate| seen.insert(*candidate))
}

/// Single consumer of all peer events, delivering them to the listener in arrival order.
async fn dispatch(
    mut events: UnboundedReceiver<PeerEvent>,
    listener: Arc<dyn DiscoveryListener>,
    active_peers: ActivePeers,
) {
    while let Some(event) = events.next().await {
        active_peers.record(&event);
        let address = event.address();
        let delivery = std::panic::catch_unwind(AssertUnwindSafe(|| match event {
            PeerEvent::Reachable(e) => listener.on_peer_reachable(e),
            PeerEvent::Unreachable(e) => listener.on_peer_unreachable(e),
        }));
        if delivery.is_err() {
            log::error!("Discovery listener panicked on an event from {}", address);
        }
    }
    log::debug!("Event dispatcher finished");
}

#[derive(Clone, Default)]
struct ActivePeers(Arc<Mutex<HashMap<ConnectionId, PeerConnection>>>);

impl ActivePeers {
    fn record(&self, event: &PeerEvent) {
        let mut peers = self.lock();
        match event {
            PeerEvent::Reachable(e) => {
                peers.insert(e.connection.id(), e.connection.clone());
            }
            PeerEvent::Unreachable(e) => {
                peers.remove(&e.connection_id);
            }
        }
    }

    fn snapshot(&self) -> Vec<PeerConnection> {
        let mut peers: Vec<_> = self.lock().values().cloned().collect();
        peers.sort_by_key(PeerConnection::id);
        peers
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, PeerConnection>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Controls a running discovery. Dropping it stops discovery.
pub struct DiscoveryHandle {
    port: u16,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    active_peers: ActivePeers,
}

impl DiscoveryHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections not yet lost, oldest first.
    pub fn active_peers(&self) -> Vec<PeerConnection> {
        self.active_peers.snapshot()
    }

    /// Closes the listener, cancels pending dials and tears down tracked connections.
    ///
    /// Returns immediately; use [Self::stopped] to wait for the unwind. Calling it again is a
    /// no-op.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            log::info!("Stopping discovery on port {}", self.port);
            self.shutdown.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once every socket and task of this discovery has been released.
    pub async fn stopped(&self) {
        self.tasks.wait().await
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::MockDiscoveryListener;
    use crate::event::PeerReachable;
    use crate::event::PeerUnreachable;
    use crate::network::interface::MockInterfaceScanner;
    use futures_util::FutureExt;
    use std::net::IpAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn free_port() -> std::io::Result<u16> {
        Ok(std::net::TcpListener::bind("0.0.0.0:0")?.local_addr()?.port())
    }

    fn scanner_returning(addresses: Vec<LocalAddress>) -> MockInterfaceScanner {
        let mut scanner = MockInterfaceScanner::new();
        scanner
            .expect_scan()
            .return_once(move || async move { Ok(addresses) }.boxed());
        scanner
    }

    fn local_address(address: &str) -> LocalAddress {
        LocalAddress {
            address: address.parse().unwrap(),
            interface_name: "eth0".into(),
        }
    }

    async fn start_with_channel(
        config: DiscoveryConfig,
        scanner: MockInterfaceScanner,
    ) -> Result<(DiscoveryHandle, UnboundedReceiver<PeerEvent>), StartError> {
        let (sender, receiver) = futures_channel::mpsc::unbounded();
        let handle = start_internal(config, Arc::new(sender), scanner).await?;
        Ok((handle, receiver))
    }

    /// Listens on `port` and dials `dial_port` on `candidates`, without looking at the host's
    /// interfaces.
    async fn launch_with_candidates(
        port: u16,
        dial_port: u16,
        candidates: Vec<Ipv4Addr>,
    ) -> anyhow::Result<(DiscoveryHandle, UnboundedReceiver<PeerEvent>)> {
        let config = DiscoveryConfig::new(port).connect_timeout(Duration::from_millis(500));
        let inbound = InboundListener::bind(port).await?;
        let prober = ConnectionProber::new(
            dial_port,
            config.max_concurrent_dials,
            config.connect_timeout,
        );
        let (sender, receiver) = futures_channel::mpsc::unbounded();
        let handle = launch(&config, Arc::new(sender), inbound, prober, candidates);
        Ok((handle, receiver))
    }

    #[tokio::test]
    async fn invalid_port() {
        crate::test::init();

        // When
        let result = start_internal(
            DiscoveryConfig::new(0),
            Arc::new(MockDiscoveryListener::new()),
            scanner_returning(vec![]),
        )
        .await;

        // Then
        assert!(matches!(result, Err(StartError::InvalidPort)));
    }

    #[tokio::test]
    async fn interface_scan_failure() -> anyhow::Result<()> {
        crate::test::init();

        let join_error = tokio::spawn(async { panic!("Enumeration crashed") })
            .await
            .unwrap_err();
        let mut scanner = MockInterfaceScanner::new();
        scanner
            .expect_scan()
            .return_once(move || async move { Err(join_error.into()) }.boxed());

        // When
        let result = start_with_channel(DiscoveryConfig::new(free_port()?), scanner).await;

        // Then
        assert!(matches!(result, Err(StartError::InterfaceScan(_))));

        Ok(())
    }

    #[tokio::test]
    async fn port_in_use() -> anyhow::Result<()> {
        crate::test::init();

        let occupied = std::net::TcpListener::bind("0.0.0.0:0")?;
        let port = occupied.local_addr()?.port();

        // When
        let result =
            start_with_channel(DiscoveryConfig::new(port), scanner_returning(vec![])).await;

        // Then
        assert!(matches!(result, Err(StartError::Bind(_))));

        Ok(())
    }

    #[tokio::test]
    async fn inbound_peer() -> anyhow::Result<()> {
        crate::test::init();

        let port = free_port()?;
        let (handle, mut events) =
            start_with_channel(DiscoveryConfig::new(port), scanner_returning(vec![])).await?;

        // When
        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;

        // Then
        let reachable = match events.next().await {
            Some(PeerEvent::Reachable(e)) => e,
            other => panic!("Expecting `PeerReachable`, got {:?}", other),
        };
        assert_eq!(reachable.address, peer.local_addr()?.ip());
        assert_eq!(reachable.connection.peer_address(), peer.local_addr()?);
        assert_eq!(reachable.connection.origin(), Origin::Inbound);
        let mut greeting = [0; 5];
        peer.read_exact(&mut greeting).await?;
        assert_eq!(&greeting, crate::tracker::GREETING);

        // When
        drop(peer);

        // Then
        let unreachable = match events.next().await {
            Some(PeerEvent::Unreachable(e)) => e,
            other => panic!("Expecting `PeerUnreachable`, got {:?}", other),
        };
        assert_eq!(unreachable.address, reachable.address);
        assert!(handle.active_peers().is_empty());

        handle.stop();
        handle.stopped().await;
        assert!(events.next().await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn stop_twice() -> anyhow::Result<()> {
        crate::test::init();

        let port = free_port()?;
        let (handle, mut events) =
            start_with_channel(DiscoveryConfig::new(port), scanner_returning(vec![])).await?;
        let _peer = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        let reachable = match events.next().await {
            Some(PeerEvent::Reachable(e)) => e,
            other => panic!("Expecting `PeerReachable`, got {:?}", other),
        };
        assert_eq!(handle.active_peers().len(), 1);

        // When
        handle.stop();
        handle.stop();
        handle.stopped().await;

        // Then
        assert!(handle.is_stopped());
        let remaining: Vec<_> = events.collect().await;
        assert_eq!(remaining.len(), 1, "Exactly one teardown event expected");
        match &remaining[0] {
            PeerEvent::Unreachable(e) => assert_eq!(e.connection_id, reachable.connection.id()),
            other => panic!("Expecting `PeerUnreachable`, got {:?}", other),
        }
        assert!(handle.active_peers().is_empty());
        assert!(
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err(),
            "Listener must be closed"
        );

        Ok(())
    }

    #[tokio::test]
    async fn unreachable_candidates_emit_nothing() -> anyhow::Result<()> {
        crate::test::init();

        let (handle, events) =
            launch_with_candidates(free_port()?, free_port()?, vec![Ipv4Addr::LOCALHOST]).await?;

        // When
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop();
        handle.stopped().await;

        // Then
        let emitted: Vec<_> = events.collect().await;
        assert!(emitted.is_empty(), "Unexpected events: {:?}", emitted);

        Ok(())
    }

    #[tokio::test]
    async fn two_instances_find_each_other() -> anyhow::Result<()> {
        crate::test::init();

        let port_a = free_port()?;
        let port_b = free_port()?;
        let (handle_a, mut events_a) = launch_with_candidates(port_a, port_a, vec![]).await?;

        // When
        let (handle_b, mut events_b) =
            launch_with_candidates(port_b, port_a, vec![Ipv4Addr::LOCALHOST]).await?;

        // Then
        let dialled = match events_b.next().await {
            Some(PeerEvent::Reachable(e)) => e,
            other => panic!("Expecting `PeerReachable`, got {:?}", other),
        };
        assert_eq!(dialled.address, IpAddr::from(Ipv4Addr::LOCALHOST));
        assert_eq!(dialled.connection.origin(), Origin::Outbound);
        assert_eq!(dialled.connection.peer_address().port(), port_a);

        let accepted = match events_a.next().await {
            Some(PeerEvent::Reachable(e)) => e,
            other => panic!("Expecting `PeerReachable`, got {:?}", other),
        };
        assert_eq!(accepted.address, IpAddr::from(Ipv4Addr::LOCALHOST));
        assert_eq!(accepted.connection.origin(), Origin::Inbound);

        // When
        handle_a.stop();
        handle_a.stopped().await;

        // Then
        let lost = match events_b.next().await {
            Some(PeerEvent::Unreachable(e)) => e,
            other => panic!("Expecting `PeerUnreachable`, got {:?}", other),
        };
        assert_eq!(lost.connection_id, dialled.connection.id());
        assert!(handle_b.active_peers().is_empty());

        let remaining_a: Vec<_> = events_a.collect().await;
        assert_eq!(remaining_a.len(), 1);
        match &remaining_a[0] {
            PeerEvent::Unreachable(e) => assert_eq!(e.connection_id, accepted.connection.id()),
            other => panic!("Expecting `PeerUnreachable`, got {:?}", other),
        }

        handle_b.stop();
        handle_b.stopped().await;

        Ok(())
    }

    #[tokio::test]
    async fn listener_panic_is_isolated() -> anyhow::Result<()> {
        crate::test::init();

        let port = free_port()?;
        let (sender, mut receiver) = futures_channel::mpsc::unbounded();
        let handle = start_internal(
            DiscoveryConfig::new(port),
            Arc::new(PanickingOnReachable(sender)),
            scanner_returning(vec![]),
        )
        .await?;

        // When
        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        let mut greeting = [0; 5];
        peer.read_exact(&mut greeting).await?;
        drop(peer);

        // Then
        let unreachable = receiver.next().await.expect("Must still report the loss");
        assert_eq!(unreachable.address, IpAddr::from(Ipv4Addr::LOCALHOST));

        handle.stop();
        handle.stopped().await;

        Ok(())
    }

    #[test]
    fn candidates_of_all_subnets() {
        let local_addresses = vec![
            local_address("10.0.0.5"),
            local_address("10.0.0.6"),
            local_address("192.168.1.2"),
            local_address("127.0.0.1"),
            local_address("fe80::1"),
        ];

        // When
        let candidates: Vec<_> = candidates(local_addresses, true).collect();

        // Then
        assert_eq!(candidates.len(), 254 + 253);
        assert_eq!(
            candidates.iter().collect::<HashSet<_>>().len(),
            candidates.len()
        );
        assert!(!candidates.contains(&Ipv4Addr::new(192, 168, 1, 2)));
        assert!(candidates.contains(&Ipv4Addr::new(10, 0, 0, 5)), "Found via 10.0.0.6");
        assert!(candidates.iter().all(|c| c.octets()[0] != 127));
    }

    #[test]
    fn config() {
        let config = DiscoveryConfig::new(9000)
            .skip_self(false)
            .max_concurrent_dials(8)
            .connect_timeout(Duration::from_millis(500))
            .tcp_keepalive_interval(Duration::from_secs(2))
            .tcp_keepalive_retries(5)
            .tcp_keepalive(None);
        assert_eq!(config.port, 9000);
        assert!(!config.skip_self);
        assert_eq!(config.max_concurrent_dials, 8);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.tcp_keepalive, None);
        assert_eq!(config.tcp_keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.tcp_keepalive_retries, 5);
        assert!(config.keepalive().is_none());
    }

    #[test]
    fn keepalive_enabled_by_default() {
        let config = DiscoveryConfig::new(9000);
        assert_eq!(config.tcp_keepalive, Some(Duration::from_secs(10)));
        assert_eq!(config.tcp_keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.tcp_keepalive_retries, 3);
        assert!(config.keepalive().is_some());
    }

    struct PanickingOnReachable(futures_channel::mpsc::UnboundedSender<PeerUnreachable>);

    impl DiscoveryListener for PanickingOnReachable {
        fn on_peer_reachable(&self, _: PeerReachable) {
            panic!("Listener failure");
        }

        fn on_peer_unreachable(&self, event: PeerUnreachable) {
            let _ = self.0.unbounded_send(event);
        }
    }
}
