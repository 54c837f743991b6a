use crate::connection::Origin;
use crate::connection::PeerConnection;
use crate::event::PeerEvent;
use crate::event::PeerReachable;
use crate::event::PeerUnreachable;
use futures_channel::mpsc::UnboundedSender;
use futures_util::StreamExt;
use socket2::SockRef;
use socket2::TcpKeepalive;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::codec::BytesCodec;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Sent once on every new connection, by both sides.
pub const GREETING: &[u8] = b"HELLO";

/// Runs the liveness protocol on every connection handed to it.
///
/// Each connection gets its own task which emits [PeerEvent::Reachable] right away, sends
/// [GREETING], then reads and discards everything until the connection breaks, at which point it
/// emits [PeerEvent::Unreachable]. Cancelling `shutdown` closes every tracked connection.
#[derive(Clone)]
pub struct PeerLivenessTracker {
    events: UnboundedSender<PeerEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    tcp_keepalive: Option<TcpKeepalive>,
}

impl PeerLivenessTracker {
    pub fn new(
        events: UnboundedSender<PeerEvent>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
        tcp_keepalive: Option<TcpKeepalive>,
    ) -> Self {
        Self {
            events,
            shutdown,
            tasks,
            tcp_keepalive,
        }
    }

    pub fn track(&self, stream: TcpStream, origin: Origin) {
        if let Some(keepalive) = &self.tcp_keepalive {
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(keepalive) {
                log::debug!("Failed to enable TCP keepalive: {}", e);
            }
        }

        let (connection, reader) = match PeerConnection::new(stream, origin, &self.shutdown) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("Dropping a connection without a peer address: {}", e);
                return;
            }
        };
        self.tasks
            .spawn(monitor(connection, reader, self.events.clone()));
    }
}

async fn monitor(
    connection: PeerConnection,
    reader: OwnedReadHalf,
    events: UnboundedSender<PeerEvent>,
) {
    let peer_address = connection.peer_address();
    let address = peer_address.ip();
    log::info!(
        "Peer {} reachable ({:?} connection {})",
        peer_address,
        connection.origin(),
        connection.id()
    );
    emit(
        &events,
        PeerEvent::Reachable(PeerReachable {
            address,
            connection: connection.clone(),
        }),
    );

    if let Err(e) = connection.send(GREETING).await {
        log::debug!("Failed to greet {}: {}", peer_address, e);
    } else {
        connection.mark_monitoring();
        tokio::select! {
            _ = connection.closed() => {
                log::debug!("Connection {} to {} closed locally", connection.id(), peer_address);
            }
            result = drain(reader) => match result {
                Ok(()) => log::debug!("Peer {} closed the connection", peer_address),
                Err(e) => log::debug!("Connection to {} broke: {}", peer_address, e),
            },
        }
    }

    if connection.mark_lost().await {
        log::info!("Peer {} unreachable (connection {})", peer_address, connection.id());
        emit(
            &events,
            PeerEvent::Unreachable(PeerUnreachable {
                address,
                connection_id: connection.id(),
            }),
        );
    }
}

/// Reads until end of stream, discarding the content.
async fn drain(reader: OwnedReadHalf) -> std::io::Result<()> {
    let mut frames = FramedRead::new(reader, BytesCodec::new());
    while let Some(frame) = frames.next().await {
        log::trace!("Discarding {} received bytes", frame?.len());
    }
    Ok(())
}

fn emit(events: &UnboundedSender<PeerEvent>, event: PeerEvent) {
    if events.unbounded_send(event).is_err() {
        log::debug!("Event dispatcher is gone, discarding an event");
    }
}
