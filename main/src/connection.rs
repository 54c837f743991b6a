use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [PeerConnection].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by the inbound listener.
    Inbound,
    /// Dialled by the prober.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Established,
    Monitoring,
    Lost,
}

/// Handle to a live connection with a peer.
///
/// Cloning shares the same connection. The liveness tracker keeps reading from it; holders of
/// the handle may write to it or close it.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    peer_address: SocketAddr,
    origin: Origin,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: Mutex<LivenessState>,
    closed: CancellationToken,
}

impl PeerConnection {
    /// Wraps a freshly established stream. The read half goes back to the caller.
    pub(crate) fn new(
        stream: TcpStream,
        origin: Origin,
        shutdown: &CancellationToken,
    ) -> std::io::Result<(Self, OwnedReadHalf)> {
        let peer_address = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let connection = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer_address,
                origin,
                writer: tokio::sync::Mutex::new(Some(writer)),
                state: Mutex::new(LivenessState::Established),
                closed: shutdown.child_token(),
            }),
        };
        Ok((connection, reader))
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.inner.peer_address
    }

    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    pub fn state(&self) -> LivenessState {
        *self.lock_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Writes all of `data` to the peer. Aborts if the connection gets closed meanwhile.
    pub async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(w) if !self.is_closed() => w,
            _ => return Err(std::io::ErrorKind::NotConnected.into()),
        };
        tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
            _ = self.closed() => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    /// Asks the liveness tracker to tear the connection down. Calling it more than once is a
    /// no-op.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Resolves once the connection is closed, either locally or by the tracker.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub(crate) fn mark_monitoring(&self) {
        let mut state = self.lock_state();
        if *state == LivenessState::Established {
            *state = LivenessState::Monitoring;
        }
    }

    /// Moves to [LivenessState::Lost] and releases the write half.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub(crate) async fn mark_lost(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state == LivenessState::Lost {
                return false;
            }
            *state = LivenessState::Lost;
        }
        self.inner.closed.cancel();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::trace!("Failed to shut down connection {}: {}", self.id(), e);
            }
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LivenessState> {
        // The state is a plain enum, a poisoned lock still holds a valid value.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("peer_address", &self.inner.peer_address)
            .field("origin", &self.inner.origin)
            .field("state", &self.state())
            .finish()
    }
}
