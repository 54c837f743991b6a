use futures_util::Stream;
use futures_util::StreamExt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Result of one connection attempt.
#[derive(Debug)]
pub enum DialOutcome {
    Connected(TcpStream),
    Failed {
        address: SocketAddr,
        reason: DialError,
    },
}

impl DialOutcome {
    pub fn into_connected(self) -> Option<TcpStream> {
        match self {
            Self::Connected(stream) => Some(stream),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Connection attempt failed")]
    Io(#[from] std::io::Error),
}

/// Dials candidate addresses concurrently, at most `max_concurrent_dials` at a time.
#[derive(Debug, Clone)]
pub struct ConnectionProber {
    port: u16,
    max_concurrent_dials: usize,
    connect_timeout: Duration,
}

impl ConnectionProber {
    pub fn new(port: u16, max_concurrent_dials: usize, connect_timeout: Duration) -> Self {
        Self {
            port,
            max_concurrent_dials: max_concurrent_dials.max(1),
            connect_timeout,
        }
    }

    /// Attempts one connection per candidate, without retry.
    ///
    /// Outcomes arrive in completion order. Dropping the stream cancels pending attempts.
    pub fn probe<I>(&self, candidates: I) -> impl Stream<Item = DialOutcome> + Send + 'static
    where
        I: IntoIterator<Item = Ipv4Addr>,
        I::IntoIter: Send + 'static,
    {
        let port = self.port;
        let connect_timeout = self.connect_timeout;
        futures_util::stream::iter(candidates)
            .map(move |ip| dial(SocketAddr::new(IpAddr::V4(ip), port), connect_timeout))
            .buffer_unordered(self.max_concurrent_dials)
    }
}

async fn dial(address: SocketAddr, connect_timeout: Duration) -> DialOutcome {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            log::debug!("Connected to {}", address);
            DialOutcome::Connected(stream)
        }
        Ok(Err(e)) => DialOutcome::Failed {
            address,
            reason: e.into(),
        },
        Err(_) => DialOutcome::Failed {
            address,
            reason: DialError::Timeout,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe() -> anyhow::Result<()> {
        crate::test::init();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let prober = ConnectionProber::new(port, 4, Duration::from_secs(3));

        // When
        let outcomes: Vec<_> = prober
            .probe([Ipv4Addr::LOCALHOST])
            .collect()
            .await;

        // Then
        assert_eq!(outcomes.len(), 1);
        let stream = outcomes
            .into_iter()
            .next()
            .and_then(DialOutcome::into_connected)
            .expect("Must connect to the listener");
        assert_eq!(stream.peer_addr()?, listener.local_addr()?);

        Ok(())
    }

    #[tokio::test]
    async fn nothing_listening() -> anyhow::Result<()> {
        crate::test::init();

        // Reserve a port, then free it so nothing listens there.
        let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();
        let prober = ConnectionProber::new(port, 4, Duration::from_secs(3));

        // When
        let outcomes: Vec<_> = prober.probe([Ipv4Addr::LOCALHOST]).collect().await;

        // Then
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            DialOutcome::Failed { address, .. } => {
                assert_eq!(*address, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port))
            }
            DialOutcome::Connected(_) => panic!("Nothing must accept the connection"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn probe_many() -> anyhow::Result<()> {
        crate::test::init();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let prober = ConnectionProber::new(port, 2, Duration::from_secs(3));
        let candidates = [
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
        ];

        // When
        let connected = prober
            .probe(candidates)
            .filter_map(|o| async { o.into_connected() })
            .count()
            .await;

        // Then
        assert_eq!(connected, 3);

        Ok(())
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let prober = ConnectionProber::new(1, 0, Duration::from_secs(1));
        assert_eq!(prober.max_concurrent_dials, 1);
    }
}
