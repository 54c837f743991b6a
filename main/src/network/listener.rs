use futures_util::Stream;
use futures_util::StreamExt;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// TCP server accepting connections from any source on the discovery port.
pub struct InboundListener {
    listener: TcpListener,
}

impl InboundListener {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let bind_address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let listener = TcpListener::bind(bind_address).await?;
        log::info!("Inbound listener bound at {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_address(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepted connections until `shutdown` is cancelled.
    ///
    /// Accept errors are logged and skipped. The listening socket closes once the stream is
    /// dropped.
    pub fn incoming(
        self,
        shutdown: CancellationToken,
    ) -> impl Stream<Item = TcpStream> + Send + 'static {
        TcpListenerStream::new(self.listener)
            .take_until(shutdown.cancelled_owned())
            .filter_map(|accepted| async {
                match accepted {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        log::warn!("Failed to accept an inbound connection: {}", e);
                        None
                    }
                }
            })
    }
}
