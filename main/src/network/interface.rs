use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use std::net::IpAddr;
use thiserror::Error;

/// An address bound to one of the network interfaces of this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub address: IpAddr,
    pub interface_name: String,
}

#[derive(Error, Debug)]
pub enum InterfaceScanError {
    #[error("Failed to run the network interface enumeration")]
    Enumeration(#[from] tokio::task::JoinError),
}

#[automock]
pub trait InterfaceScanner {
    fn scan(&self) -> BoxFuture<'static, Result<Vec<LocalAddress>, InterfaceScanError>>;
}

/// Lists IPv4 and IPv6 addresses of all network interfaces using `netdev`.
pub struct NetdevInterfaceScanner;

impl NetdevInterfaceScanner {
    async fn scan() -> Result<Vec<LocalAddress>, InterfaceScanError> {
        let addresses = tokio::task::spawn_blocking(Self::list_addresses).await?;
        addresses
            .iter()
            .for_each(|a| log::debug!("Found local address: {:?}", a));
        Ok(addresses)
    }

    fn list_addresses() -> Vec<LocalAddress> {
        netdev::get_interfaces()
            .into_iter()
            .flat_map(|interface| {
                let ipv4 = interface.ipv4.iter().map(|net| IpAddr::V4(net.addr()));
                let ipv6 = interface.ipv6.iter().map(|net| IpAddr::V6(net.addr()));
                ipv4.chain(ipv6)
                    .map(|address| LocalAddress {
                        address,
                        interface_name: interface.name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl InterfaceScanner for NetdevInterfaceScanner {
    fn scan(&self) -> BoxFuture<'static, Result<Vec<LocalAddress>, InterfaceScanError>> {
        Self::scan().boxed()
    }
}
