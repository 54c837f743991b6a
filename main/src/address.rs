use std::net::IpAddr;
use std::net::Ipv4Addr;

const FIRST_HOST: u8 = 1;
const LAST_HOST: u8 = 254;
const LOOPBACK_OCTET: u8 = 127;

/// Candidate addresses in the /24 subnet of a local IPv4 address, in ascending order.
///
/// The sequence is lazy. Cloning it before consumption restarts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    prefix: [u8; 3],
    skipped_host: Option<u8>,
    next_host: Option<u8>,
}

impl Candidates {
    fn empty() -> Self {
        Self {
            prefix: [0; 3],
            skipped_host: None,
            next_host: None,
        }
    }
}

impl Iterator for Candidates {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let host = self.next_host?;
            self.next_host = (host < LAST_HOST).then(|| host + 1);
            if Some(host) == self.skipped_host {
                continue;
            }
            let [a, b, c] = self.prefix;
            return Some(Ipv4Addr::new(a, b, c, host));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self.next_host {
            Some(host) => {
                let total = usize::from(LAST_HOST - host) + 1;
                match self.skipped_host {
                    Some(skipped) if skipped >= host && skipped <= LAST_HOST => total - 1,
                    _ => total,
                }
            }
            None => 0,
        };
        (remaining, Some(remaining))
    }
}

/// Expands a local address into the other hosts of its /24 subnet.
///
/// Only IPv4 is supported; anything else yields nothing. Loopback subnets (`127.x.x.x`) also
/// yield nothing.
pub fn expand(local: IpAddr, skip_self: bool) -> Candidates {
    match local {
        IpAddr::V4(ipv4) => expand_ipv4(ipv4, skip_self),
        IpAddr::V6(_) => Candidates::empty(),
    }
}

pub fn expand_ipv4(local: Ipv4Addr, skip_self: bool) -> Candidates {
    let [a, b, c, d] = local.octets();
    if a == LOOPBACK_OCTET {
        return Candidates::empty();
    }
    Candidates {
        prefix: [a, b, c],
        skipped_host: skip_self.then_some(d),
        next_host: Some(FIRST_HOST),
    }
}

/// Same as [expand], but for an address in text form. Malformed input yields nothing.
pub fn expand_str(local: &str, skip_self: bool) -> Candidates {
    match local.parse() {
        Ok(ip) => expand(ip, skip_self),
        Err(e) => {
            log::debug!("Not expanding malformed address `{}`: {}", local, e);
            Candidates::empty()
        }
    }
}
