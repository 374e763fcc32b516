use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A dial target from the peer roster.
///
/// `host` is the line the address was resolved from, kept for logging.
#[derive(Debug, Clone)]
pub struct PassivePeer {
    pub host: String,
    pub addr: SocketAddr,
}

/// Whether this node initiates the mesh link to `peer`.
///
/// Every unordered node pair must form exactly one TCP link, so only the
/// side with the lower address dials. Addresses compare
/// octet-lexicographically within their family; without a configured self
/// address for that family we never dial.
pub fn should_dial(peer: IpAddr, self_v4: Option<Ipv4Addr>, self_v6: Option<Ipv6Addr>) -> bool {
    match peer {
        IpAddr::V4(peer) => self_v4.is_some_and(|own| peer.octets() > own.octets()),
        IpAddr::V6(peer) => self_v6.is_some_and(|own| peer.octets() > own.octets()),
    }
}
