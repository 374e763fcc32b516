#![cfg_attr(test, allow(clippy::unwrap_used))]

//! A userspace L3 mesh forwarder.
//!
//! Every node owns a local TUN device and a mesh of TCP links to its peers.
//! Packets read from TUN are dispatched to the link whose remote address
//! matches the packet's destination; packets received from any link are
//! written to TUN, whole or not at all. A kernel `ipset` tracks which peers
//! are currently reachable so the host only routes into the TUN device for
//! destinations the mesh can actually deliver.
//!
//! The engine ([`Eventloop`]) is a single thread multiplexing all file
//! descriptors through edge-triggered readiness, with per-endpoint ring
//! buffers for backpressure. When a queue cannot take a whole packet the
//! packet is dropped and counted; the mesh never stalls a reader.

use anyhow::Result;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

mod eventloop;
mod framer;
mod peer;
mod peers;
mod reload;
mod route;
mod sockets;
mod stats;
mod tun_endpoint;

pub use eventloop::{Eventloop, Handle};
pub use route::{IpsetCli, RouteSink};
pub use stats::{Counters, Stats};

/// An IP address family.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Static configuration of one mesh node.
#[derive(Debug, Clone)]
pub struct Config {
    /// File listing one peer host per line; reloadable at runtime via
    /// [`Handle::request_reload`].
    pub peer_file: PathBuf,
    /// Our mesh address within IPv4, if we participate in IPv4.
    pub self_v4: Option<Ipv4Addr>,
    /// Our mesh address within IPv6, if we participate in IPv6.
    pub self_v6: Option<Ipv6Addr>,
    /// The mesh-wide TCP port, both listened on and dialed.
    pub port: u16,
}

/// Creates an engine for `config` and runs it to completion.
///
/// Returns an error if initialisation fails; once up, the engine only
/// returns after a stop request through its [`Handle`]. Callers who need
/// the handle (e.g. for signal wiring) use [`Eventloop::new`] directly.
pub fn run(config: Config, tun: tun::Tun, route: Box<dyn RouteSink>) -> Result<()> {
    let (mut eventloop, _handle) = Eventloop::new(config, tun, route)?;

    eventloop.run()
}
