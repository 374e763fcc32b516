use anyhow::{Context as _, Result};
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use ring_buffer::RingBuffer;
use std::collections::HashMap;
use std::io::{self, IoSliceMut, Read as _};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tun::Tun;

use crate::framer::{self, FrameError};
use crate::peer::{self, Flow, PeerConn};
use crate::peers::should_dial;
use crate::reload;
use crate::route::RouteSink;
use crate::sockets::make_listen_socket;
use crate::stats::Stats;
use crate::tun_endpoint::TunEndpoint;
use crate::{Config, Family};

const TUN: Token = Token(0);
const WAKER: Token = Token(1);
const LISTENER_V4: Token = Token(2);
const LISTENER_V6: Token = Token(3);

/// Peer tokens are allocated upwards from here and never reused.
const FIRST_PEER: usize = 8;

/// Control handle into a running [`Eventloop`].
///
/// Both requests only set a flag and write to an eventfd, so they are safe
/// to call from signal handlers and other threads, and are idempotent.
#[derive(Clone)]
pub struct Handle {
    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Handle {
    /// Requests a graceful stop at the next wake-up. In-flight ring contents
    /// are discarded.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }

    /// Requests a peer-file reload at the next wake-up.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}

/// The single-threaded I/O engine: one TUN device, per-family listeners and
/// a dynamic set of mesh links, multiplexed over one poller.
///
/// Everything is edge-triggered: each wake-up drains every ready endpoint
/// until the kernel reports `WouldBlock`. The only blocking call anywhere
/// is the poll itself.
pub struct Eventloop {
    poll: Poll,
    config: Config,

    tun: TunEndpoint,
    listeners: Vec<(Token, mio::net::TcpListener)>,

    peers: HashMap<Token, PeerConn>,
    /// Live links indexed by remote node address. Values are tokens into
    /// `peers`, which owns the endpoints.
    live: HashMap<IpAddr, Token>,
    /// Dial targets from the peer file, by resolved address.
    roster: HashMap<IpAddr, crate::peers::PassivePeer>,
    /// Outbound roster addresses currently without a link; re-dialed on the
    /// next reload trigger.
    disconnected: Vec<IpAddr>,

    route: Box<dyn RouteSink>,
    stats: Stats,

    next_token: usize,

    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    _waker: Arc<Waker>,
}

impl Eventloop {
    pub fn new(config: Config, tun: Tun, route: Box<dyn RouteSink>) -> Result<(Self, Handle)> {
        anyhow::ensure!(
            config.self_v4.is_some() || config.self_v6.is_some(),
            "at least one self address is required"
        );

        let poll = Poll::new().context("Failed to create poller")?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER).context("Failed to create waker")?);

        let tun_fd = tun.as_raw_fd();
        poll.registry()
            .register(
                &mut SourceFd(&tun_fd),
                TUN,
                Interest::READABLE | Interest::WRITABLE,
            )
            .context("Failed to register TUN device")?;

        let mut listeners = Vec::new();

        if config.self_v4.is_some() {
            let mut listener = make_listen_socket(Family::V4, config.port)
                .context("Failed to bind IPv4 listener")?;
            poll.registry()
                .register(&mut listener, LISTENER_V4, Interest::READABLE)?;
            listeners.push((LISTENER_V4, listener));
        }

        if config.self_v6.is_some() {
            let mut listener = make_listen_socket(Family::V6, config.port)
                .context("Failed to bind IPv6 listener")?;
            poll.registry()
                .register(&mut listener, LISTENER_V6, Interest::READABLE)?;
            listeners.push((LISTENER_V6, listener));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        let handle = Handle {
            stop: stop.clone(),
            reload: reload.clone(),
            waker: waker.clone(),
        };

        let eventloop = Self {
            poll,
            config,
            tun: TunEndpoint::new(tun),
            listeners,
            peers: HashMap::new(),
            live: HashMap::new(),
            roster: HashMap::new(),
            disconnected: Vec::new(),
            route,
            stats: Stats::default(),
            next_token: FIRST_PEER,
            stop,
            reload,
            _waker: waker,
        };

        Ok((eventloop, handle))
    }

    /// The actual port of the first listener; useful with a configured port
    /// of `0`.
    pub fn listen_port(&self) -> Option<u16> {
        let (_, listener) = self.listeners.first()?;

        Some(listener.local_addr().ok()?.port())
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Runs the engine until [`Handle::request_stop`] is called.
    ///
    /// Returns an error only when initialisation fails; a running mesh
    /// degrades by dropping packets and links, never by exiting.
    pub fn run(&mut self) -> Result<()> {
        self.reload_roster()
            .context("Failed to load initial peer roster")?;

        let mut events = Events::with_capacity(1024);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to poll for readiness"),
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    TUN => {
                        if event.is_writable() {
                            self.tun.drain(&mut self.stats.tun_tx);
                        }
                        if event.is_readable() {
                            self.dispatch_tun();
                        }
                    }
                    token if token == LISTENER_V4 || token == LISTENER_V6 => {
                        self.accept_pending(token);
                    }
                    token => self.service_peer(token, event),
                }
            }

            // Control flags are handled between event batches, never within.
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            if self.reload.swap(false, Ordering::Relaxed)
                && let Err(e) = self.reload_roster()
            {
                tracing::warn!("Keeping current roster: {e:#}");
            }
        }

        self.stats.log_summary();

        Ok(())
    }

    /// Services a readiness event for a mesh link.
    fn service_peer(&mut self, token: Token, event: &mio::event::Event) {
        let mut kill = false;

        {
            let Self {
                peers, tun, stats, ..
            } = self;

            let Some(peer) = peers.get_mut(&token) else {
                // Destroyed earlier in this batch.
                return;
            };

            if event.is_writable() {
                kill |= peer.drain_tx() == Flow::Kill;
            }

            if !kill && (event.is_readable() || event.is_read_closed() || event.is_error()) {
                kill |= fill_peer_rx(peer, tun, stats) == Flow::Kill;
            }
        }

        if kill {
            self.destroy_peer(token);
        }
    }

    /// Reads packets from the TUN device and fans them out to live links.
    fn dispatch_tun(&mut self) {
        let mut dead = Vec::new();

        {
            let Self {
                tun,
                live,
                peers,
                stats,
                ..
            } = self;

            loop {
                let n = match tun.tun.read(&mut tun.read_buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("Failed to read from TUN: {e}");
                        break;
                    }
                };

                stats.tun_rx.record(n);

                let packet = &tun.read_buf[..n];

                let Some(dst) = framer::destination(packet) else {
                    stats.world_tx.record_drop(n);
                    continue;
                };

                let Some(token) = live.get(&dst).copied() else {
                    stats.world_tx.record_drop(n);
                    continue;
                };

                if dead.contains(&token) {
                    stats.world_tx.record_drop(n);
                    continue;
                }

                let Some(peer) = peers.get_mut(&token) else {
                    continue;
                };

                if peer.tx.push_all(packet) {
                    stats.world_tx.record(n);

                    if peer.drain_tx() == Flow::Kill {
                        dead.push(token);
                    }
                } else {
                    stats.world_tx.record_drop(n);
                }
            }
        }

        for token in dead {
            self.destroy_peer(token);
        }
    }

    /// Accepts inbound links until the kernel has no more to hand out.
    fn accept_pending(&mut self, token: Token) {
        let mut accepted = Vec::new();

        {
            let Some((_, listener)) = self.listeners.iter().find(|(t, _)| *t == token) else {
                return;
            };

            loop {
                match listener.accept() {
                    Ok((stream, remote)) => accepted.push((stream, remote)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e)
                        if e.raw_os_error() == Some(libc::EMFILE)
                            || e.raw_os_error() == Some(libc::ENFILE) =>
                    {
                        tracing::warn!("Out of file descriptors while accepting: {e}");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {e}");
                        break;
                    }
                }
            }
        }

        for (stream, remote) in accepted {
            tracing::info!(%remote, "Accepted mesh link");

            self.add_peer(stream, remote.ip(), false);
        }
    }

    /// Installs a connection as a live mesh link.
    ///
    /// Route setup, poller registration and bookkeeping happen as a unit:
    /// any failure unwinds what was already done and closes the socket.
    fn add_peer(&mut self, mut stream: TcpStream, addr: IpAddr, outbound: bool) -> bool {
        if let Some(previous) = self.live.get(&addr).copied() {
            tracing::info!(%addr, "Replacing existing link");
            self.destroy_peer(previous);
        }

        if let Err(e) = self.route.add(addr) {
            tracing::warn!(%addr, "Failed to add route: {e:#}");

            return false;
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(%addr, "Failed to register peer socket: {e}");

            if let Err(e) = self.route.remove(addr) {
                tracing::warn!(%addr, "Failed to remove route: {e:#}");
            }

            return false;
        }

        self.peers.insert(token, PeerConn::new(stream, addr, outbound));
        self.live.insert(addr, token);
        self.disconnected.retain(|a| *a != addr);

        tracing::info!(%addr, outbound, "Mesh link up");

        true
    }

    /// Tears down a mesh link: route entry, registration, socket, indexes.
    ///
    /// Safe to call again for an already-destroyed token.
    fn destroy_peer(&mut self, token: Token) {
        let Some(mut peer) = self.peers.remove(&token) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut peer.stream) {
            tracing::debug!(addr = %peer.addr, "Failed to deregister peer socket: {e}");
        }

        if let Err(e) = self.route.remove(peer.addr) {
            tracing::warn!(addr = %peer.addr, "Failed to remove route: {e:#}");
        }

        self.live.remove(&peer.addr);

        if peer.outbound
            && self.roster.contains_key(&peer.addr)
            && !self.disconnected.contains(&peer.addr)
        {
            self.disconnected.push(peer.addr);
        }

        tracing::info!(addr = %peer.addr, "Mesh link down");
    }

    fn dial(&mut self, addr: IpAddr, target: SocketAddr) {
        tracing::info!(%addr, "Dialing peer");

        let connected = match TcpStream::connect(target) {
            Ok(stream) => self.add_peer(stream, addr, true),
            Err(e) => {
                tracing::warn!(%addr, "Failed to start connecting: {e}");

                false
            }
        };

        if !connected && !self.disconnected.contains(&addr) {
            self.disconnected.push(addr);
        }
    }

    /// Loads the peer file and applies the delta to the running mesh.
    ///
    /// On a load error nothing changes. Peers present in both rosters are
    /// left entirely alone, so re-applying the same file is a no-op. All
    /// currently disconnected dial targets get another connection attempt.
    fn reload_roster(&mut self) -> Result<()> {
        let updated = reload::load_roster(
            &self.config.peer_file,
            self.config.port,
            self.config.self_v4.is_some(),
            self.config.self_v6.is_some(),
        )?;

        let removed = self
            .roster
            .keys()
            .filter(|addr| !updated.contains_key(addr))
            .copied()
            .collect::<Vec<_>>();

        for addr in removed {
            tracing::info!(%addr, "Peer removed from roster");

            self.roster.remove(&addr);
            self.disconnected.retain(|a| *a != addr);

            if let Some(token) = self.live.get(&addr).copied() {
                self.destroy_peer(token);
            }
        }

        // Retry before processing additions, so an addition whose first dial
        // fails is not dialed a second time within this same trigger.
        for addr in std::mem::take(&mut self.disconnected) {
            if self.live.contains_key(&addr) {
                continue;
            }

            let Some(target) = self.roster.get(&addr).map(|peer| peer.addr) else {
                continue;
            };

            self.dial(addr, target);
        }

        let added = updated
            .into_iter()
            .filter(|(addr, _)| !self.roster.contains_key(addr))
            .collect::<Vec<_>>();

        for (addr, peer) in added {
            tracing::info!(%addr, host = %peer.host, "Peer added to roster");

            let target = peer.addr;
            self.roster.insert(addr, peer);

            if should_dial(addr, self.config.self_v4, self.config.self_v6)
                && !self.live.contains_key(&addr)
            {
                self.dial(addr, target);
            }
        }

        Ok(())
    }
}

/// Reads from a peer socket until the kernel pushes back, framing complete
/// L3 packets out of the rx ring and towards the TUN device as they appear.
fn fill_peer_rx(peer: &mut PeerConn, tun: &mut TunEndpoint, stats: &mut Stats) -> Flow {
    loop {
        let (head, tail) = peer.rx.writable_regions();

        if head.is_empty() {
            // Ring full. Any complete packet in it must be moved out; a
            // single L3 packet can never span the entire ring, so no
            // progress here means the stream is garbage.
            let before = peer.rx.len();

            if let Err(e) = forward_to_tun(&mut peer.rx, tun, stats) {
                tracing::warn!(addr = %peer.addr, "Unframeable peer stream: {e}");

                return Flow::Kill;
            }

            if peer.rx.len() == before {
                tracing::warn!(addr = %peer.addr, "rx ring wedged mid-packet");

                return Flow::Kill;
            }

            continue;
        }

        let result = if tail.is_empty() {
            (&peer.stream).read(head)
        } else {
            (&peer.stream).read_vectored(&mut [IoSliceMut::new(head), IoSliceMut::new(tail)])
        };

        match result {
            Ok(0) => return Flow::Kill,
            Ok(n) => {
                peer.rx.commit_write(n);

                if let Err(e) = forward_to_tun(&mut peer.rx, tun, stats) {
                    tracing::warn!(addr = %peer.addr, "Unframeable peer stream: {e}");

                    return Flow::Kill;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Exhausted,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if peer::is_fatal(&e) => return Flow::Kill,
            Err(e) => {
                tracing::warn!(addr = %peer.addr, "Failed to receive from peer: {e}");

                return Flow::Exhausted;
            }
        }
    }
}

/// Moves every complete packet at the head of `rx` towards the TUN device.
///
/// Stops cleanly when the next packet is still partial; fails when the
/// stream no longer parses as L3 packets.
fn forward_to_tun(
    rx: &mut RingBuffer,
    tun: &mut TunEndpoint,
    stats: &mut Stats,
) -> Result<(), FrameError> {
    loop {
        let Some(len) = framer::peek_packet_len(rx)? else {
            return Ok(());
        };

        if rx.len() < len {
            return Ok(());
        }

        stats.world_rx.record(len);
        tun.push_packet(rx, len, &mut stats.tun_tx);
    }
}
