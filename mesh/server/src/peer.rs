use mio::net::TcpStream;
use ring_buffer::RingBuffer;
use std::io::{self, IoSlice, Write as _};
use std::net::IpAddr;

/// Buffering per direction of a mesh link. Must exceed the largest possible
/// L3 packet (64 KiB) so a full ring always contains at least one whole one.
pub const PEER_RING_CAPACITY: usize = 128 * 1024;

/// Outcome of servicing one side of an endpoint for one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Progressed as far as the kernel allows; yield back to the poller.
    Exhausted,
    /// The connection is dead and the endpoint must be destroyed.
    Kill,
}

/// A live mesh link, inbound or outbound, keyed by the remote node address.
pub struct PeerConn {
    pub stream: TcpStream,
    pub addr: IpAddr,
    pub outbound: bool,
    pub rx: RingBuffer,
    pub tx: RingBuffer,
}

impl PeerConn {
    pub fn new(stream: TcpStream, addr: IpAddr, outbound: bool) -> Self {
        Self {
            stream,
            addr,
            outbound,
            rx: RingBuffer::new(PEER_RING_CAPACITY),
            tx: RingBuffer::new(PEER_RING_CAPACITY),
        }
    }

    /// Pushes queued bytes into the socket until the kernel pushes back.
    ///
    /// The ring advances by however many bytes the kernel accepted; packet
    /// boundaries within the stream are the remote framer's business.
    pub fn drain_tx(&mut self) -> Flow {
        loop {
            let (head, tail) = self.tx.readable_regions();

            if head.is_empty() {
                return Flow::Exhausted;
            }

            let result = if tail.is_empty() {
                (&self.stream).write(head)
            } else {
                (&self.stream).write_vectored(&[IoSlice::new(head), IoSlice::new(tail)])
            };

            match result {
                Ok(0) => return Flow::Exhausted,
                Ok(sent) => self.tx.commit_read(sent),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Exhausted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_fatal(&e) => return Flow::Kill,
                Err(e) => {
                    tracing::warn!(addr = %self.addr, "Failed to send to peer: {e}");

                    return Flow::Exhausted;
                }
            }
        }
    }
}

/// Errors that mean the TCP stream is beyond recovery.
pub fn is_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let ours = TcpStream::connect(addr).unwrap();
        let (theirs, _) = listener.accept().unwrap();

        (ours, theirs)
    }

    #[test]
    fn drain_moves_queued_bytes_onto_the_wire() {
        let (ours, mut theirs) = connected_pair();
        let mut peer = PeerConn::new(ours, "127.0.0.1".parse().unwrap(), true);

        assert!(peer.tx.push_all(b"across the mesh"));

        // A fresh connect may still be in progress; retry until the kernel
        // accepts the bytes.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert_eq!(peer.drain_tx(), Flow::Exhausted);

            if peer.tx.is_empty() {
                break;
            }

            assert!(std::time::Instant::now() < deadline, "bytes never drained");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let mut buf = [0u8; 15];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"across the mesh");
    }

    #[test]
    fn drain_spans_the_ring_wrap() {
        let (ours, mut theirs) = connected_pair();
        let mut peer = PeerConn::new(ours, "127.0.0.1".parse().unwrap(), true);

        // Stage data that wraps around the ring boundary.
        let junk = vec![0u8; PEER_RING_CAPACITY - 5];
        assert!(peer.tx.push_all(&junk));
        peer.tx.commit_read(junk.len());
        assert!(peer.tx.push_all(b"0123456789"));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !peer.tx.is_empty() {
            assert_eq!(peer.drain_tx(), Flow::Exhausted);
            assert!(std::time::Instant::now() < deadline, "bytes never drained");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let mut buf = [0u8; 10];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
    }
}
