use ring_buffer::{AssemblyBuffer, RingBuffer};
use std::io::{self, IoSlice};
use tun::Tun;

use crate::framer;
use crate::stats::Counters;

/// Queue towards the TUN device. Every peer's receive side feeds it, so it
/// is sized well above the per-peer rings.
pub const TUN_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// One read per call; a TUN read never returns more than one L3 packet.
const READ_BUF_LEN: usize = u16::MAX as usize;

/// The TUN device with its transmit queue and staging buffers.
///
/// Writes towards the kernel are all-or-nothing per L3 packet: a packet is
/// delivered in a single `write`/`writev` or it stays queued in full.
pub struct TunEndpoint {
    pub tun: Tun,
    pub tx: RingBuffer,
    pub read_buf: Box<[u8]>,
    assembly: AssemblyBuffer,
}

impl TunEndpoint {
    pub fn new(tun: Tun) -> Self {
        Self::with_ring_capacity(tun, TUN_RING_CAPACITY)
    }

    pub fn with_ring_capacity(tun: Tun, capacity: usize) -> Self {
        Self {
            tun,
            tx: RingBuffer::new(capacity),
            read_buf: vec![0; READ_BUF_LEN].into_boxed_slice(),
            assembly: AssemblyBuffer::new(),
        }
    }

    /// Moves one whole packet of `len` bytes from the head of `rx` towards
    /// the TUN device.
    ///
    /// With an empty queue the packet is written directly from the ring,
    /// vectored across its wrap point if needed. Otherwise it is queued in
    /// full behind the packets already waiting, or dropped and counted when
    /// the queue cannot hold all of it.
    pub fn push_packet(&mut self, rx: &mut RingBuffer, len: usize, tun_tx: &mut Counters) {
        debug_assert!(rx.len() >= len);

        if self.tx.is_empty() {
            let (head, tail) = rx.readable_regions();

            let result = if head.len() >= len {
                self.tun.write(&head[..len])
            } else {
                self.tun
                    .write_vectored(&[IoSlice::new(head), IoSlice::new(&tail[..len - head.len()])])
            };

            match result {
                Ok(_) => {
                    rx.commit_read(len);
                    tun_tx.record(len);

                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::warn!("Failed to write packet to TUN: {e}");
                }
            }
        }

        let (head, tail) = rx.readable_regions();
        let first = head.len().min(len);

        if self.tx.push_all_vectored(&[&head[..first], &tail[..len - first]]) {
            rx.commit_read(len);
        } else {
            rx.commit_read(len);
            tun_tx.record_drop(len);
        }
    }

    /// Flushes queued packets to the TUN device, one whole packet per write.
    ///
    /// A packet wrapping the ring boundary has its head fragment staged in
    /// the assembly buffer so the kernel still sees a single vectored write.
    pub fn drain(&mut self, tun_tx: &mut Counters) {
        loop {
            let len = match framer::peek_packet_len(&self.tx) {
                Ok(Some(len)) => len,
                Ok(None) => return,
                Err(e) => {
                    // Only whole, pre-validated packets are ever queued.
                    debug_assert!(false, "corrupt TUN queue: {e}");
                    self.tx.clear();

                    return;
                }
            };

            if self.tx.len() < len {
                debug_assert!(false, "partial packet in TUN queue");
                self.tx.clear();

                return;
            }

            let (head, tail) = self.tx.readable_regions();

            let result = if head.len() >= len {
                self.tun.write(&head[..len])
            } else {
                self.assembly.stage(head);
                self.tun.write_vectored(&[
                    IoSlice::new(self.assembly.as_slice()),
                    IoSlice::new(&tail[..len - head.len()]),
                ])
            };

            match result {
                Ok(_) => {
                    self.tx.commit_read(len);
                    tun_tx.record(len);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Failed to write packet to TUN: {e}");

                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    fn endpoint(ring_capacity: usize) -> (TunEndpoint, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        theirs.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let tun = Tun::from_fd(ours.into()).unwrap();

        (TunEndpoint::with_ring_capacity(tun, ring_capacity), theirs)
    }

    fn v4_packet(total_len: usize, fill: u8) -> Vec<u8> {
        assert!(total_len >= framer::MIN_IPV4_HEADER);

        let mut packet = vec![fill; total_len];
        packet[0] = 0x45;
        packet[1] = 0;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());

        packet
    }

    fn recv(theirs: &UnixDatagram) -> Vec<u8> {
        let mut buf = vec![0u8; u16::MAX as usize];
        let n = theirs.recv(&mut buf).unwrap();
        buf.truncate(n);

        buf
    }

    #[test]
    fn empty_queue_writes_straight_from_the_rx_ring() {
        let (mut endpoint, theirs) = endpoint(2048);
        let mut tun_tx = Counters::default();

        let packet = v4_packet(300, 0xAA);
        let mut rx = RingBuffer::new(4096);
        assert!(rx.push_all(&packet));

        endpoint.push_packet(&mut rx, packet.len(), &mut tun_tx);

        assert_eq!(recv(&theirs), packet);
        assert!(rx.is_empty());
        assert!(endpoint.tx.is_empty());
        assert_eq!(tun_tx.packets, 1);
    }

    #[test]
    fn direct_write_is_vectored_across_the_rx_wrap() {
        let (mut endpoint, theirs) = endpoint(8192);
        let mut tun_tx = Counters::default();

        let packet = v4_packet(1500, 0xBB);
        let mut rx = RingBuffer::new(2048);
        // Park the ring head so the packet wraps.
        assert!(rx.push_all(&vec![0; 1700]));
        rx.commit_read(1700);
        assert!(rx.push_all(&packet));

        endpoint.push_packet(&mut rx, packet.len(), &mut tun_tx);

        assert_eq!(recv(&theirs), packet);
    }

    #[test]
    fn wrapped_queued_packet_is_emitted_in_one_piece() {
        let (mut endpoint, theirs) = endpoint(2048);
        let mut tun_tx = Counters::default();

        // Park the queue head at 1700 of 2048, then queue a 1500-byte
        // packet across the boundary.
        assert!(endpoint.tx.push_all(&vec![0; 1700]));
        endpoint.tx.commit_read(1700);

        let packet = v4_packet(1500, 0xCC);
        assert!(endpoint.tx.push_all(&packet));

        endpoint.drain(&mut tun_tx);

        assert_eq!(recv(&theirs), packet);
        assert!(endpoint.tx.is_empty());
        assert_eq!(tun_tx.packets, 1);
        assert_eq!(tun_tx.bytes, 1500);
    }

    #[test]
    fn queued_packets_drain_in_order() {
        let (mut endpoint, theirs) = endpoint(4096);
        let mut tun_tx = Counters::default();

        let first = v4_packet(100, 0x01);
        let second = v4_packet(200, 0x02);
        assert!(endpoint.tx.push_all(&first));
        assert!(endpoint.tx.push_all(&second));

        endpoint.drain(&mut tun_tx);

        assert_eq!(recv(&theirs), first);
        assert_eq!(recv(&theirs), second);
        assert_eq!(tun_tx.packets, 2);
    }

    #[test]
    fn full_queue_drops_the_packet_whole() {
        let (mut endpoint, _theirs) = endpoint(1024);
        let mut tun_tx = Counters::default();

        // Occupy the queue so the direct path is off and space is short.
        let filler = v4_packet(900, 0x00);
        assert!(endpoint.tx.push_all(&filler));

        let packet = v4_packet(300, 0xDD);
        let mut rx = RingBuffer::new(2048);
        assert!(rx.push_all(&packet));

        endpoint.push_packet(&mut rx, packet.len(), &mut tun_tx);

        // Consumed from the rx ring, not queued, counted as dropped.
        assert!(rx.is_empty());
        assert_eq!(endpoint.tx.len(), filler.len());
        assert_eq!(tun_tx.drop_packets, 1);
        assert_eq!(tun_tx.drop_bytes, 300);
    }

    #[test]
    fn queues_behind_pending_packets() {
        let (mut endpoint, theirs) = endpoint(4096);
        let mut tun_tx = Counters::default();

        let first = v4_packet(100, 0x01);
        assert!(endpoint.tx.push_all(&first));

        let second = v4_packet(200, 0x02);
        let mut rx = RingBuffer::new(2048);
        assert!(rx.push_all(&second));

        endpoint.push_packet(&mut rx, second.len(), &mut tun_tx);

        assert!(rx.is_empty());

        endpoint.drain(&mut tun_tx);

        assert_eq!(recv(&theirs), first);
        assert_eq!(recv(&theirs), second);
    }
}
