use ring_buffer::RingBuffer;
use std::net::IpAddr;

pub const MIN_IPV4_HEADER: usize = 20;
pub const IPV6_HEADER: usize = 40;

/// Why a peer's byte stream stopped making sense as a sequence of L3 packets.
///
/// Both variants are fatal to the connection they occur on: a TCP stream
/// carries no resynchronisation points, so once framing is lost it is lost
/// for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("leading octet {0:#04x} is not an IPv4 or IPv6 header start")]
    NotIp(u8),
    #[error("IPv4 total length {0} is shorter than the minimal header")]
    BogusLength(u16),
}

/// Determines the total length of the L3 packet at the head of `ring`.
///
/// `Ok(None)` means not enough bytes are buffered to tell yet; the caller
/// retries once more arrive. The header, including the length field itself,
/// may straddle the ring's wrap point.
pub fn peek_packet_len(ring: &RingBuffer) -> Result<Option<usize>, FrameError> {
    let Some(first) = ring.byte_at(0) else {
        return Ok(None);
    };

    match first >> 4 {
        4 => {
            if ring.len() < MIN_IPV4_HEADER {
                return Ok(None);
            }

            let mut prefix = [0u8; 4];
            let copied = ring.copy_to(&mut prefix);
            debug_assert!(copied);

            let total = u16::from_be_bytes([prefix[2], prefix[3]]);

            if (total as usize) < MIN_IPV4_HEADER {
                return Err(FrameError::BogusLength(total));
            }

            Ok(Some(total as usize))
        }
        6 => {
            if ring.len() < IPV6_HEADER {
                return Ok(None);
            }

            let mut prefix = [0u8; 6];
            let copied = ring.copy_to(&mut prefix);
            debug_assert!(copied);

            let payload = u16::from_be_bytes([prefix[4], prefix[5]]);

            Ok(Some(payload as usize + IPV6_HEADER))
        }
        _ => Err(FrameError::NotIp(first)),
    }
}

/// Destination address of a whole, contiguous L3 packet.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let header = etherparse::Ipv4HeaderSlice::from_slice(packet).ok()?;

            Some(IpAddr::V4(header.destination_addr()))
        }
        6 => {
            let header = etherparse::Ipv6HeaderSlice::from_slice(packet).ok()?;

            Some(IpAddr::V6(header.destination_addr()))
        }
        _ => None,
    }
}
