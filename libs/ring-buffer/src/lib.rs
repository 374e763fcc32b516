#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Fixed-capacity byte rings for single-threaded producer/consumer pairs.
//!
//! A [`RingBuffer`] lends out up to two contiguous slices on either side of
//! the wrap point so callers can hand them straight to vectored syscalls and
//! commit however many bytes the kernel actually moved.

mod assembly;

pub use assembly::AssemblyBuffer;

/// A fixed-capacity circular byte buffer with explicit wrap accounting.
///
/// Invariants: `start < capacity`, `end < capacity`. While un-wrapped the
/// used range is `[start, end)`; once the writer crosses the end of the
/// backing storage the used range is `[start, capacity) ∪ [0, end)`.
/// Empty means un-wrapped with `start == end`; full means wrapped with
/// `start == end`, so the entire capacity is usable.
///
/// Never allocates after construction.
pub struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    wrapped: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");

        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
            wrapped: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            self.buf.len() - self.start + self.end
        } else {
            self.end - self.start
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.wrapped && self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.wrapped && self.start == self.end
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.wrapped = false;
    }

    /// The free regions, in write order. The second is only non-empty while
    /// the used range does not wrap and some prefix of the storage is free.
    pub fn writable_regions(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.wrapped {
            (&mut self.buf[self.end..self.start], &mut [])
        } else {
            let (head, tail) = self.buf.split_at_mut(self.end);

            (tail, &mut head[..self.start])
        }
    }

    /// Marks `n` bytes, previously obtained via [`Self::writable_regions`],
    /// as written.
    pub fn commit_write(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        assert!(n <= self.free(), "commit_write past ring capacity");

        if self.wrapped {
            self.end += n;
        } else if self.end + n >= self.buf.len() {
            self.end = self.end + n - self.buf.len();
            self.wrapped = true;
        } else {
            self.end += n;
        }

        debug_assert!(self.end < self.buf.len());
        debug_assert!(!self.wrapped || self.end <= self.start);
    }

    /// The used regions, in read order.
    pub fn readable_regions(&self) -> (&[u8], &[u8]) {
        if self.wrapped {
            (&self.buf[self.start..], &self.buf[..self.end])
        } else {
            (&self.buf[self.start..self.end], &[])
        }
    }

    /// Consumes `n` bytes from the front.
    pub fn commit_read(&mut self, n: usize) {
        if n == 0 {
            return;
        }

        assert!(n <= self.len(), "commit_read past ring contents");

        if self.wrapped {
            if self.start + n >= self.buf.len() {
                self.start = self.start + n - self.buf.len();
                self.wrapped = false;
            } else {
                self.start += n;
            }
        } else {
            self.start += n;
        }

        debug_assert!(self.wrapped || self.start <= self.end);
    }

    /// Copies the whole of `data` in, or nothing if it does not fit.
    pub fn push_all(&mut self, data: &[u8]) -> bool {
        if data.len() > self.free() {
            return false;
        }

        let (a, b) = self.writable_regions();
        let first = a.len().min(data.len());
        a[..first].copy_from_slice(&data[..first]);
        b[..data.len() - first].copy_from_slice(&data[first..]);

        self.commit_write(data.len());

        true
    }

    /// Copies all of `parts` in as one unit, or nothing if the total does
    /// not fit.
    pub fn push_all_vectored(&mut self, parts: &[&[u8]]) -> bool {
        let total = parts.iter().map(|p| p.len()).sum::<usize>();

        if total > self.free() {
            return false;
        }

        for part in parts {
            let pushed = self.push_all(part);
            debug_assert!(pushed);
        }

        true
    }

    /// The byte at logical offset `index` from the front, if present.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        if index >= self.len() {
            return None;
        }

        let (a, b) = self.readable_regions();

        Some(if index < a.len() {
            a[index]
        } else {
            b[index - a.len()]
        })
    }

    /// Copies `out.len()` bytes from the front without consuming them.
    /// Returns `false` (and copies nothing) if fewer bytes are buffered.
    pub fn copy_to(&self, out: &mut [u8]) -> bool {
        if out.len() > self.len() {
            return false;
        }

        let (a, b) = self.readable_regions();
        let first = a.len().min(out.len());
        let total = out.len();
        out[..first].copy_from_slice(&a[..first]);
        out[first..].copy_from_slice(&b[..total - first]);

        true
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.buf.len())
            .field("len", &self.len())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("wrapped", &self.wrapped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn starts_empty() {
        let ring = RingBuffer::new(16);

        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.free(), 16);
    }

    #[test]
    fn entire_capacity_is_usable() {
        let mut ring = RingBuffer::new(8);

        assert!(ring.push_all(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(ring.is_full());
        assert_eq!(ring.free(), 0);

        let mut out = [0; 8];
        assert!(ring.copy_to(&mut out));
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn rejects_oversized_push_without_side_effects() {
        let mut ring = RingBuffer::new(8);
        assert!(ring.push_all(&[1, 2, 3]));

        assert!(!ring.push_all(&[0; 6]));

        assert_eq!(ring.len(), 3);
        let mut out = [0; 3];
        assert!(ring.copy_to(&mut out));
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn wraps_and_unwraps_across_the_boundary() {
        let mut ring = RingBuffer::new(8);

        assert!(ring.push_all(&[9, 1, 2, 3, 4, 5]));
        ring.commit_read(5);

        // Used range now starts at offset 5 of 8; three bytes must wrap.
        assert!(ring.push_all(&[6, 7, 8, 9, 10]));

        let (a, b) = ring.readable_regions();
        assert_eq!(a, &[5, 6, 7]);
        assert_eq!(b, &[8, 9, 10]);

        ring.commit_read(6);
        assert!(ring.is_empty());
    }

    #[test]
    fn write_ending_exactly_on_the_boundary_flips_wrapped() {
        let mut ring = RingBuffer::new(8);

        assert!(ring.push_all(&[0; 4]));
        ring.commit_read(3);
        assert!(ring.push_all(&[0; 4]));

        // `end` crossed back to zero, `start` is 3: not full, not empty.
        assert_eq!(ring.len(), 5);
        assert!(!ring.is_full());
        assert_eq!(ring.free(), 3);
    }

    #[test]
    fn regions_commit_protocol_moves_bytes() {
        let mut ring = RingBuffer::new(16);

        let (a, _) = ring.writable_regions();
        a[..5].copy_from_slice(b"hello");
        ring.commit_write(5);

        let (a, b) = ring.readable_regions();
        assert_eq!(a, b"hello");
        assert!(b.is_empty());

        ring.commit_read(5);
        assert!(ring.is_empty());
    }

    #[test]
    fn byte_at_reads_across_the_wrap() {
        let mut ring = RingBuffer::new(4);

        assert!(ring.push_all(&[1, 2, 3]));
        ring.commit_read(2);
        assert!(ring.push_all(&[4, 5, 6]));

        assert_eq!(ring.byte_at(0), Some(3));
        assert_eq!(ring.byte_at(1), Some(4));
        assert_eq!(ring.byte_at(2), Some(5));
        assert_eq!(ring.byte_at(3), Some(6));
        assert_eq!(ring.byte_at(4), None);
    }

    #[test]
    fn vectored_push_is_all_or_nothing() {
        let mut ring = RingBuffer::new(8);

        assert!(!ring.push_all_vectored(&[&[1; 5], &[2; 4]]));
        assert!(ring.is_empty());

        assert!(ring.push_all_vectored(&[&[1; 5], &[2; 3]]));
        assert!(ring.is_full());
    }

    #[proptest]
    fn round_trips_bytes_across_arbitrary_interleavings(
        #[strategy(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048))]
        data: Vec<u8>,
        #[strategy(proptest::collection::vec(1usize..64, 2..128))] chunks: Vec<usize>,
    ) {
        let mut ring = RingBuffer::new(97);
        let mut pushed = 0;
        let mut pulled = Vec::with_capacity(data.len());
        let mut step = 0;

        while pulled.len() < data.len() {
            let n = chunks[step % chunks.len()];
            step += 1;
            let take = n.min(data.len() - pushed).min(ring.free());
            assert!(ring.push_all(&data[pushed..pushed + take]));
            pushed += take;

            let n = chunks[step % chunks.len()];
            step += 1;
            let take = n.min(ring.len());
            let mut out = vec![0; take];
            assert!(ring.copy_to(&mut out));
            ring.commit_read(take);
            pulled.extend_from_slice(&out);
        }

        assert_eq!(pulled, data);
    }

    #[proptest]
    fn len_free_and_capacity_stay_consistent(
        #[strategy(proptest::collection::vec((0usize..32, 0usize..32), 1..64))]
        ops: Vec<(usize, usize)>,
    ) {
        let mut ring = RingBuffer::new(31);

        for (push, pull) in ops {
            let push = push.min(ring.free());
            assert!(ring.push_all(&vec![0xAB; push]));

            let pull = pull.min(ring.len());
            ring.commit_read(pull);

            assert_eq!(ring.len() + ring.free(), ring.capacity());
            let (a, b) = ring.readable_regions();
            assert_eq!(a.len() + b.len(), ring.len());
        }
    }
}
