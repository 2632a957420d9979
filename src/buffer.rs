use bytes::{Buf, BytesMut};

/// Growable receive buffer with partial-consumption support.
///
/// Reads land in the spare capacity; the data callback consumes some prefix
/// and the remainder stays in place for the next invocation, no copying.
/// Capacity doubles whenever a read fills the buffer, up to a per-session
/// ceiling. At the ceiling with a full buffer, reads pause until the
/// application consumes.
pub(crate) struct RecvBuffer {
    buf: BytesMut,
    cap: usize,
    max: usize,
}

impl RecvBuffer {
    pub fn new(initial: usize, max: usize) -> Self {
        let max = max.max(initial).max(1);
        let cap = initial.clamp(1, max);
        RecvBuffer {
            buf: BytesMut::with_capacity(cap),
            cap,
            max,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop `n` consumed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Writable spare space for the next read, growing first if the previous
    /// read filled the buffer. `None` when full at the ceiling.
    pub fn spare_mut(&mut self) -> Option<&mut [u8]> {
        if self.buf.len() >= self.cap {
            if self.cap >= self.max {
                return None;
            }
            self.cap = (self.cap * 2).min(self.max);
        }
        let want = self.cap - self.buf.len();
        self.buf.reserve(want);
        let spare = self.buf.spare_capacity_mut();
        let n = spare.len().min(want);
        let ptr = spare.as_mut_ptr().cast::<u8>();
        // Zero the region first so the returned slice refers to initialized
        // memory; only `commit` extends the logical length.
        unsafe {
            ptr.write_bytes(0, n);
            Some(std::slice::from_raw_parts_mut(ptr, n))
        }
    }

    /// Mark `n` bytes of the spare space as filled.
    pub fn commit(&mut self, n: usize) {
        let len = self.buf.len();
        assert!(len + n <= self.buf.capacity());
        unsafe { self.buf.set_len(len + n) };
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut RecvBuffer, data: &[u8]) -> usize {
        let spare = buf.spare_mut().unwrap();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        buf.commit(n);
        n
    }

    #[test]
    fn test_partial_consume_retains_remainder() {
        let mut b = RecvBuffer::new(16, 64);
        fill(&mut b, b"hello world");
        b.consume(6);
        assert_eq!(b.as_slice(), b"world");
        fill(&mut b, b"!");
        assert_eq!(b.as_slice(), b"world!");
    }

    #[test]
    fn test_full_consume_empties() {
        let mut b = RecvBuffer::new(8, 64);
        fill(&mut b, b"abcd");
        b.consume(4);
        assert!(b.is_empty());
    }

    #[test]
    fn test_grows_by_doubling_after_full_read() {
        let mut b = RecvBuffer::new(4, 64);
        assert_eq!(fill(&mut b, b"abcdefgh"), 4);
        assert_eq!(b.capacity(), 4);
        // Buffer was filled, so the next read grows first.
        assert_eq!(fill(&mut b, b"efgh"), 4);
        assert_eq!(b.capacity(), 8);
        assert_eq!(b.as_slice(), b"abcdefgh");
    }

    #[test]
    fn test_spare_is_initialized() {
        let mut b = RecvBuffer::new(8, 16);
        assert!(b.spare_mut().unwrap().iter().all(|&x| x == 0));
        // Still zeroed after growth exposes fresh capacity.
        fill(&mut b, b"xxxxxxxx");
        assert!(b.spare_mut().unwrap().iter().all(|&x| x == 0));
    }

    #[test]
    fn test_ceiling_blocks_reads_until_consumed() {
        let mut b = RecvBuffer::new(4, 8);
        fill(&mut b, b"aaaa");
        fill(&mut b, b"bbbb");
        assert_eq!(b.capacity(), 8);
        assert!(b.spare_mut().is_none());
        b.consume(2);
        assert!(b.spare_mut().is_some());
    }
}
