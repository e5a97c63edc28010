//! Lock-free single-producer/single-consumer byte FIFO.
//!
//! One writer and one reader may operate concurrently without locking.
//! Positions are monotonically increasing byte counters; the buffer index
//! is `position % capacity`. The writer owns `[write, read + capacity)`,
//! the reader owns `[read, write)`; the regions never overlap. Writes are
//! published with a release store of the write position, consumption with
//! a release store of the read position, so each side observes the other's
//! data after an acquire load of the opposing index.
//!
//! The reader role may move between threads (the producer drains or skips
//! a slot the worker is not playing), but callers must ensure only one
//! reader is active at a time; same for the writer role.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct ByteRing {
    /// Per-byte cells so both sides can hold references into disjoint
    /// regions without ever forming a reference to the whole buffer.
    buf: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Total bytes consumed.
    read: AtomicUsize,
    /// Total bytes produced.
    write: AtomicUsize,
}

// The disjoint-region argument above is what makes the raw buffer sharable.
unsafe impl Sync for ByteRing {}

impl ByteRing {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            capacity,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    /// Bytes buffered and not yet consumed.
    pub(crate) fn used(&self) -> usize {
        self.write.load(Ordering::Acquire) - self.read.load(Ordering::Acquire)
    }

    /// Bytes of free space.
    pub(crate) fn free(&self) -> usize {
        self.capacity - self.used()
    }

    /// Writer side: appends as much of `src` as fits, in at most two
    /// copies around the wrap point. Returns the number of bytes written,
    /// which may be less than `src.len()` when the ring is full.
    pub(crate) fn write(&self, src: &[u8]) -> usize {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let n = src.len().min(self.capacity - (write - read));
        if n == 0 {
            return 0;
        }
        let pos = write % self.capacity;
        let first = n.min(self.capacity - pos);
        // Safety: the writer region [write, read + capacity) is not touched
        // by the reader; positions are published only after the copy.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(pos), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.base(), n - first);
        }
        self.write.store(write + n, Ordering::Release);
        n
    }

    /// Reader side: hands the longest contiguous run of buffered bytes to
    /// `consume`, which may mutate them in place (software amplifier) and
    /// returns how many of them it actually took. The ring advances by
    /// that amount, which is also returned.
    ///
    /// The run stops at the wrap point; call again to continue reading.
    /// An empty ring yields an empty slice.
    pub(crate) fn read_with<F>(&self, consume: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        let used = write - read;
        let pos = read % self.capacity;
        let run = used.min(self.capacity - pos);
        // Safety: the reader region [read, write) is not touched by the
        // writer; the acquire load above synchronizes with its release.
        let chunk = unsafe { std::slice::from_raw_parts_mut(self.base().add(pos), run) };
        let taken = consume(chunk).min(run);
        if taken > 0 {
            self.read.store(read + taken, Ordering::Release);
        }
        taken
    }

    /// Reader side: drops up to `n` buffered bytes and returns how many
    /// were dropped.
    pub(crate) fn discard(&self, n: usize) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        let n = n.min(write - read);
        self.read.store(read + n, Ordering::Release);
        n
    }

    /// Drops everything buffered. Reader side, like [`discard`](Self::discard).
    pub(crate) fn reset(&self) {
        self.discard(usize::MAX);
    }
}

/// Views interleaved 16-bit samples as raw bytes for ring writes.
pub(crate) fn sample_bytes(samples: &[i16]) -> &[u8] {
    // Safety: i16 has no padding or invalid bit patterns and a stricter
    // alignment than u8; the length doubles.
    unsafe { std::slice::from_raw_parts(samples.as_ptr().cast(), samples.len() * 2) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain(ring: &ByteRing) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let n = ring.read_with(|chunk| {
                out.extend_from_slice(chunk);
                chunk.len()
            });
            if n == 0 {
                break;
            }
        }
        out
    }

    #[test]
    fn test_write_then_read() {
        let ring = ByteRing::new(16);
        assert_eq!(ring.write(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.used(), 4);
        assert_eq!(ring.free(), 12);
        assert_eq!(drain(&ring), vec![1, 2, 3, 4]);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn test_write_truncates_when_full() {
        let ring = ByteRing::new(4);
        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(ring.write(&[7]), 0);
        assert_eq!(drain(&ring), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_wrap_is_two_runs() {
        let ring = ByteRing::new(8);
        ring.write(&[0; 6]);
        ring.discard(6);
        // 6 bytes in, wrapping after 2
        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6]), 6);

        let mut runs = Vec::new();
        loop {
            let n = ring.read_with(|chunk| {
                if !chunk.is_empty() {
                    runs.push(chunk.to_vec());
                }
                chunk.len()
            });
            if n == 0 {
                break;
            }
        }
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], vec![1, 2]);
        assert_eq!(runs[1], vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_partial_consume_advances_partially() {
        let ring = ByteRing::new(16);
        ring.write(&[1, 2, 3, 4]);
        let n = ring.read_with(|chunk| {
            assert_eq!(chunk.len(), 4);
            2
        });
        assert_eq!(n, 2);
        assert_eq!(ring.used(), 2);
        assert_eq!(drain(&ring), vec![3, 4]);
    }

    #[test]
    fn test_consumer_may_mutate_in_place() {
        let ring = ByteRing::new(16);
        ring.write(&[1, 2, 3, 4]);
        ring.read_with(|chunk| {
            chunk.fill(0);
            0 // peek only
        });
        assert_eq!(drain(&ring), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_discard_and_reset() {
        let ring = ByteRing::new(16);
        ring.write(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.discard(2), 2);
        assert_eq!(ring.used(), 3);
        ring.reset();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.discard(10), 0);
    }

    #[test]
    fn test_sample_bytes_round_trip() {
        let samples = [0x0102i16, -2];
        let bytes = sample_bytes(&samples);
        assert_eq!(bytes.len(), 4);
        assert_eq!(i16::from_ne_bytes([bytes[0], bytes[1]]), 0x0102);
        assert_eq!(i16::from_ne_bytes([bytes[2], bytes[3]]), -2);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(ByteRing::new(1024));
        let total: usize = 64 * 1024;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < total {
                    let byte = (sent % 251) as u8;
                    sent += ring.write(&[byte]);
                }
            })
        };

        let mut received = 0usize;
        let mut ok = true;
        while received < total {
            ring.read_with(|chunk| {
                for &b in chunk.iter() {
                    if b != (received % 251) as u8 {
                        ok = false;
                    }
                    received += 1;
                }
                chunk.len()
            });
        }

        producer.join().unwrap();
        assert!(ok, "byte stream arrived out of order or corrupted");
        assert_eq!(ring.used(), 0);
    }
}
