// A bounded byte FIFO shared between exactly one producer and one consumer
//
// This is the thing the pipeline stages hand frames through. It is not a
// general-purpose channel: it is a plain byte ring, power-of-two sized so
// that wraparound is a bitmask, and it is intentionally lossy when full.
// Freshness beats completeness on this data path -- a stage that can't
// keep up should drop the newest frame rather than stall everyone behind
// it.
use std::sync::Mutex;

use crate::next_power_of_two;

struct RingInner {
    buf: Vec<u8>,
    /// capacity - 1, used as the index mask. Capacity is always a power
    /// of two so this is all-ones within the valid index range.
    mask: usize,
    /// total bytes ever written
    r_in: usize,
    /// total bytes ever read
    r_out: usize,
}

impl RingInner {
    fn len(&self) -> usize {
        self.r_in - self.r_out
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn put(&mut self, data: &[u8]) -> usize {
        let space = self.capacity() - self.len();
        let n = data.len().min(space);
        if n == 0 {
            return 0;
        }

        let start = self.r_in & self.mask;
        let first = n.min(self.capacity() - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..n]);
        }

        self.r_in += n;
        n
    }

    fn get(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        if n == 0 {
            return 0;
        }

        let start = self.r_out & self.mask;
        let first = n.min(self.capacity() - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }

        self.r_out += n;
        // Harmless re-basing: once the ring has drained, reset both
        // counters so they don't grow without bound over a long-running
        // pipeline.
        if self.r_in == self.r_out {
            self.r_in = 0;
            self.r_out = 0;
        }
        n
    }
}

/// A thread-safe bounded byte queue with a single producer and a single
/// consumer.
///
/// `put`/`get` each take the ring's mutex for their entire duration and
/// perform a wrap-split copy. There is no condvar or other signalling
/// primitive: a consumer that sees fewer bytes than it asked for should
/// retry later (see [`RingBuffer::blocking`] for the alternative used in
/// tests).
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    blocking: bool,
}

impl RingBuffer {
    /// Create a ring buffer of at least `capacity` bytes. Capacity is
    /// rounded up to the next power of two.
    pub fn new(capacity: usize) -> RingBuffer {
        let capacity = next_power_of_two(capacity);
        RingBuffer {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity],
                mask: capacity - 1,
                r_in: 0,
                r_out: 0,
            }),
            blocking: false,
        }
    }

    /// Create a ring buffer that blocks on a full `put` instead of
    /// dropping the offered data. This exists for deterministic test
    /// harnesses; the real-time pipeline always uses the default,
    /// lossy-on-full ring.
    pub fn blocking(capacity: usize) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity);
        ring.blocking = true;
        ring
    }

    /// Number of bytes currently readable.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity()
    }

    /// Write as much of `data` as fits. Returns the number of bytes
    /// actually written; a short write (`< data.len()`) means the ring
    /// was full and the remainder was discarded -- callers that care
    /// should log this as a dropped frame.
    ///
    /// In blocking mode, spins (with a short sleep) until the whole
    /// buffer has been written.
    pub fn put(&self, data: &[u8]) -> usize {
        if !self.blocking {
            return self.inner.lock().unwrap().put(data);
        }

        let mut written = 0;
        while written < data.len() {
            written += self.inner.lock().unwrap().put(&data[written..]);
            if written < data.len() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        written
    }

    /// Read up to `out.len()` bytes. Returns the number of bytes
    /// actually read; a short read means nothing (or not enough) was
    /// ready and the caller should retry.
    pub fn get(&self, out: &mut [u8]) -> usize {
        self.inner.lock().unwrap().get(out)
    }

    /// Convenience wrapper: read exactly `out.len()` bytes or nothing.
    /// Used by callers that only care about whole frames.
    pub fn get_frame(&self, out: &mut [u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() < out.len() {
            return false;
        }
        inner.get(out) == out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let r = RingBuffer::new(12);
        assert_eq!(r.capacity(), 16);
    }

    #[test]
    fn put_then_get_roundtrips() {
        let r = RingBuffer::new(16);
        let data: Vec<u8> = (1..=12).collect();
        assert_eq!(r.put(&data), 12);
        assert_eq!(r.len(), 12);

        let mut out = vec![0u8; 12];
        assert_eq!(r.get(&mut out), 12);
        assert_eq!(out, data);
    }

    // Scenario 1 from the testable-properties list: allocate size 16,
    // put 12 bytes [1..12], get 8, put 8 bytes [13..20]. len() -> 12; a
    // subsequent get of 12 yields [9..20].
    #[test]
    fn ring_wrap_scenario() {
        let r = RingBuffer::new(16);
        let first: Vec<u8> = (1..=12).collect();
        r.put(&first);

        let mut drained = vec![0u8; 8];
        r.get(&mut drained);
        assert_eq!(drained, (1..=8).collect::<Vec<u8>>());

        let second: Vec<u8> = (13..=20).collect();
        r.put(&second);

        assert_eq!(r.len(), 12);

        let mut out = vec![0u8; 12];
        r.get(&mut out);
        assert_eq!(out, (9..=20).collect::<Vec<u8>>());
    }

    #[test]
    fn short_put_drops_excess_and_keeps_ring_intact() {
        let r = RingBuffer::new(8);
        let data: Vec<u8> = (1..=10).collect();
        let written = r.put(&data);
        assert_eq!(written, 8);
        assert_eq!(r.len(), 8);

        let mut out = vec![0u8; 8];
        r.get(&mut out);
        assert_eq!(out, (1..=8).collect::<Vec<u8>>());
    }

    #[test]
    fn get_rebases_counters_when_drained() {
        let r = RingBuffer::new(8);
        for _ in 0..5 {
            r.put(&[1, 2, 3, 4]);
            let mut out = [0u8; 4];
            assert!(r.get_frame(&mut out));
            assert_eq!(out, [1, 2, 3, 4]);
        }
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn short_get_means_nothing_ready() {
        let r = RingBuffer::new(16);
        r.put(&[1, 2, 3]);
        let mut out = [0u8; 8];
        assert!(!r.get_frame(&mut out));
        // data must still be there, untouched, for the next poll
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn blocking_ring_never_drops() {
        let r = RingBuffer::blocking(8);
        let producer_data: Vec<u8> = (0..32).collect();
        let ring = std::sync::Arc::new(r);
        let ring2 = ring.clone();

        let handle = std::thread::spawn(move || {
            for chunk in producer_data.chunks(4) {
                ring2.put(chunk);
            }
        });

        let mut collected = Vec::new();
        while collected.len() < 32 {
            let mut buf = [0u8; 4];
            if ring.get_frame(&mut buf) {
                collected.extend_from_slice(&buf);
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        handle.join().unwrap();

        assert_eq!(collected, (0..32).collect::<Vec<u8>>());
    }
}
